//! In-memory source for tests and demos

use super::{CandidateStream, SourceConnector, SourceError};
use crate::article::CandidateArticle;
use async_trait::async_trait;
use chrono::NaiveDate;
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Injected failure for one date
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Failure {
    /// `fetch` itself returns the error
    OnOpen(String),
    /// The stream yields this many candidates, then the error
    AfterItems(usize, String),
}

/// A connector backed by a fixed map of date → candidates.
///
/// Failures can be set and cleared after the source is shared, which is how
/// retry tests make a unit fail once and succeed on the second attempt.
pub struct StaticSource {
    id: String,
    name: String,
    articles: HashMap<NaiveDate, Vec<CandidateArticle>>,
    failures: Mutex<HashMap<NaiveDate, Failure>>,
    delay: Option<Duration>,
    fetches: AtomicUsize,
}

impl StaticSource {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            articles: HashMap::new(),
            failures: Mutex::new(HashMap::new()),
            delay: None,
            fetches: AtomicUsize::new(0),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_articles(mut self, date: NaiveDate, articles: Vec<CandidateArticle>) -> Self {
        self.articles.entry(date).or_default().extend(articles);
        self
    }

    /// Sleep before yielding each candidate.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn set_failure(&self, date: NaiveDate, failure: Failure) {
        self.failures.lock().unwrap().insert(date, failure);
    }

    pub fn clear_failure(&self, date: NaiveDate) {
        self.failures.lock().unwrap().remove(&date);
    }

    /// How many times `fetch` has been called.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceConnector for StaticSource {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self, date: NaiveDate) -> Result<CandidateStream, SourceError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let failure = self.failures.lock().unwrap().get(&date).cloned();

        let mut items: Vec<Result<CandidateArticle, SourceError>> = self
            .articles
            .get(&date)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .map(Ok)
            .collect();

        match failure {
            Some(Failure::OnOpen(msg)) => return Err(SourceError::Failed(msg)),
            Some(Failure::AfterItems(n, msg)) => {
                items.truncate(n);
                items.push(Err(SourceError::Failed(msg)));
            }
            None => {}
        }

        match self.delay {
            Some(delay) => Ok(stream::iter(items)
                .then(move |item| async move {
                    tokio::time::sleep(delay).await;
                    item
                })
                .boxed()),
            None => Ok(stream::iter(items).boxed()),
        }
    }
}
