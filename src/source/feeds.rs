//! The synthetic feed-set connector

use super::{CandidateStream, SourceConnector, SourceError, FEED_SET_SOURCE};
use async_trait::async_trait;
use chrono::NaiveDate;
use futures::stream::{self, StreamExt};
use std::sync::Arc;

/// Fans one day's fetch out across a subset of configured feeds.
///
/// Feed failures are isolated: a feed that can't be opened, or that errors
/// mid-stream, is logged and skipped while the others keep flowing. The
/// unit only fails when every feed fails to open.
pub struct FeedSetSource {
    feeds: Vec<Arc<dyn SourceConnector>>,
}

impl FeedSetSource {
    pub fn new(feeds: Vec<Arc<dyn SourceConnector>>) -> Self {
        Self { feeds }
    }

    pub fn feed_ids(&self) -> Vec<&str> {
        self.feeds.iter().map(|f| f.id()).collect()
    }
}

#[async_trait]
impl SourceConnector for FeedSetSource {
    fn id(&self) -> &str {
        FEED_SET_SOURCE
    }

    async fn fetch(&self, date: NaiveDate) -> Result<CandidateStream, SourceError> {
        let mut opened = Vec::with_capacity(self.feeds.len());
        let mut last_error = None;

        for feed in &self.feeds {
            match feed.fetch(date).await {
                Ok(s) => {
                    let feed_id = feed.id().to_string();
                    let feed_name = feed.name().to_string();
                    let s = s.filter_map(move |item| {
                        let feed_id = feed_id.clone();
                        let feed_name = feed_name.clone();
                        async move {
                            match item {
                                Ok(mut c) => {
                                    if c.source_name.is_empty() {
                                        c.source_name = feed_name;
                                    }
                                    Some(Ok(c))
                                }
                                Err(e) => {
                                    tracing::warn!(feed = %feed_id, %date, error = %e, "feed stream error, skipping rest of feed");
                                    None
                                }
                            }
                        }
                    });
                    opened.push(s.boxed());
                }
                Err(e) => {
                    tracing::warn!(feed = feed.id(), %date, error = %e, "feed fetch failed");
                    last_error = Some(e);
                }
            }
        }

        if opened.is_empty() {
            return Err(last_error.unwrap_or_else(|| SourceError::Unavailable("no feeds selected".into())));
        }
        Ok(stream::iter(opened).flatten().boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::article::CandidateArticle;
    use crate::source::{Failure, StaticSource};
    use futures::TryStreamExt;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 2, 20).unwrap()
    }

    #[tokio::test]
    async fn test_failing_feed_is_skipped() {
        let good = StaticSource::new("openai")
            .with_name("OpenAI Blog")
            .with_articles(day(), vec![CandidateArticle::new("GPT news", "https://openai.example/1")]);
        let bad = StaticSource::new("broken");
        bad.set_failure(day(), Failure::OnOpen("403".into()));

        let set = FeedSetSource::new(vec![Arc::new(bad), Arc::new(good)]);
        let items: Vec<CandidateArticle> = set.fetch(day()).await.unwrap().try_collect().await.unwrap();

        assert_eq!(items.len(), 1);
        assert_eq!(items[0].source_name, "OpenAI Blog");
    }

    #[tokio::test]
    async fn test_all_feeds_failing_fails_the_fetch() {
        let bad = StaticSource::new("broken");
        bad.set_failure(day(), Failure::OnOpen("dns".into()));
        let set = FeedSetSource::new(vec![Arc::new(bad)]);
        assert!(set.fetch(day()).await.is_err());
    }

    #[tokio::test]
    async fn test_mid_stream_error_keeps_items_before_it() {
        let feed = StaticSource::new("flaky").with_articles(
            day(),
            vec![
                CandidateArticle::new("one", "https://f.example/1"),
                CandidateArticle::new("two", "https://f.example/2"),
            ],
        );
        feed.set_failure(day(), Failure::AfterItems(1, "reset".into()));
        let set = FeedSetSource::new(vec![Arc::new(feed)]);
        let items: Vec<CandidateArticle> = set.fetch(day()).await.unwrap().try_collect().await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].title, "one");
    }
}
