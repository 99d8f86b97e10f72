use super::{AudienceScores, Category, EnrichmentError, EnrichmentPayload, EnrichmentRequest, Enricher};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Mock enricher for testing — returns preconfigured responses.
///
/// Responses are keyed by article title. Titles without a registered
/// response get the default payload (tags derived from the title words).
pub struct MockEnricher {
    responses: Mutex<HashMap<String, Result<EnrichmentPayload, EnrichmentError>>>,
    default_category: Category,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl MockEnricher {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(HashMap::new()),
            default_category: Category::IndustryNews,
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// Register a payload for a specific title.
    pub fn with_response(self, title: impl Into<String>, payload: EnrichmentPayload) -> Self {
        self.responses.lock().unwrap().insert(title.into(), Ok(payload));
        self
    }

    /// Register a failure for a specific title.
    pub fn with_failure(self, title: impl Into<String>, error: EnrichmentError) -> Self {
        self.set_failure(title, error);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_default_category(mut self, category: Category) -> Self {
        self.default_category = category;
        self
    }

    pub fn set_failure(&self, title: impl Into<String>, error: EnrichmentError) {
        self.responses.lock().unwrap().insert(title.into(), Err(error));
    }

    /// Forget any registered response for a title.
    pub fn clear(&self, title: &str) {
        self.responses.lock().unwrap().remove(title);
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// The payload returned for unregistered titles.
    pub fn default_payload(&self, title: &str) -> EnrichmentPayload {
        let mut tags: Vec<String> = Vec::new();
        for word in title.split_whitespace() {
            let w = word.to_lowercase();
            if w.len() > 3 && !tags.contains(&w) {
                tags.push(w);
            }
        }
        EnrichmentPayload {
            summary: format!("Summary of {}", title),
            summary_bullets: vec![title.to_string()],
            category: self.default_category,
            tags,
            audience_scores: AudienceScores {
                engineering_leader: 0.5,
                ml_engineer: 0.5,
                data_scientist: 0.5,
                software_engineer: 0.5,
                researcher: 0.5,
            },
            why_it_matters: "It matters.".to_string(),
            practical_takeaway: String::new(),
            quotes: Vec::new(),
        }
    }
}

impl Default for MockEnricher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Enricher for MockEnricher {
    fn id(&self) -> &str {
        "mock"
    }

    async fn enrich(&self, request: &EnrichmentRequest) -> Result<EnrichmentPayload, EnrichmentError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let registered = self.responses.lock().unwrap().get(&request.title).cloned();
        match registered {
            Some(result) => result,
            None => Ok(self.default_payload(&request.title)),
        }
    }
}
