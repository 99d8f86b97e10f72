//! Source connectors: where candidate articles come from
//!
//! A connector turns a calendar date into a lazy stream of candidates. The
//! orchestrator never knows how a source scrapes; it only sees the stream.
//! Connectors must be callable repeatedly for the same date so task-level
//! retries can re-fetch.

mod command;
mod feeds;
mod fixture;

pub use command::CommandSource;
pub use feeds::FeedSetSource;
pub use fixture::{Failure, StaticSource};

use crate::article::CandidateArticle;
use crate::run::FeedSelection;
use async_trait::async_trait;
use chrono::NaiveDate;
use futures::stream::BoxStream;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

/// Source id of the synthetic per-day unit that covers the selected feeds.
pub const FEED_SET_SOURCE: &str = "feeds";

/// Errors raised while fetching from a source. Each one fails a single task
/// unit, never the run.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SourceError {
    #[error("source unavailable: {0}")]
    Unavailable(String),

    #[error("source timed out after {0}s")]
    Timeout(u64),

    #[error("malformed candidate: {0}")]
    Malformed(String),

    #[error("fetch failed: {0}")]
    Failed(String),

    #[error("io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for SourceError {
    fn from(e: std::io::Error) -> Self {
        SourceError::Io(e.to_string())
    }
}

/// Lazy stream of candidates for one (source, date)
pub type CandidateStream = BoxStream<'static, Result<CandidateArticle, SourceError>>;

/// A content source.
#[async_trait]
pub trait SourceConnector: Send + Sync {
    /// Stable identifier used in selections and task units.
    fn id(&self) -> &str;

    /// Display name stamped on candidates that don't carry their own.
    fn name(&self) -> &str {
        self.id()
    }

    /// Open the candidate stream for one date.
    async fn fetch(&self, date: NaiveDate) -> Result<CandidateStream, SourceError>;
}

/// The configured static sources and feeds, by id.
#[derive(Default, Clone)]
pub struct SourceRegistry {
    sources: BTreeMap<String, Arc<dyn SourceConnector>>,
    feeds: BTreeMap<String, Arc<dyn SourceConnector>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a static source. Replaces any source with the same id.
    pub fn register_source(&mut self, source: Arc<dyn SourceConnector>) {
        self.sources.insert(source.id().to_string(), source);
    }

    /// Register a feed. Feeds are only reachable through the feed-set unit.
    pub fn register_feed(&mut self, feed: Arc<dyn SourceConnector>) {
        self.feeds.insert(feed.id().to_string(), feed);
    }

    pub fn has_source(&self, id: &str) -> bool {
        self.sources.contains_key(id)
    }

    pub fn has_feed(&self, id: &str) -> bool {
        self.feeds.contains_key(id)
    }

    pub fn source_ids(&self) -> Vec<String> {
        self.sources.keys().cloned().collect()
    }

    pub fn feed_ids(&self) -> Vec<String> {
        self.feeds.keys().cloned().collect()
    }

    pub fn source(&self, id: &str) -> Option<Arc<dyn SourceConnector>> {
        self.sources.get(id).cloned()
    }

    /// Resolve the connector for a task unit's source id.
    ///
    /// The feed-set id resolves to a `FeedSetSource` over the feeds picked by
    /// `feeds`; unknown feed ids are skipped.
    pub fn connector_for(
        &self,
        source_id: &str,
        feeds: &FeedSelection,
    ) -> Option<Arc<dyn SourceConnector>> {
        if source_id != FEED_SET_SOURCE {
            return self.source(source_id);
        }
        let selected: Vec<Arc<dyn SourceConnector>> = match feeds {
            FeedSelection::None => return None,
            FeedSelection::All => self.feeds.values().cloned().collect(),
            FeedSelection::Only(ids) => ids
                .iter()
                .filter_map(|id| self.feeds.get(id).cloned())
                .collect(),
        };
        if selected.is_empty() {
            return None;
        }
        Some(Arc::new(FeedSetSource::new(selected)))
    }
}

impl std::fmt::Debug for SourceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceRegistry")
            .field("sources", &self.source_ids())
            .field("feeds", &self.feed_ids())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> SourceRegistry {
        let mut r = SourceRegistry::new();
        r.register_source(Arc::new(StaticSource::new("hn")));
        r.register_feed(Arc::new(StaticSource::new("openai")));
        r.register_feed(Arc::new(StaticSource::new("deepmind")));
        r
    }

    #[test]
    fn static_source_resolves_by_id() {
        let r = registry();
        let c = r.connector_for("hn", &FeedSelection::None).unwrap();
        assert_eq!(c.id(), "hn");
        assert!(r.connector_for("missing", &FeedSelection::All).is_none());
    }

    #[test]
    fn feed_set_resolves_only_when_feeds_selected() {
        let r = registry();
        assert!(r.connector_for(FEED_SET_SOURCE, &FeedSelection::None).is_none());
        let c = r.connector_for(FEED_SET_SOURCE, &FeedSelection::All).unwrap();
        assert_eq!(c.id(), FEED_SET_SOURCE);
        assert!(r
            .connector_for(FEED_SET_SOURCE, &FeedSelection::Only(vec!["nope".into()]))
            .is_none());
    }

    #[test]
    fn feeds_are_not_static_sources() {
        let r = registry();
        assert!(r.has_feed("openai"));
        assert!(!r.has_source("openai"));
        assert_eq!(r.feed_ids(), vec!["deepmind".to_string(), "openai".to_string()]);
    }
}
