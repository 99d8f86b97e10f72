use super::fingerprint::fingerprint;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Summary characters that feed the similarity embedding.
const EMBEDDING_SUMMARY_CHARS: usize = 500;

/// A raw article produced by a source connector.
///
/// Ephemeral: only persisted if it survives the dedup gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateArticle {
    pub title: String,
    pub url: String,
    /// Human-readable origin, e.g. "HackerNews" or "OpenAI Blog"
    #[serde(default)]
    pub source_name: String,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub published_at: Option<DateTime<Utc>>,
    /// Body or abstract used for embedding and enrichment input
    #[serde(default)]
    pub summary: String,
    /// Source-specific popularity signal (points, upvotes, ...)
    #[serde(default)]
    pub engagement: i64,
}

impl CandidateArticle {
    pub fn new(title: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            url: url.into(),
            source_name: String::new(),
            author: None,
            published_at: None,
            summary: String::new(),
            engagement: 0,
        }
    }

    pub fn with_source_name(mut self, name: impl Into<String>) -> Self {
        self.source_name = name.into();
        self
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = summary.into();
        self
    }

    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = Some(author.into());
        self
    }

    pub fn with_published_at(mut self, at: DateTime<Utc>) -> Self {
        self.published_at = Some(at);
        self
    }

    pub fn with_engagement(mut self, engagement: i64) -> Self {
        self.engagement = engagement;
        self
    }

    pub fn fingerprint(&self) -> String {
        fingerprint(&self.url)
    }

    /// Title plus the head of the summary.
    pub fn embedding_text(&self) -> String {
        let summary = self.summary.trim();
        if summary.is_empty() {
            return self.title.clone();
        }
        let head: String = summary.chars().take(EMBEDDING_SUMMARY_CHARS).collect();
        format!("{}\n\n{}", self.title, head)
    }
}
