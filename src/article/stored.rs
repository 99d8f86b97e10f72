use super::CandidateArticle;
use crate::enrich::EnrichmentPayload;
use crate::run::RunId;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Row id of a stored article
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ArticleId(pub i64);

impl fmt::Display for ArticleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where an article is in the enrichment hand-off
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnrichmentStatus {
    Pending,
    Done,
    Failed,
}

impl EnrichmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnrichmentStatus::Pending => "pending",
            EnrichmentStatus::Done => "done",
            EnrichmentStatus::Failed => "failed",
        }
    }
}

impl FromStr for EnrichmentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(EnrichmentStatus::Pending),
            "done" => Ok(EnrichmentStatus::Done),
            "failed" => Ok(EnrichmentStatus::Failed),
            other => Err(format!("unknown enrichment status: {}", other)),
        }
    }
}

/// An article about to be inserted
#[derive(Debug, Clone, PartialEq)]
pub struct NewArticle {
    pub fingerprint: String,
    pub title: String,
    pub url: String,
    pub source_id: String,
    pub source_name: String,
    pub author: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub digest_date: NaiveDate,
    pub summary: String,
    pub engagement: i64,
    pub run_id: Option<RunId>,
    pub embedding: Option<Vec<f32>>,
}

impl NewArticle {
    pub fn from_candidate(
        candidate: &CandidateArticle,
        source_id: &str,
        digest_date: NaiveDate,
        run_id: Option<RunId>,
        embedding: Option<Vec<f32>>,
    ) -> Self {
        let source_name = if candidate.source_name.is_empty() {
            source_id.to_string()
        } else {
            candidate.source_name.clone()
        };
        Self {
            fingerprint: candidate.fingerprint(),
            title: candidate.title.clone(),
            url: candidate.url.clone(),
            source_id: source_id.to_string(),
            source_name,
            author: candidate.author.clone(),
            published_at: candidate.published_at,
            digest_date,
            summary: candidate.summary.clone(),
            engagement: candidate.engagement,
            run_id,
            embedding,
        }
    }
}

/// The durable article record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredArticle {
    pub id: ArticleId,
    pub fingerprint: String,
    pub title: String,
    pub url: String,
    pub source_id: String,
    pub source_name: String,
    pub author: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub digest_date: NaiveDate,
    pub summary: String,
    pub engagement: i64,
    pub run_id: Option<RunId>,
    pub ingested_at: DateTime<Utc>,
    pub embedding: Option<Vec<f32>>,
    /// Later sources that reported the same story (first source stays canonical)
    pub also_reported_by: Vec<String>,
    pub enrichment_status: EnrichmentStatus,
    pub enrichment: Option<EnrichmentPayload>,
    pub enrichment_error: Option<String>,
    pub enrich_retries: u32,
    pub related_ids: Vec<ArticleId>,
}
