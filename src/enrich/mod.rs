//! Enrichment: AI-generated structured metadata for stored articles
//!
//! The orchestrator hands newly saved article ids to an `EnrichmentDispatcher`,
//! which calls an `Enricher` per article and records the outcome on the
//! article row. Two enricher implementations:
//! - `CommandEnricher`: spawns a configured command, JSON in on stdin, JSON out
//!   on stdout (production)
//! - `MockEnricher`: returns preconfigured payloads or failures (testing)

mod command;
mod dispatch;
mod mock;
mod related;

pub use command::CommandEnricher;
pub use dispatch::{DispatchSummary, EnrichmentDispatcher, EnrichmentObserver};
pub use mock::MockEnricher;
pub use related::{rank_related, RELATED_LIMIT, RELATED_WINDOW_DAYS};

use crate::article::{ArticleId, StoredArticle};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors from an enrichment call. Each one affects a single article.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EnrichmentError {
    /// Stop the whole dispatch batch (bad credentials, missing model, ...)
    #[error("fatal enrichment error: {0}")]
    Fatal(String),

    #[error("enrichment timed out after {0}s")]
    Timeout(u64),

    #[error("malformed enrichment payload: {0}")]
    Malformed(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("enricher unavailable: {0}")]
    Unavailable(String),

    #[error("enrichment failed: {0}")]
    Failed(String),
}

impl EnrichmentError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, EnrichmentError::Fatal(_))
    }
}

/// What the enricher sees of an article
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichmentRequest {
    pub article_id: ArticleId,
    pub title: String,
    pub url: String,
    pub source_id: String,
    pub source_name: String,
    pub author: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub digest_date: NaiveDate,
    pub body: String,
}

impl EnrichmentRequest {
    pub fn for_article(article: &StoredArticle) -> Self {
        Self {
            article_id: article.id,
            title: article.title.clone(),
            url: article.url.clone(),
            source_id: article.source_id.clone(),
            source_name: article.source_name.clone(),
            author: article.author.clone(),
            published_at: article.published_at,
            digest_date: article.digest_date,
            body: article.summary.clone(),
        }
    }
}

/// Editorial category, one of five
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Category {
    #[serde(rename = "Research")]
    Research,
    #[serde(rename = "Tools & Libraries")]
    ToolsAndLibraries,
    #[serde(rename = "Industry News")]
    IndustryNews,
    #[serde(rename = "Policy & Ethics")]
    PolicyAndEthics,
    #[serde(rename = "Tutorials")]
    Tutorials,
}

impl Category {
    pub const ALL: [Category; 5] = [
        Category::Research,
        Category::ToolsAndLibraries,
        Category::IndustryNews,
        Category::PolicyAndEthics,
        Category::Tutorials,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Research => "Research",
            Category::ToolsAndLibraries => "Tools & Libraries",
            Category::IndustryNews => "Industry News",
            Category::PolicyAndEthics => "Policy & Ethics",
            Category::Tutorials => "Tutorials",
        }
    }

    /// Case-insensitive lookup by display name.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        Self::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(s))
    }
}

impl Default for Category {
    fn default() -> Self {
        Category::IndustryNews
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Relevance of an article to each reader role, each in `[0, 1]`
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AudienceScores {
    pub engineering_leader: f32,
    pub ml_engineer: f32,
    pub data_scientist: f32,
    pub software_engineer: f32,
    pub researcher: f32,
}

impl AudienceScores {
    pub const ROLES: [&'static str; 5] = [
        "engineering_leader",
        "ml_engineer",
        "data_scientist",
        "software_engineer",
        "researcher",
    ];

    fn slot(&mut self, role: &str) -> Option<&mut f32> {
        match role {
            "engineering_leader" => Some(&mut self.engineering_leader),
            "ml_engineer" => Some(&mut self.ml_engineer),
            "data_scientist" => Some(&mut self.data_scientist),
            "software_engineer" => Some(&mut self.software_engineer),
            "researcher" => Some(&mut self.researcher),
            _ => None,
        }
    }

    /// Missing roles score 0; unknown roles are ignored.
    fn from_json(value: &serde_json::Value) -> Result<Self, EnrichmentError> {
        let mut scores = AudienceScores::default();
        let map = match value {
            serde_json::Value::Null => return Ok(scores),
            serde_json::Value::Object(map) => map,
            other => {
                return Err(EnrichmentError::Malformed(format!(
                    "audience_scores must be an object, got {}",
                    other
                )))
            }
        };
        for (role, raw) in map {
            let Some(slot) = scores.slot(role) else {
                continue;
            };
            let score = raw
                .as_f64()
                .map(|v| v as f32)
                .filter(|v| v.is_finite())
                .ok_or_else(|| {
                    EnrichmentError::Malformed(format!("audience score for {} is not a finite number", role))
                })?;
            *slot = score.clamp(0.0, 1.0);
        }
        Ok(scores)
    }
}

/// Structured annotations for one article
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichmentPayload {
    #[serde(default)]
    pub summary: String,
    pub summary_bullets: Vec<String>,
    pub category: Category,
    pub tags: Vec<String>,
    pub audience_scores: AudienceScores,
    pub why_it_matters: String,
    #[serde(default)]
    pub practical_takeaway: String,
    /// Notable verbatim quotes from the article
    pub quotes: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawPayload {
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    summary_bullets: Vec<String>,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    tags: Vec<serde_json::Value>,
    #[serde(default)]
    audience_scores: serde_json::Value,
    #[serde(default)]
    why_it_matters: Option<String>,
    #[serde(default)]
    practical_takeaway: Option<String>,
    #[serde(default, alias = "annotations")]
    quotes: Vec<String>,
}

/// Remove a surrounding ``` / ```json fence, if any.
pub fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    let rest = rest.strip_suffix("```").unwrap_or(rest);
    rest.trim()
}

impl EnrichmentPayload {
    /// Parse and validate an enricher's raw output.
    pub fn from_json(text: &str) -> Result<Self, EnrichmentError> {
        let body = strip_code_fences(text);
        let raw: RawPayload =
            serde_json::from_str(body).map_err(|e| EnrichmentError::Malformed(e.to_string()))?;

        let category = match raw.category.as_deref().map(str::trim) {
            None | Some("") => Category::default(),
            Some(name) => Category::parse(name)
                .ok_or_else(|| EnrichmentError::Malformed(format!("unknown category: {}", name)))?,
        };

        let mut tags: Vec<String> = Vec::new();
        for tag in raw.tags {
            let Some(tag) = tag.as_str() else { continue };
            let tag = tag.trim().to_lowercase();
            if !tag.is_empty() && !tags.contains(&tag) {
                tags.push(tag);
            }
        }

        let clean = |items: Vec<String>| -> Vec<String> {
            items
                .into_iter()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        };

        Ok(Self {
            summary: raw.summary.unwrap_or_default().trim().to_string(),
            summary_bullets: clean(raw.summary_bullets),
            category,
            tags,
            audience_scores: AudienceScores::from_json(&raw.audience_scores)?,
            why_it_matters: raw.why_it_matters.unwrap_or_default().trim().to_string(),
            practical_takeaway: raw.practical_takeaway.unwrap_or_default().trim().to_string(),
            quotes: clean(raw.quotes),
        })
    }
}

/// Produces enrichment payloads.
#[async_trait]
pub trait Enricher: Send + Sync {
    /// Identifier for logs.
    fn id(&self) -> &str;

    async fn enrich(&self, request: &EnrichmentRequest) -> Result<EnrichmentPayload, EnrichmentError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fenced_payload_is_parsed_and_normalised() {
        let text = r#"```json
        {
          "summary_bullets": ["  one ", "", "two"],
          "category": "tools & libraries",
          "tags": ["  RAG", "rag", "", "Open-Source", 7],
          "audience_scores": {"ml_engineer": 1.4, "researcher": -0.2, "intern": 0.5},
          "why_it_matters": "It ships.",
          "annotations": ["\"We did it\""]
        }
        ```"#;
        let p = EnrichmentPayload::from_json(text).unwrap();
        assert_eq!(p.summary_bullets, vec!["one", "two"]);
        assert_eq!(p.category, Category::ToolsAndLibraries);
        assert_eq!(p.tags, vec!["rag", "open-source"]);
        assert_eq!(p.audience_scores.ml_engineer, 1.0);
        assert_eq!(p.audience_scores.researcher, 0.0);
        assert_eq!(p.audience_scores.data_scientist, 0.0);
        assert_eq!(p.quotes.len(), 1);
    }

    #[test]
    fn test_missing_category_defaults_to_industry_news() {
        let p = EnrichmentPayload::from_json(r#"{"tags":["llms"]}"#).unwrap();
        assert_eq!(p.category, Category::IndustryNews);
    }

    #[test]
    fn test_unknown_category_is_malformed() {
        let err = EnrichmentPayload::from_json(r#"{"category":"Gossip"}"#).unwrap_err();
        assert!(matches!(err, EnrichmentError::Malformed(_)));
    }

    #[test]
    fn test_non_numeric_score_is_malformed() {
        let err = EnrichmentPayload::from_json(r#"{"audience_scores":{"ml_engineer":"high"}}"#).unwrap_err();
        assert!(matches!(err, EnrichmentError::Malformed(_)));
        let err = EnrichmentPayload::from_json(r#"{"audience_scores":{"ml_engineer":1e300}}"#).unwrap_err();
        assert!(matches!(err, EnrichmentError::Malformed(_)));
    }

    #[test]
    fn test_not_json_is_malformed() {
        assert!(matches!(
            EnrichmentPayload::from_json("Sorry, I can't help with that."),
            Err(EnrichmentError::Malformed(_))
        ));
    }

    #[test]
    fn test_category_serializes_as_display_name() {
        let json = serde_json::to_string(&Category::PolicyAndEthics).unwrap();
        assert_eq!(json, "\"Policy & Ethics\"");
    }
}
