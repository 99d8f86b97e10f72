//! Common fixtures for newsroom integration tests
//!
//! Sources are in-memory `StaticSource`s; the store is SQLite, in memory or
//! in a temp directory when a test needs a second connection.

#![allow(dead_code)]

use chrono::NaiveDate;
use newsroom::dedup::{DedupGate, HashingEmbedder, DEFAULT_SIMILARITY_THRESHOLD};
use newsroom::pipeline::{Orchestrator, OrchestratorBuilder};
use newsroom::source::{SourceRegistry, StaticSource};
use newsroom::{CandidateArticle, OpenStore, SqliteStore};
use std::path::Path;
use std::sync::Arc;

pub fn day(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 2, d).unwrap()
}

/// A candidate whose title shares no words with any other tag's title, so
/// the similarity gate never pairs two of them.
pub fn article(tag: &str) -> CandidateArticle {
    let title = ["lede", "story", "report", "brief"]
        .iter()
        .map(|w| format!("{}{}", w, tag))
        .collect::<Vec<_>>()
        .join(" ");
    CandidateArticle::new(title, format!("https://news.example/{}", tag))
        .with_summary(format!("Body text for item {}.", tag))
}

pub fn articles(prefix: &str, n: usize) -> Vec<CandidateArticle> {
    (0..n).map(|i| article(&format!("{}x{}", prefix, i))).collect()
}

pub fn create_test_store() -> Arc<SqliteStore> {
    Arc::new(SqliteStore::open_in_memory().unwrap())
}

pub fn open_store(path: &Path) -> Arc<SqliteStore> {
    Arc::new(SqliteStore::open(path).unwrap())
}

pub fn gate() -> DedupGate {
    DedupGate::new(Arc::new(HashingEmbedder::default()), DEFAULT_SIMILARITY_THRESHOLD)
}

pub fn registry_of(sources: &[Arc<StaticSource>]) -> SourceRegistry {
    let mut registry = SourceRegistry::new();
    for source in sources {
        registry.register_source(source.clone());
    }
    registry
}

pub fn orchestrator(store: Arc<SqliteStore>, sources: &[Arc<StaticSource>]) -> OrchestratorBuilder {
    Orchestrator::builder(store, registry_of(sources), gate())
}
