//! Storage trait definitions

use crate::article::{ArticleId, EnrichmentStatus, NewArticle, StoredArticle};
use crate::enrich::EnrichmentPayload;
use crate::run::{Run, RunId, RunProgress, RunStatus, TaskStatus, TaskUnit};
use chrono::NaiveDate;
use std::collections::HashSet;
use std::path::Path;
use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Article not found: {0}")]
    ArticleNotFound(i64),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Date parsing error: {0}")]
    DateParse(String),

    #[error("Corrupt row: {0}")]
    Corrupt(String),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Inclusive range of digest dates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    pub from: NaiveDate,
    pub to: NaiveDate,
}

impl DateRange {
    pub fn new(from: NaiveDate, to: NaiveDate) -> Self {
        Self { from, to }
    }

    pub fn day(date: NaiveDate) -> Self {
        Self { from: date, to: date }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.from <= date && date <= self.to
    }
}

/// Durable run registry
///
/// Status writes are compare-and-set on the expected current status, so two
/// writers (a driver and a canceller, or two retry callers) cannot both win.
pub trait RunStore: Send + Sync {
    /// Insert a run and its task units in one transaction.
    fn create_run(&self, run: &Run, tasks: &[TaskUnit]) -> StorageResult<()>;

    fn get_run(&self, id: &RunId) -> StorageResult<Option<Run>>;

    /// Newest first.
    fn list_runs(&self, limit: usize) -> StorageResult<Vec<Run>>;

    fn runs_with_status(&self, statuses: &[RunStatus]) -> StorageResult<Vec<Run>>;

    /// Write status, timestamps, result and error message if the stored
    /// status is still `expected`. Progress is untouched.
    fn transition_run(&self, run: &Run, expected: RunStatus) -> StorageResult<bool>;

    /// Write progress only if `seq` is newer than the stored sequence.
    fn save_progress(&self, id: &RunId, progress: &RunProgress, seq: u64) -> StorageResult<bool>;

    /// Sequence of the last accepted progress write. 0 for unknown runs.
    fn progress_seq(&self, id: &RunId) -> StorageResult<u64>;

    /// Set the persisted cancel flag. `false` if the run does not exist.
    fn request_cancel(&self, id: &RunId) -> StorageResult<bool>;

    fn is_cancel_requested(&self, id: &RunId) -> StorageResult<bool>;

    fn list_tasks(&self, run_id: &RunId) -> StorageResult<Vec<TaskUnit>>;

    fn get_task(&self, run_id: &RunId, source: &str, date: NaiveDate) -> StorageResult<Option<TaskUnit>>;

    /// Write a task unit's mutable fields if its stored status is still
    /// `expected`.
    fn transition_task(&self, task: &TaskUnit, expected: TaskStatus) -> StorageResult<bool>;
}

/// Durable article store keyed by unique fingerprint
pub trait ArticleStore: Send + Sync {
    /// Insert if the fingerprint is absent. `None` means it already existed.
    fn insert_article(&self, article: &NewArticle) -> StorageResult<Option<ArticleId>>;

    /// Which of `fingerprints` are already stored.
    fn existing_fingerprints(&self, fingerprints: &[String]) -> StorageResult<HashSet<String>>;

    fn get_article(&self, id: ArticleId) -> StorageResult<Option<StoredArticle>>;

    /// Articles by id, ascending; unknown ids are skipped.
    fn get_articles(&self, ids: &[ArticleId]) -> StorageResult<Vec<StoredArticle>>;

    fn find_by_fingerprint(&self, fingerprint: &str) -> StorageResult<Option<StoredArticle>>;

    /// Embeddings of articles in `range`, plus any saved by `run_id`,
    /// ascending by id.
    fn embeddings_for_corpus(
        &self,
        range: DateRange,
        run_id: Option<&RunId>,
    ) -> StorageResult<Vec<(ArticleId, Vec<f32>)>>;

    /// Record another source reporting the same story. No-op (returns
    /// `false`) for the canonical source or a source already listed.
    fn add_reported_by(&self, id: ArticleId, source_name: &str) -> StorageResult<bool>;

    fn count_articles(&self) -> StorageResult<usize>;

    fn list_articles_for_run(&self, run_id: &RunId) -> StorageResult<Vec<StoredArticle>>;

    /// Ids with the given enrichment status, optionally limited to a digest
    /// date range, ascending.
    fn articles_with_enrichment_status(
        &self,
        status: EnrichmentStatus,
        range: Option<DateRange>,
    ) -> StorageResult<Vec<ArticleId>>;

    /// Store a payload and mark the article `done`.
    fn save_enrichment(&self, id: ArticleId, payload: &EnrichmentPayload) -> StorageResult<()>;

    /// Record an error and mark the article `failed`.
    fn mark_enrichment_failed(&self, id: ArticleId, error: &str) -> StorageResult<()>;

    /// Move `failed` articles with fewer than `retry_cap` retries back to
    /// `pending`, counting the retry. Returns the ids moved.
    fn reset_failed_enrichment(&self, range: Option<DateRange>, retry_cap: u32) -> StorageResult<Vec<ArticleId>>;

    /// Enriched articles with a digest date in `range`.
    fn enriched_articles(&self, range: DateRange) -> StorageResult<Vec<StoredArticle>>;

    fn set_related(&self, id: ArticleId, related: &[ArticleId]) -> StorageResult<()>;
}

/// Everything the orchestrator needs from persistence
pub trait Store: RunStore + ArticleStore {}

impl<T: RunStore + ArticleStore> Store for T {}

/// Extension trait for opening stores from paths
pub trait OpenStore: Store + Sized {
    /// Open or create a store at the given path
    fn open(path: impl AsRef<Path>) -> StorageResult<Self>;

    /// Create an in-memory store (useful for testing)
    fn open_in_memory() -> StorageResult<Self>;
}
