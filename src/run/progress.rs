//! Live progress snapshot of a run

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Pipeline stage a run is currently in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Expanding,
    Fetching,
    Filtering,
    Deduplicating,
    Saving,
    Enriching,
    Finalizing,
}

/// Mutable progress of a run.
///
/// Counters are cumulative across every task unit the run has processed
/// (including retries) and only ever grow.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunProgress {
    pub stage: Option<Stage>,
    pub current_date: Option<NaiveDate>,
    pub current_source: Option<String>,
    /// Candidates pulled from sources
    pub fetched: u64,
    /// Candidates whose fingerprint was not already stored
    pub new: u64,
    /// Candidates that survived the dedup gate
    pub deduped: u64,
    pub saved: u64,
    pub enriched: u64,
    pub enrichment_failed: u64,
    pub tasks_completed: u64,
    pub tasks_total: u64,
    pub dates_completed: u64,
    pub dates_total: u64,
}

impl RunProgress {
    pub fn new(tasks_total: u64, dates_total: u64) -> Self {
        Self {
            stage: Some(Stage::Expanding),
            tasks_total,
            dates_total,
            ..Self::default()
        }
    }

    /// True if no counter in `self` is behind the same counter in `earlier`.
    pub fn never_behind(&self, earlier: &RunProgress) -> bool {
        self.fetched >= earlier.fetched
            && self.new >= earlier.new
            && self.deduped >= earlier.deduped
            && self.saved >= earlier.saved
            && self.enriched >= earlier.enriched
            && self.enrichment_failed >= earlier.enrichment_failed
            && self.tasks_completed >= earlier.tasks_completed
            && self.dates_completed >= earlier.dates_completed
    }
}
