//! Run and task-unit model
//!
//! A `Run` is one invocation of the pipeline over a date range and a source
//! selection. It is expanded into `TaskUnit`s, one per (source, date). Both
//! carry small forward-only state machines; the orchestrator drives them and
//! the store persists every transition.

mod cancel;
mod expand;
mod progress;

pub use cancel::CancellationToken;
pub use expand::{expand, expand_dates, ExpansionError};
pub use progress::{RunProgress, Stage};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Unique identifier for a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

/// Unique identifier for a task unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

/// Errors raised by illegal state transitions
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StateError {
    #[error("run cannot move from {from} to {to}")]
    Run { from: RunStatus, to: RunStatus },

    #[error("task unit cannot move from {from} to {to}")]
    Task { from: TaskStatus, to: TaskStatus },

    #[error("unknown status: {0}")]
    UnknownStatus(String),
}

/// Lifecycle status of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Queued,
    Running,
    Success,
    Partial,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Partial => "partial",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Queued | RunStatus::Running)
    }

    /// Forward-only transitions. `partial`/`failed` may be re-classified
    /// among the non-cancelled terminal states after a targeted retry.
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        use RunStatus::*;
        matches!(
            (self, next),
            (Queued, Running | Failed | Cancelled)
                | (Running, Success | Partial | Failed | Cancelled)
                | (Partial | Failed, Success | Partial | Failed)
        )
    }

    /// Classify a finished run from the final statuses of its units.
    pub fn classify<I>(statuses: I, cancelled: bool) -> RunStatus
    where
        I: IntoIterator<Item = TaskStatus>,
    {
        if cancelled {
            return RunStatus::Cancelled;
        }
        let mut total = 0usize;
        let mut succeeded = 0usize;
        for status in statuses {
            total += 1;
            if status == TaskStatus::Success {
                succeeded += 1;
            }
        }
        if total > 0 && succeeded == total {
            RunStatus::Success
        } else if succeeded > 0 {
            RunStatus::Partial
        } else {
            RunStatus::Failed
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = StateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(RunStatus::Queued),
            "running" => Ok(RunStatus::Running),
            "success" => Ok(RunStatus::Success),
            "partial" => Ok(RunStatus::Partial),
            "failed" => Ok(RunStatus::Failed),
            "cancelled" => Ok(RunStatus::Cancelled),
            other => Err(StateError::UnknownStatus(other.to_string())),
        }
    }
}

/// Lifecycle status of a task unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Success,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Success => "success",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Success | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Forward-only transitions. `failed -> pending` is not listed here:
    /// it only happens through [`TaskUnit::reset_for_retry`].
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Running | Failed | Cancelled) | (Running, Success | Failed | Cancelled)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = StateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "success" => Ok(TaskStatus::Success),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            other => Err(StateError::UnknownStatus(other.to_string())),
        }
    }
}

/// Which configured feeds the synthetic feed-set unit should cover
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "ids", rename_all = "lowercase")]
pub enum FeedSelection {
    /// No feed-set unit is created
    #[default]
    None,
    /// Every configured feed
    All,
    /// A subset of configured feed identifiers
    Only(Vec<String>),
}

impl FeedSelection {
    pub fn is_selected(&self) -> bool {
        !matches!(self, FeedSelection::None)
    }
}

/// Sources a run ingests from
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSelection {
    /// Static source identifiers, one task unit per day each
    pub sources: Vec<String>,
    #[serde(default)]
    pub feeds: FeedSelection,
}

impl SourceSelection {
    pub fn new(sources: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            sources: sources.into_iter().map(Into::into).collect(),
            feeds: FeedSelection::None,
        }
    }

    pub fn with_feeds(mut self, feeds: FeedSelection) -> Self {
        self.feeds = feeds;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty() && !self.feeds.is_selected()
    }
}

/// Final counts written when a run is finalized
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub fetched: u64,
    pub saved: u64,
    pub enriched: u64,
    pub tasks_succeeded: u64,
    pub tasks_failed: u64,
    pub tasks_cancelled: u64,
    pub tasks_pending: u64,
    pub duration_seconds: f64,
}

impl RunResult {
    pub fn from_tasks(progress: &RunProgress, tasks: &[TaskUnit], duration_seconds: f64) -> Self {
        let count = |status: TaskStatus| tasks.iter().filter(|t| t.status == status).count() as u64;
        Self {
            fetched: progress.fetched,
            saved: progress.saved,
            enriched: progress.enriched,
            tasks_succeeded: count(TaskStatus::Success),
            tasks_failed: count(TaskStatus::Failed),
            tasks_cancelled: count(TaskStatus::Cancelled),
            tasks_pending: count(TaskStatus::Pending) + count(TaskStatus::Running),
            duration_seconds,
        }
    }
}

/// One invocation of the pipeline over a date range and source selection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub status: RunStatus,
    pub date_from: NaiveDate,
    pub date_to: NaiveDate,
    pub selection: SourceSelection,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub progress: RunProgress,
    pub result: Option<RunResult>,
    /// Set only when the run could not be expanded or started
    pub error_message: Option<String>,
    pub cancel_requested: bool,
}

impl Run {
    /// Create a queued run
    pub fn new(date_from: NaiveDate, date_to: NaiveDate, selection: SourceSelection) -> Self {
        Self {
            id: RunId::new(),
            status: RunStatus::Queued,
            date_from,
            date_to,
            selection,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            progress: RunProgress::default(),
            result: None,
            error_message: None,
            cancel_requested: false,
        }
    }

    /// Move the run to `next`, stamping start/completion times.
    pub fn transition(&mut self, next: RunStatus) -> Result<(), StateError> {
        if !self.status.can_transition_to(next) {
            return Err(StateError::Run {
                from: self.status,
                to: next,
            });
        }
        let now = Utc::now();
        if next == RunStatus::Running && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.completed_at = Some(now);
        }
        self.status = next;
        Ok(())
    }

    /// Seconds between start (or creation) and completion (or now).
    pub fn elapsed_seconds(&self) -> f64 {
        let start = self.started_at.unwrap_or(self.created_at);
        let end = self.completed_at.unwrap_or_else(Utc::now);
        (end - start).num_milliseconds().max(0) as f64 / 1000.0
    }
}

/// One (run, source, date) unit of work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskUnit {
    pub id: TaskId,
    pub run_id: RunId,
    pub source: String,
    pub date: NaiveDate,
    pub status: TaskStatus,
    pub articles_saved: u64,
    pub error_message: Option<String>,
    pub attempts: u32,
    pub updated_at: DateTime<Utc>,
}

impl TaskUnit {
    pub fn new(run_id: RunId, source: impl Into<String>, date: NaiveDate) -> Self {
        Self {
            id: TaskId::new(),
            run_id,
            source: source.into(),
            date,
            status: TaskStatus::Pending,
            articles_saved: 0,
            error_message: None,
            attempts: 0,
            updated_at: Utc::now(),
        }
    }

    fn transition(&mut self, next: TaskStatus) -> Result<(), StateError> {
        if !self.status.can_transition_to(next) {
            return Err(StateError::Task {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// pending -> running; counts an attempt.
    pub fn start(&mut self) -> Result<(), StateError> {
        self.transition(TaskStatus::Running)?;
        self.attempts += 1;
        Ok(())
    }

    pub fn succeed(&mut self, articles_saved: u64) -> Result<(), StateError> {
        self.transition(TaskStatus::Success)?;
        self.articles_saved = articles_saved;
        Ok(())
    }

    /// Mark failed, keeping whatever was saved before the error.
    pub fn fail(&mut self, message: impl Into<String>, articles_saved: u64) -> Result<(), StateError> {
        self.transition(TaskStatus::Failed)?;
        self.error_message = Some(message.into());
        self.articles_saved = articles_saved;
        Ok(())
    }

    pub fn cancel(&mut self, articles_saved: u64) -> Result<(), StateError> {
        self.transition(TaskStatus::Cancelled)?;
        self.articles_saved = articles_saved;
        Ok(())
    }

    /// failed -> pending, clearing the error. The only backward edge.
    pub fn reset_for_retry(&mut self) -> Result<(), StateError> {
        if self.status != TaskStatus::Failed {
            return Err(StateError::Task {
                from: self.status,
                to: TaskStatus::Pending,
            });
        }
        self.status = TaskStatus::Pending;
        self.error_message = None;
        self.updated_at = Utc::now();
        Ok(())
    }
}
