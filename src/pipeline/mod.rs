//! Pipeline orchestrator
//!
//! The `Orchestrator` owns the run lifecycle: it expands a date range and
//! source selection into task units, drives each active run on its own tokio
//! task, and exposes cancellation, targeted retry, article-level enrichment
//! sweeps and restart reconciliation. Everything it knows is persisted in
//! the store, so any process opening the same database can observe runs.

mod driver;
mod recovery;
mod task;
mod tracker;

use crate::article::{ArticleId, EnrichmentStatus};
use crate::config::{Config, ConfigError, PipelineConfig};
use crate::dedup::DedupGate;
use crate::enrich::{DispatchSummary, Enricher, EnrichmentDispatcher};
use crate::run::{
    expand, CancellationToken, ExpansionError, Run, RunId, RunProgress, RunResult, RunStatus,
    SourceSelection, StateError, TaskStatus, TaskUnit,
};
use crate::source::SourceRegistry;
use crate::storage::{DateRange, StorageError, Store};
use chrono::NaiveDate;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use driver::DriveMode;
use std::collections::BTreeSet;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

/// Errors from the orchestrator's control operations
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// The run was persisted as `failed`; `run_id` identifies it.
    #[error("run {run_id} rejected: {source}")]
    Expansion {
        run_id: RunId,
        #[source]
        source: ExpansionError,
    },

    #[error("run not found: {0}")]
    RunNotFound(RunId),

    #[error("no task unit for source '{source_id}' on {date} in run {run_id}")]
    TaskNotFound {
        run_id: RunId,
        source_id: String,
        date: NaiveDate,
    },

    #[error("retry rejected for run {run_id}: {reason}")]
    RetryRejected { run_id: RunId, reason: String },

    #[error(transparent)]
    State(#[from] StateError),

    #[error("no enricher configured")]
    EnrichmentDisabled,
}

impl PipelineError {
    /// The run a rejected `start_run` still recorded.
    pub fn run_id(&self) -> Option<RunId> {
        match self {
            PipelineError::Expansion { run_id, .. } => Some(*run_id),
            _ => None,
        }
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;

/// In-process hook for lifecycle events. Polling the store is the primary
/// way to observe runs; this only feeds progress lines.
pub trait RunObserver: Send + Sync {
    fn on_task_finished(&self, _task: &TaskUnit) {}

    fn on_run_finished(&self, _run: &Run) {}
}

struct ActiveRun {
    token: CancellationToken,
    done: watch::Receiver<bool>,
}

pub(crate) struct Inner {
    store: Arc<dyn Store>,
    registry: Arc<SourceRegistry>,
    gate: Arc<DedupGate>,
    enrichment: Option<EnrichmentDispatcher>,
    pipeline: PipelineConfig,
    window_days: u32,
    retry_cap: u32,
    observer: Option<Arc<dyn RunObserver>>,
    active: DashMap<RunId, ActiveRun>,
}

/// Builder for [`Orchestrator`]
pub struct OrchestratorBuilder {
    store: Arc<dyn Store>,
    registry: SourceRegistry,
    gate: DedupGate,
    enricher: Option<Arc<dyn Enricher>>,
    enrichment_concurrency: usize,
    pipeline: PipelineConfig,
    window_days: u32,
    retry_cap: u32,
    observer: Option<Arc<dyn RunObserver>>,
}

impl OrchestratorBuilder {
    pub fn enricher(mut self, enricher: Arc<dyn Enricher>) -> Self {
        self.enricher = Some(enricher);
        self
    }

    pub fn enrichment_concurrency(mut self, n: usize) -> Self {
        self.enrichment_concurrency = n;
        self
    }

    pub fn pipeline(mut self, config: PipelineConfig) -> Self {
        self.pipeline = config;
        self
    }

    pub fn dedup_window_days(mut self, days: u32) -> Self {
        self.window_days = days;
        self
    }

    pub fn retry_cap(mut self, cap: u32) -> Self {
        self.retry_cap = cap;
        self
    }

    pub fn observer(mut self, observer: Arc<dyn RunObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn build(self) -> Orchestrator {
        let enrichment = self
            .enricher
            .map(|e| EnrichmentDispatcher::new(self.store.clone(), e, self.enrichment_concurrency));
        Orchestrator {
            inner: Arc::new(Inner {
                store: self.store,
                registry: Arc::new(self.registry),
                gate: Arc::new(self.gate),
                enrichment,
                pipeline: self.pipeline,
                window_days: self.window_days,
                retry_cap: self.retry_cap,
                observer: self.observer,
                active: DashMap::new(),
            }),
        }
    }
}

/// Run lifecycle controller. Cheap to clone; clones share active runs.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn builder(store: Arc<dyn Store>, registry: SourceRegistry, gate: DedupGate) -> OrchestratorBuilder {
        let defaults = Config::default();
        OrchestratorBuilder {
            store,
            registry,
            gate,
            enricher: None,
            enrichment_concurrency: defaults.enrichment.concurrency,
            pipeline: defaults.pipeline,
            window_days: defaults.dedup.window_days,
            retry_cap: defaults.enrichment.retry_cap,
            observer: None,
        }
    }

    /// Wire sources, the dedup gate and the enricher from configuration.
    pub fn from_config(config: &Config, store: Arc<dyn Store>) -> Result<OrchestratorBuilder, ConfigError> {
        let mut builder = Self::builder(store, config.build_registry()?, config.build_gate()?)
            .pipeline(config.pipeline.clone())
            .dedup_window_days(config.dedup.window_days)
            .enrichment_concurrency(config.enrichment.concurrency)
            .retry_cap(config.enrichment.retry_cap);
        if let Some(enricher) = config.build_enricher()? {
            builder = builder.enricher(enricher);
        }
        Ok(builder)
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.inner.store
    }

    /// Runs currently driven by this process.
    pub fn active_runs(&self) -> Vec<RunId> {
        self.inner.active.iter().map(|e| *e.key()).collect()
    }

    /// Persist a new run and start driving it in the background.
    ///
    /// Must be called from within a tokio runtime. A selection that can't
    /// be expanded is still recorded, directly as `failed`.
    pub fn start_run(&self, from: NaiveDate, to: NaiveDate, selection: SourceSelection) -> PipelineResult<RunId> {
        let mut run = Run::new(from, to, selection);
        let units = match expand(
            from,
            to,
            &run.selection,
            self.inner.pipeline.max_range_days,
            &self.inner.registry,
        ) {
            Ok(units) => units,
            Err(e) => {
                run.error_message = Some(e.to_string());
                run.progress = RunProgress::default();
                run.transition(RunStatus::Failed)?;
                run.result = Some(RunResult::from_tasks(&run.progress, &[], 0.0));
                self.inner.store.create_run(&run, &[])?;
                tracing::warn!(run_id = %run.id, error = %e, "run rejected");
                return Err(PipelineError::Expansion {
                    run_id: run.id,
                    source: e,
                });
            }
        };

        let dates: BTreeSet<NaiveDate> = units.iter().map(|(_, d)| *d).collect();
        let tasks: Vec<TaskUnit> = units
            .into_iter()
            .map(|(source, date)| TaskUnit::new(run.id, source, date))
            .collect();
        run.progress = RunProgress::new(tasks.len() as u64, dates.len() as u64);
        self.inner.store.create_run(&run, &tasks)?;
        tracing::info!(run_id = %run.id, units = tasks.len(), dates = dates.len(), "run queued");

        let token = CancellationToken::new();
        let (done, rx) = watch::channel(false);
        self.inner.active.insert(
            run.id,
            ActiveRun {
                token: token.clone(),
                done: rx,
            },
        );
        self.spawn_driver(run.id, DriveMode::Fresh, token, done);
        Ok(run.id)
    }

    pub fn get_run(&self, run_id: &RunId) -> PipelineResult<Run> {
        self.inner
            .store
            .get_run(run_id)?
            .ok_or(PipelineError::RunNotFound(*run_id))
    }

    /// Newest first.
    pub fn list_runs(&self, limit: usize) -> PipelineResult<Vec<Run>> {
        Ok(self.inner.store.list_runs(limit)?)
    }

    pub fn list_tasks(&self, run_id: &RunId) -> PipelineResult<Vec<TaskUnit>> {
        self.get_run(run_id)?;
        Ok(self.inner.store.list_tasks(run_id)?)
    }

    /// Wait for this process's driver of `run_id` to finish, then return the
    /// stored run. Returns immediately for runs not driven here.
    pub async fn wait(&self, run_id: &RunId) -> PipelineResult<Run> {
        let done = self.inner.active.get(run_id).map(|a| a.done.clone());
        if let Some(mut done) = done {
            while !*done.borrow_and_update() {
                if done.changed().await.is_err() {
                    break;
                }
            }
        }
        self.get_run(run_id)
    }

    /// Request cooperative cancellation.
    ///
    /// Returns `false` if the run already finished and nothing here is
    /// driving it.
    pub fn cancel_run(&self, run_id: &RunId) -> PipelineResult<bool> {
        let run = self.get_run(run_id)?;
        let token = self.inner.active.get(run_id).map(|a| a.token.clone());

        if run.status.is_terminal() {
            // Only a retry in flight can still be stopped
            return Ok(match token {
                Some(token) => {
                    token.cancel();
                    true
                }
                None => false,
            });
        }

        self.inner.store.request_cancel(run_id)?;
        if let Some(token) = token {
            token.cancel();
            tracing::info!(run_id = %run_id, "cancellation requested");
            return Ok(true);
        }

        if run.status == RunStatus::Queued {
            let mut cancelled = run;
            cancelled.cancel_requested = true;
            cancelled.transition(RunStatus::Cancelled)?;
            let tasks = self.inner.store.list_tasks(run_id)?;
            cancelled.result = Some(RunResult::from_tasks(&cancelled.progress, &tasks, 0.0));
            if self.inner.store.transition_run(&cancelled, RunStatus::Queued)? {
                tracing::info!(run_id = %run_id, "queued run cancelled");
            }
        } else {
            tracing::info!(run_id = %run_id, "cancel flag set for run driven elsewhere");
        }
        Ok(true)
    }

    /// Reset one `failed` unit to `pending` and re-run it.
    pub fn retry_task(&self, run_id: &RunId, source: &str, date: NaiveDate) -> PipelineResult<TaskUnit> {
        let (token, done) = self.reserve_for_retry(run_id)?;
        match self.reset_task(run_id, source, date) {
            Ok(task) => {
                tracing::info!(run_id = %run_id, source, %date, "retrying unit");
                self.spawn_driver(*run_id, DriveMode::Retry, token, done);
                Ok(task)
            }
            Err(e) => {
                self.release(run_id, done);
                Err(e)
            }
        }
    }

    /// Reset every `failed` unit of a run and re-run them. Returns how many
    /// were reset.
    pub fn retry_failed_tasks(&self, run_id: &RunId) -> PipelineResult<usize> {
        let (token, done) = self.reserve_for_retry(run_id)?;
        let reset = match self.reset_failed(run_id) {
            Ok(n) => n,
            Err(e) => {
                self.release(run_id, done);
                return Err(e);
            }
        };
        if reset == 0 {
            self.release(run_id, done);
        } else {
            tracing::info!(run_id = %run_id, units = reset, "retrying failed units");
            self.spawn_driver(*run_id, DriveMode::Retry, token, done);
        }
        Ok(reset)
    }

    /// Dispatch every `pending` article, optionally within a digest-date
    /// range.
    pub async fn enrich_pending(&self, range: Option<DateRange>) -> PipelineResult<DispatchSummary> {
        let dispatcher = self
            .inner
            .enrichment
            .as_ref()
            .ok_or(PipelineError::EnrichmentDisabled)?;
        let ids: Vec<ArticleId> = self
            .inner
            .store
            .articles_with_enrichment_status(EnrichmentStatus::Pending, range)?;
        tracing::info!(articles = ids.len(), "enriching pending articles");
        Ok(dispatcher.dispatch(ids, None).await)
    }

    /// Move `failed` articles under the retry cap back to `pending` and
    /// dispatch them.
    pub async fn retry_failed_enrichment(&self, range: Option<DateRange>) -> PipelineResult<DispatchSummary> {
        let dispatcher = self
            .inner
            .enrichment
            .as_ref()
            .ok_or(PipelineError::EnrichmentDisabled)?;
        let ids = self
            .inner
            .store
            .reset_failed_enrichment(range, self.inner.retry_cap)?;
        tracing::info!(articles = ids.len(), retry_cap = self.inner.retry_cap, "retrying failed enrichment");
        Ok(dispatcher.dispatch(ids, None).await)
    }

    /// Close out `queued`/`running` runs no driver in this process owns.
    /// Returns the reconciled runs.
    pub fn recover_interrupted(&self) -> PipelineResult<Vec<Run>> {
        let orphaned = self
            .inner
            .store
            .runs_with_status(&[RunStatus::Queued, RunStatus::Running])?;
        let mut recovered = Vec::new();
        for run in orphaned {
            if self.inner.active.contains_key(&run.id) {
                continue;
            }
            recovered.push(recovery::reconcile_run(self.inner.store.as_ref(), run)?);
        }
        if !recovered.is_empty() {
            tracing::info!(runs = recovered.len(), "reconciled interrupted runs");
        }
        Ok(recovered)
    }

    fn reserve(&self, run_id: RunId) -> Option<(CancellationToken, watch::Sender<bool>)> {
        match self.inner.active.entry(run_id) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                let token = CancellationToken::new();
                let (tx, rx) = watch::channel(false);
                slot.insert(ActiveRun {
                    token: token.clone(),
                    done: rx,
                });
                Some((token, tx))
            }
        }
    }

    fn release(&self, run_id: &RunId, done: watch::Sender<bool>) {
        self.inner.active.remove(run_id);
        let _ = done.send(true);
    }

    fn spawn_driver(&self, run_id: RunId, mode: DriveMode, token: CancellationToken, done: watch::Sender<bool>) {
        tokio::spawn(driver::drive(self.inner.clone(), run_id, mode, token, done));
    }

    /// Claim a finished run for retry. Held until the retry driver exits.
    fn reserve_for_retry(&self, run_id: &RunId) -> PipelineResult<(CancellationToken, watch::Sender<bool>)> {
        let rejected = |reason: &str| PipelineError::RetryRejected {
            run_id: *run_id,
            reason: reason.to_string(),
        };
        let (token, done) = self
            .reserve(*run_id)
            .ok_or_else(|| rejected("run is active in this process"))?;

        let checked = self.get_run(run_id).and_then(|run| match run.status {
            RunStatus::Cancelled => Err(rejected("run was cancelled")),
            RunStatus::Queued | RunStatus::Running => Err(rejected("run is still in progress")),
            _ => Ok(()),
        });
        if let Err(e) = checked {
            self.release(run_id, done);
            return Err(e);
        }
        Ok((token, done))
    }

    fn reset_task(&self, run_id: &RunId, source: &str, date: NaiveDate) -> PipelineResult<TaskUnit> {
        let mut task = self
            .inner
            .store
            .get_task(run_id, source, date)?
            .ok_or_else(|| PipelineError::TaskNotFound {
                run_id: *run_id,
                source_id: source.to_string(),
                date,
            })?;
        if task.status != TaskStatus::Failed {
            return Err(PipelineError::RetryRejected {
                run_id: *run_id,
                reason: format!("unit {} on {} is {}, not failed", source, date, task.status),
            });
        }
        task.reset_for_retry()?;
        if !self.inner.store.transition_task(&task, TaskStatus::Failed)? {
            return Err(PipelineError::RetryRejected {
                run_id: *run_id,
                reason: format!("unit {} on {} changed concurrently", source, date),
            });
        }
        Ok(task)
    }

    fn reset_failed(&self, run_id: &RunId) -> PipelineResult<usize> {
        let mut reset = 0;
        for mut task in self.inner.store.list_tasks(run_id)? {
            if task.status != TaskStatus::Failed {
                continue;
            }
            task.reset_for_retry()?;
            if self.inner.store.transition_task(&task, TaskStatus::Failed)? {
                reset += 1;
            }
        }
        Ok(reset)
    }
}
