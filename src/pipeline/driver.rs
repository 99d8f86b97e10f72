//! The per-run driver task
//!
//! One driver per active run. It claims the run, fans `pending` units out to
//! a `JoinSet` bounded by a semaphore, waits for them and the enrichment they
//! handed off, then classifies and finalizes the run.

use super::task::{run_unit, UnitContext};
use super::tracker::RunTracker;
use super::{Inner, PipelineError, PipelineResult};
use crate::run::{CancellationToken, RunId, RunResult, RunStatus, Stage, TaskStatus};
use std::sync::Arc;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;

/// Recorded on units a cancelled retry did not finish, so they stay
/// retryable.
pub(crate) const RETRY_CANCELLED: &str = "retry cancelled before the unit finished";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DriveMode {
    /// A newly queued run: `queued -> running -> terminal`
    Fresh,
    /// Re-running reset units of a finished run; the run is re-classified
    /// from its previous terminal status.
    Retry,
}

/// Unregisters the run and wakes waiters however the driver exits.
struct DriverGuard {
    inner: Arc<Inner>,
    run_id: RunId,
    done: watch::Sender<bool>,
}

impl Drop for DriverGuard {
    fn drop(&mut self) {
        self.inner.active.remove(&self.run_id);
        let _ = self.done.send(true);
    }
}

pub(crate) async fn drive(
    inner: Arc<Inner>,
    run_id: RunId,
    mode: DriveMode,
    token: CancellationToken,
    done: watch::Sender<bool>,
) {
    let _guard = DriverGuard {
        inner: inner.clone(),
        run_id,
        done,
    };
    if let Err(e) = drive_run(&inner, run_id, mode, &token).await {
        tracing::error!(run_id = %run_id, error = %e, "run driver failed");
    }
}

async fn drive_run(
    inner: &Arc<Inner>,
    run_id: RunId,
    mode: DriveMode,
    token: &CancellationToken,
) -> PipelineResult<()> {
    let mut run = inner
        .store
        .get_run(&run_id)?
        .ok_or(PipelineError::RunNotFound(run_id))?;

    if mode == DriveMode::Fresh {
        run.transition(RunStatus::Running)?;
        if !inner.store.transition_run(&run, RunStatus::Queued)? {
            tracing::info!(run_id = %run_id, "run is no longer queued; not starting");
            return Ok(());
        }
        tracing::info!(
            run_id = %run_id,
            from = %run.date_from,
            to = %run.date_to,
            units = run.progress.tasks_total,
            "run started"
        );
    } else {
        tracing::info!(run_id = %run_id, status = %run.status, "retrying failed units");
    }

    let tasks = inner.store.list_tasks(&run_id)?;
    let seq = inner.store.progress_seq(&run_id)?;
    let tracker = Arc::new(RunTracker::new(
        run_id,
        inner.store.clone(),
        token.clone(),
        run.progress.clone(),
        seq,
        &tasks,
    ));
    let ctx = Arc::new(UnitContext {
        store: inner.store.clone(),
        registry: inner.registry.clone(),
        gate: inner.gate.clone(),
        enrichment: inner.enrichment.clone(),
        feeds: run.selection.feeds.clone(),
        batch_size: inner.pipeline.batch_size,
        window_days: inner.window_days,
        tracker: tracker.clone(),
        observer: inner.observer.clone(),
        cancel_as_failure: mode == DriveMode::Retry,
    });

    let semaphore = Arc::new(Semaphore::new(inner.pipeline.concurrency.max(1)));
    let mut units = JoinSet::new();
    let mut cancelled = false;

    for task in tasks.into_iter().filter(|t| t.status == TaskStatus::Pending) {
        // Stop waiting for a free slot as soon as a local cancel arrives
        let permit = tokio::select! {
            permit = semaphore.clone().acquire_owned() => permit.ok(),
            _ = token.cancelled() => None,
        };
        if token.is_cancelled() || (mode == DriveMode::Fresh && cancel_persisted(inner, &run_id)) {
            token.cancel();
            cancelled = true;
            tracing::info!(run_id = %run_id, "cancellation observed; no further units start");
            break;
        }
        let Some(permit) = permit else {
            break;
        };
        let ctx = ctx.clone();
        units.spawn(async move {
            let _permit = permit;
            run_unit(&ctx, task).await
        });
    }

    while let Some(joined) = units.join_next().await {
        if let Err(e) = joined {
            tracing::error!(run_id = %run_id, error = %e, "unit worker panicked");
        }
    }
    cancelled |= token.is_cancelled();

    // A panicked worker leaves its unit `running`
    for mut task in inner.store.list_tasks(&run_id)? {
        if task.status == TaskStatus::Running {
            let saved = task.articles_saved;
            task.fail("unit worker panicked", saved)?;
            inner.store.transition_task(&task, TaskStatus::Running)?;
            tracker.task_finished(&task);
        }
    }

    // A retry stopped early hands its unstarted units back as `failed`
    if mode == DriveMode::Retry {
        for mut task in inner.store.list_tasks(&run_id)? {
            if task.status != TaskStatus::Pending {
                continue;
            }
            task.fail(RETRY_CANCELLED, task.articles_saved)?;
            if inner.store.transition_task(&task, TaskStatus::Pending)? {
                tracing::info!(run_id = %run_id, source = %task.source, date = %task.date, "unit left failed by cancelled retry");
            }
        }
    }

    tracker.drain_enrichment().await;
    tracker.set_stage(Stage::Finalizing);

    let tasks = inner.store.list_tasks(&run_id)?;
    let mut run = inner
        .store
        .get_run(&run_id)?
        .ok_or(PipelineError::RunNotFound(run_id))?;
    let expected = run.status;
    let next = match mode {
        DriveMode::Fresh => RunStatus::classify(tasks.iter().map(|t| t.status), cancelled),
        DriveMode::Retry => RunStatus::classify(tasks.iter().map(|t| t.status), false),
    };
    run.transition(next)?;
    let progress = tracker.snapshot();
    run.result = Some(RunResult::from_tasks(&progress, &tasks, run.elapsed_seconds()));
    run.progress = progress;

    if !inner.store.transition_run(&run, expected)? {
        tracing::warn!(run_id = %run_id, %expected, "run changed under the driver; result not written");
        return Ok(());
    }

    tracing::info!(
        run_id = %run_id,
        status = %run.status,
        fetched = run.progress.fetched,
        saved = run.progress.saved,
        enriched = run.progress.enriched,
        seconds = run.elapsed_seconds(),
        "run finished"
    );
    if let Some(observer) = &inner.observer {
        observer.on_run_finished(&run);
    }
    Ok(())
}

fn cancel_persisted(inner: &Inner, run_id: &RunId) -> bool {
    match inner.store.is_cancel_requested(run_id) {
        Ok(flag) => flag,
        Err(e) => {
            tracing::warn!(run_id = %run_id, error = %e, "could not read cancel flag");
            false
        }
    }
}
