//! Reconciliation of runs orphaned by a dead process

use super::PipelineResult;
use crate::run::{Run, RunProgress, RunResult, RunStatus, Stage, TaskStatus, TaskUnit};
use crate::storage::Store;
use chrono::NaiveDate;
use std::collections::BTreeMap;

pub(crate) const INTERRUPTED: &str = "interrupted: orchestrator exited before the unit finished";

/// Close out a `queued`/`running` run that nothing is driving.
///
/// Unfinished units become `failed` so they can be retried. If a cancel had
/// been requested, `running` units become `cancelled` and `pending` ones are
/// left alone. The run is classified like any other.
pub(crate) fn reconcile_run(store: &dyn Store, mut run: Run) -> PipelineResult<Run> {
    let expected = run.status;
    let cancel = run.cancel_requested;
    let mut tasks = store.list_tasks(&run.id)?;

    for task in &mut tasks {
        let before = task.status;
        let saved = task.articles_saved;
        match (before, cancel) {
            (TaskStatus::Running, true) => task.cancel(saved)?,
            (TaskStatus::Running, false) | (TaskStatus::Pending, false) => task.fail(INTERRUPTED, saved)?,
            _ => continue,
        }
        if !store.transition_task(task, before)? {
            // Lost to a concurrent writer; take whatever it wrote
            if let Some(current) = store.get_task(&run.id, &task.source, task.date)? {
                *task = current;
            }
        }
    }

    let progress = settled_progress(&run.progress, &tasks);
    let seq = store.progress_seq(&run.id)? + 1;
    store.save_progress(&run.id, &progress, seq)?;

    let next = RunStatus::classify(tasks.iter().map(|t| t.status), cancel);
    if expected == RunStatus::Queued && !run.status.can_transition_to(next) {
        run.transition(RunStatus::Running)?;
    }
    run.transition(next)?;
    run.result = Some(RunResult::from_tasks(&progress, &tasks, run.elapsed_seconds()));
    run.progress = progress;

    if store.transition_run(&run, expected)? {
        tracing::warn!(
            run_id = %run.id,
            status = %run.status,
            cancel_requested = cancel,
            "reconciled interrupted run"
        );
    } else if let Some(current) = store.get_run(&run.id)? {
        return Ok(current);
    }
    Ok(run)
}

/// Completion counters recomputed from the units' final statuses.
fn settled_progress(progress: &RunProgress, tasks: &[TaskUnit]) -> RunProgress {
    let mut by_date: BTreeMap<NaiveDate, bool> = BTreeMap::new();
    for task in tasks {
        let all_done = by_date.entry(task.date).or_insert(true);
        *all_done &= task.status.is_terminal();
    }
    RunProgress {
        stage: Some(Stage::Finalizing),
        tasks_completed: tasks.iter().filter(|t| t.status.is_terminal()).count() as u64,
        dates_completed: by_date.values().filter(|done| **done).count() as u64,
        ..progress.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::SourceSelection;
    use crate::storage::{OpenStore, RunStore, SqliteStore};

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 2, d).unwrap()
    }

    fn create_test_store() -> SqliteStore {
        SqliteStore::open_in_memory().unwrap()
    }

    /// A run that was `running` with one unit done, one mid-flight and one
    /// never started.
    fn orphaned_run(store: &SqliteStore, cancel: bool) -> Run {
        let mut run = Run::new(day(20), day(21), SourceSelection::new(["A", "B"]));
        let mut done = TaskUnit::new(run.id, "A", day(20));
        let mut mid = TaskUnit::new(run.id, "B", day(20));
        let idle = TaskUnit::new(run.id, "A", day(21));
        run.progress = RunProgress::new(3, 2);
        store.create_run(&run, &[done.clone(), mid.clone(), idle]).unwrap();

        run.transition(RunStatus::Running).unwrap();
        store.transition_run(&run, RunStatus::Queued).unwrap();

        done.start().unwrap();
        store.transition_task(&done, TaskStatus::Pending).unwrap();
        done.succeed(4).unwrap();
        store.transition_task(&done, TaskStatus::Running).unwrap();

        mid.start().unwrap();
        store.transition_task(&mid, TaskStatus::Pending).unwrap();

        if cancel {
            store.request_cancel(&run.id).unwrap();
        }
        store.get_run(&run.id).unwrap().unwrap()
    }

    #[test]
    fn test_unfinished_units_become_retryable_failures() {
        let store = create_test_store();
        let run = orphaned_run(&store, false);

        let reconciled = reconcile_run(&store, run.clone()).unwrap();
        assert_eq!(reconciled.status, RunStatus::Partial);
        assert!(reconciled.completed_at.is_some());

        let tasks = store.list_tasks(&run.id).unwrap();
        let failed: Vec<_> = tasks.iter().filter(|t| t.status == TaskStatus::Failed).collect();
        assert_eq!(failed.len(), 2);
        assert!(failed.iter().all(|t| t.error_message.as_deref() == Some(INTERRUPTED)));

        let stored = store.get_run(&run.id).unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Partial);
        assert_eq!(stored.progress.tasks_completed, 3);
        assert_eq!(stored.progress.dates_completed, 2);
        let result = stored.result.unwrap();
        assert_eq!((result.tasks_succeeded, result.tasks_failed), (1, 2));
    }

    #[test]
    fn test_cancel_requested_keeps_pending_units() {
        let store = create_test_store();
        let run = orphaned_run(&store, true);

        let reconciled = reconcile_run(&store, run.clone()).unwrap();
        assert_eq!(reconciled.status, RunStatus::Cancelled);

        let tasks = store.list_tasks(&run.id).unwrap();
        let status_of = |source: &str, d: u32| {
            tasks
                .iter()
                .find(|t| t.source == source && t.date == day(d))
                .unwrap()
                .status
        };
        assert_eq!(status_of("A", 20), TaskStatus::Success);
        assert_eq!(status_of("B", 20), TaskStatus::Cancelled);
        assert_eq!(status_of("A", 21), TaskStatus::Pending);

        let stored = store.get_run(&run.id).unwrap().unwrap();
        assert_eq!(stored.progress.tasks_completed, 2);
        assert_eq!(stored.progress.dates_completed, 1);
        assert_eq!(stored.result.unwrap().tasks_pending, 1);
    }

    #[test]
    fn test_queued_run_without_driver_fails() {
        let store = create_test_store();
        let run = Run::new(day(20), day(20), SourceSelection::new(["A"]));
        store
            .create_run(&run, &[TaskUnit::new(run.id, "A", day(20))])
            .unwrap();

        let reconciled = reconcile_run(&store, run.clone()).unwrap();
        assert_eq!(reconciled.status, RunStatus::Failed);
        let tasks = store.list_tasks(&run.id).unwrap();
        assert_eq!(tasks[0].status, TaskStatus::Failed);
    }
}
