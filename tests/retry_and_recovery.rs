//! Retry of failed units and reconciliation after a crash
//!
//! A "crash" is simulated by writing a queued/running run straight into the
//! store and then opening a fresh orchestrator over the same database.
//!
//! Run with: `cargo test --test retry_and_recovery`

mod common;

use common::{articles, day, open_store, orchestrator};
use newsroom::pipeline::PipelineError;
use newsroom::run::{Run, RunStatus, SourceSelection, TaskStatus, TaskUnit};
use newsroom::source::{Failure, StaticSource};
use newsroom::storage::{ArticleStore, RunStore};
use std::sync::Arc;
use tempfile::tempdir;

fn two_day_source() -> Arc<StaticSource> {
    Arc::new(
        StaticSource::new("A")
            .with_articles(day(20), articles("d20", 4))
            .with_articles(day(21), articles("d21", 3)),
    )
}

/// A run left `running` by a dead process: day 20 mid-flight, day 21 untouched.
fn orphaned_run(store: &dyn RunStore) -> Run {
    let mut run = Run::new(day(20), day(21), SourceSelection::new(["A"]));
    run.transition(RunStatus::Running).unwrap();
    let mut started = TaskUnit::new(run.id, "A", day(20));
    started.start().unwrap();
    let untouched = TaskUnit::new(run.id, "A", day(21));
    store.create_run(&run, &[started, untouched]).unwrap();
    run
}

#[tokio::test]
async fn orphaned_run_is_reconciled_then_retried_to_success() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("newsroom.db");
    let run = orphaned_run(open_store(&path).as_ref());

    let orch = orchestrator(open_store(&path), &[two_day_source()]).build();
    let recovered = orch.recover_interrupted().unwrap();
    assert_eq!(recovered.len(), 1);
    assert_eq!(recovered[0].id, run.id);
    assert_eq!(recovered[0].status, RunStatus::Failed);
    assert!(recovered[0].completed_at.is_some());

    let tasks = orch.list_tasks(&run.id).unwrap();
    assert!(tasks.iter().all(|t| t.status == TaskStatus::Failed));
    assert!(tasks
        .iter()
        .all(|t| t.error_message.as_deref().unwrap_or("").contains("interrupted")));

    // Nothing left to reconcile
    assert!(orch.recover_interrupted().unwrap().is_empty());

    assert_eq!(orch.retry_failed_tasks(&run.id).unwrap(), 2);
    let retried = orch.wait(&run.id).await.unwrap();
    assert_eq!(retried.status, RunStatus::Success);
    assert_eq!(retried.result.as_ref().unwrap().tasks_succeeded, 2);

    let tasks = orch.list_tasks(&run.id).unwrap();
    let first = tasks.iter().find(|t| t.date == day(20)).unwrap();
    let second = tasks.iter().find(|t| t.date == day(21)).unwrap();
    assert_eq!((first.attempts, first.articles_saved), (2, 4));
    assert_eq!((second.attempts, second.articles_saved), (1, 3));
    assert!(first.error_message.is_none());
}

#[tokio::test]
async fn orphaned_run_with_cancel_request_is_cancelled() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("newsroom.db");
    let store = open_store(&path);
    let run = orphaned_run(store.as_ref());
    assert!(store.request_cancel(&run.id).unwrap());

    let orch = orchestrator(open_store(&path), &[two_day_source()]).build();
    let recovered = orch.recover_interrupted().unwrap();
    assert_eq!(recovered[0].status, RunStatus::Cancelled);

    let tasks = orch.list_tasks(&run.id).unwrap();
    let first = tasks.iter().find(|t| t.date == day(20)).unwrap();
    let second = tasks.iter().find(|t| t.date == day(21)).unwrap();
    assert_eq!(first.status, TaskStatus::Cancelled);
    // Units that never started stay pending under a cancel
    assert_eq!(second.status, TaskStatus::Pending);

    let err = orch.retry_failed_tasks(&run.id).unwrap_err();
    assert!(matches!(err, PipelineError::RetryRejected { .. }));
}

#[tokio::test]
async fn retry_after_restart_saves_only_what_is_missing() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("newsroom.db");

    let source = two_day_source();
    source.set_failure(day(20), Failure::AfterItems(2, "HTTP 503".into()));

    let run_id = {
        let orch = orchestrator(open_store(&path), &[source.clone()])
            .pipeline(newsroom::config::PipelineConfig {
                batch_size: 1,
                ..Default::default()
            })
            .build();
        let run_id = orch.start_run(day(20), day(21), SourceSelection::new(["A"])).unwrap();
        let run = orch.wait(&run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Partial);
        run_id
    };

    let store = open_store(&path);
    let failed = store.get_task(&run_id, "A", day(20)).unwrap().unwrap();
    assert_eq!(failed.status, TaskStatus::Failed);
    assert_eq!(failed.articles_saved, 2);
    assert!(failed.error_message.as_deref().unwrap().contains("HTTP 503"));
    assert_eq!(store.count_articles().unwrap(), 5);

    // Restarted process, source recovered
    source.clear_failure(day(20));
    let orch = orchestrator(store.clone(), &[source.clone()]).build();
    let reset = orch.retry_task(&run_id, "A", day(20)).unwrap();
    assert_eq!(reset.status, TaskStatus::Pending);
    let run = orch.wait(&run_id).await.unwrap();

    assert_eq!(run.status, RunStatus::Success);
    let retried = store.get_task(&run_id, "A", day(20)).unwrap().unwrap();
    assert_eq!(retried.status, TaskStatus::Success);
    assert_eq!(retried.attempts, 2);
    // The two saved before the failure are filtered out as known fingerprints
    assert_eq!(retried.articles_saved, 2);
    assert_eq!(store.count_articles().unwrap(), 7);

    // Success is final for the unit
    let err = orch.retry_task(&run_id, "A", day(20)).unwrap_err();
    assert!(matches!(err, PipelineError::RetryRejected { .. }));
}
