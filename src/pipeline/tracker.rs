//! Live progress of one run
//!
//! All units of a run update a single `RunTracker`. The mutex is held only
//! to mutate and snapshot; the snapshot is persisted after the lock is
//! released, tagged with the sequence number it was taken at. The store
//! drops any write older than what it already has.
//!
//! The tracker also owns the run's dedup section: a `tokio` mutex around the
//! embeddings saved by this run's units. A unit holds it from the fingerprint
//! check through the last insert of a batch, so two units of the same run
//! never both accept the same story.

use crate::article::ArticleId;
use crate::enrich::{DispatchSummary, EnrichmentObserver};
use crate::run::{CancellationToken, RunId, RunProgress, Stage, TaskId, TaskUnit};
use crate::storage::Store;
use chrono::NaiveDate;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

struct TrackerState {
    progress: RunProgress,
    seq: u64,
    /// Units that have reached a terminal state at least once
    completed: HashSet<TaskId>,
    /// Units per date not yet in `completed`
    remaining_by_date: HashMap<NaiveDate, usize>,
    enrichment: Vec<JoinHandle<DispatchSummary>>,
}

/// Embeddings saved by this run, in save order. Append-only.
#[derive(Debug, Default)]
pub struct RunCorpus {
    saved: Vec<(ArticleId, Vec<f32>)>,
}

impl RunCorpus {
    /// Entries appended after the first `seen`.
    pub fn since(&self, seen: usize) -> &[(ArticleId, Vec<f32>)] {
        &self.saved[seen.min(self.saved.len())..]
    }

    pub fn len(&self) -> usize {
        self.saved.len()
    }

    pub fn push(&mut self, id: ArticleId, embedding: Vec<f32>) {
        self.saved.push((id, embedding));
    }
}

pub struct RunTracker {
    run_id: RunId,
    store: Arc<dyn Store>,
    token: CancellationToken,
    state: Mutex<TrackerState>,
    dedup: tokio::sync::Mutex<RunCorpus>,
}

impl RunTracker {
    /// Track a run whose `pending` units are about to execute.
    ///
    /// `seq` is the last persisted progress sequence. Units already
    /// terminal count as completed.
    pub fn new(
        run_id: RunId,
        store: Arc<dyn Store>,
        token: CancellationToken,
        progress: RunProgress,
        seq: u64,
        tasks: &[TaskUnit],
    ) -> Self {
        let mut completed = HashSet::new();
        let mut remaining_by_date: HashMap<NaiveDate, usize> = HashMap::new();
        for task in tasks {
            if task.status.is_terminal() || task.attempts > 0 {
                completed.insert(task.id);
            } else {
                *remaining_by_date.entry(task.date).or_default() += 1;
            }
        }
        Self {
            run_id,
            store,
            token,
            state: Mutex::new(TrackerState {
                progress,
                seq,
                completed,
                remaining_by_date,
                enrichment: Vec::new(),
            }),
            dedup: tokio::sync::Mutex::new(RunCorpus::default()),
        }
    }

    /// Enter the run's dedup section.
    pub async fn dedup_section(&self) -> tokio::sync::MutexGuard<'_, RunCorpus> {
        self.dedup.lock().await
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn snapshot(&self) -> RunProgress {
        self.state.lock().unwrap().progress.clone()
    }

    /// Apply `f` to the progress and persist the result.
    pub fn update(&self, f: impl FnOnce(&mut RunProgress)) {
        let (snapshot, seq) = {
            let mut state = self.state.lock().unwrap();
            f(&mut state.progress);
            state.seq += 1;
            (state.progress.clone(), state.seq)
        };
        self.persist(&snapshot, seq);
    }

    fn persist(&self, progress: &RunProgress, seq: u64) {
        match self.store.save_progress(&self.run_id, progress, seq) {
            Ok(true) => {}
            Ok(false) => {
                tracing::trace!(run_id = %self.run_id, seq, "stale progress write dropped");
            }
            Err(e) => {
                tracing::warn!(run_id = %self.run_id, error = %e, "failed to persist progress");
            }
        }
    }

    pub fn enter_stage(&self, stage: Stage, date: NaiveDate, source: &str) {
        self.update(|p| {
            p.stage = Some(stage);
            p.current_date = Some(date);
            p.current_source = Some(source.to_string());
        });
    }

    pub fn set_stage(&self, stage: Stage) {
        self.update(|p| p.stage = Some(stage));
    }

    /// Count a unit reaching a terminal state. Re-completions after a retry
    /// don't count again.
    pub fn task_finished(&self, task: &TaskUnit) {
        self.update_with_state(|state| {
            if !state.completed.insert(task.id) {
                return;
            }
            state.progress.tasks_completed += 1;
            if let Some(remaining) = state.remaining_by_date.get_mut(&task.date) {
                *remaining = remaining.saturating_sub(1);
                if *remaining == 0 {
                    state.remaining_by_date.remove(&task.date);
                    state.progress.dates_completed += 1;
                }
            }
        });
    }

    fn update_with_state(&self, f: impl FnOnce(&mut TrackerState)) {
        let (snapshot, seq) = {
            let mut state = self.state.lock().unwrap();
            f(&mut state);
            state.seq += 1;
            (state.progress.clone(), state.seq)
        };
        self.persist(&snapshot, seq);
    }

    pub fn push_enrichment(&self, handle: JoinHandle<DispatchSummary>) {
        self.state.lock().unwrap().enrichment.push(handle);
    }

    pub fn take_enrichment(&self) -> Vec<JoinHandle<DispatchSummary>> {
        std::mem::take(&mut self.state.lock().unwrap().enrichment)
    }

    /// Await every enrichment batch handed off so far, including batches
    /// handed off while waiting.
    pub async fn drain_enrichment(&self) {
        loop {
            let handles = self.take_enrichment();
            if handles.is_empty() {
                break;
            }
            for handle in handles {
                if let Err(e) = handle.await {
                    tracing::error!(run_id = %self.run_id, error = %e, "enrichment batch panicked");
                }
            }
        }
    }
}

impl EnrichmentObserver for RunTracker {
    fn on_enriched(&self, _id: ArticleId) {
        self.update(|p| p.enriched += 1);
    }

    fn on_enrichment_failed(&self, _id: ArticleId) {
        self.update(|p| p.enrichment_failed += 1);
    }

    fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::{Run, SourceSelection};
    use crate::storage::{OpenStore, RunStore, SqliteStore};

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 2, d).unwrap()
    }

    fn setup() -> (Arc<SqliteStore>, Run, Vec<TaskUnit>) {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let run = Run::new(day(20), day(21), SourceSelection::new(["A", "B"]));
        let tasks = vec![
            TaskUnit::new(run.id, "A", day(20)),
            TaskUnit::new(run.id, "B", day(20)),
            TaskUnit::new(run.id, "A", day(21)),
        ];
        store.create_run(&run, &tasks).unwrap();
        (store, run, tasks)
    }

    #[test]
    fn test_dates_complete_when_all_their_units_finish() {
        let (store, run, tasks) = setup();
        let tracker = RunTracker::new(run.id, store.clone(), CancellationToken::new(), RunProgress::new(3, 2), 0, &tasks);

        tracker.task_finished(&tasks[0]);
        assert_eq!(tracker.snapshot().dates_completed, 0);
        tracker.task_finished(&tasks[1]);
        tracker.task_finished(&tasks[1]);
        let p = tracker.snapshot();
        assert_eq!(p.tasks_completed, 2);
        assert_eq!(p.dates_completed, 1);

        let persisted = store.get_run(&run.id).unwrap().unwrap().progress;
        assert_eq!(persisted, p);
    }

    #[test]
    fn test_retried_units_do_not_recount() {
        let (store, run, mut tasks) = setup();
        tasks[0].start().unwrap();
        tasks[0].fail("boom", 0).unwrap();
        let mut progress = RunProgress::new(3, 2);
        progress.tasks_completed = 1;

        let tracker = RunTracker::new(run.id, store, CancellationToken::new(), progress, 7, &tasks);
        tasks[0].reset_for_retry().unwrap();
        tracker.task_finished(&tasks[0]);

        assert_eq!(tracker.snapshot().tasks_completed, 1);
    }

    #[test]
    fn test_progress_writes_start_after_persisted_sequence() {
        let (store, run, tasks) = setup();
        let mut ahead = RunProgress::new(3, 2);
        ahead.saved = 10;
        store.save_progress(&run.id, &ahead, 5).unwrap();

        // A tracker that believes seq is 0 loses its first few writes
        let stale = RunTracker::new(run.id, store.clone(), CancellationToken::new(), RunProgress::new(3, 2), 0, &tasks);
        stale.update(|p| p.saved = 1);
        assert_eq!(store.get_run(&run.id).unwrap().unwrap().progress.saved, 10);

        let current = RunTracker::new(run.id, store.clone(), CancellationToken::new(), ahead, 5, &tasks);
        current.update(|p| p.saved += 1);
        assert_eq!(store.get_run(&run.id).unwrap().unwrap().progress.saved, 11);
    }

    #[test]
    fn test_enrichment_callbacks_count() {
        let (store, run, tasks) = setup();
        let tracker = RunTracker::new(run.id, store, CancellationToken::new(), RunProgress::new(3, 2), 0, &tasks);
        tracker.on_enriched(ArticleId(1));
        tracker.on_enriched(ArticleId(2));
        tracker.on_enrichment_failed(ArticleId(3));
        let p = tracker.snapshot();
        assert_eq!((p.enriched, p.enrichment_failed), (2, 1));
        assert!(!tracker.is_cancelled());
        tracker.token().cancel();
        assert!(tracker.is_cancelled());
    }

    #[tokio::test]
    async fn test_units_see_articles_saved_by_siblings() {
        let (store, run, tasks) = setup();
        let tracker = RunTracker::new(run.id, store, CancellationToken::new(), RunProgress::new(3, 2), 0, &tasks);

        let mut synced = {
            let mut section = tracker.dedup_section().await;
            section.push(ArticleId(1), vec![1.0, 0.0]);
            section.len()
        };
        tracker.dedup_section().await.push(ArticleId(2), vec![0.0, 1.0]);

        let section = tracker.dedup_section().await;
        let unseen: Vec<ArticleId> = section.since(synced).iter().map(|(id, _)| *id).collect();
        assert_eq!(unseen, vec![ArticleId(2)]);
        synced = section.len();
        assert!(section.since(synced).is_empty());
        assert!(section.since(synced + 5).is_empty());
    }
}
