//! Enrichment hand-off
//!
//! Articles are saved `pending`. The dispatcher calls the enricher for each
//! pending article under a shared semaphore and records `done` or `failed`.
//! A fatal enricher error stops the rest of the batch and leaves those
//! articles `pending` for the next sweep. Enrichment never touches task
//! unit status.

use super::related::{rank_related, RELATED_WINDOW_DAYS};
use super::{EnrichmentRequest, Enricher};
use crate::article::{ArticleId, EnrichmentStatus, StoredArticle};
use crate::storage::{DateRange, Store};
use chrono::{Duration, NaiveDate};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};

/// Hook for whoever owns a dispatch batch (a run's progress tracker).
pub trait EnrichmentObserver: Send + Sync {
    fn on_enriched(&self, _id: ArticleId) {}

    fn on_enrichment_failed(&self, _id: ArticleId) {}

    /// Queued enrichments that haven't started are skipped once this is true.
    fn is_cancelled(&self) -> bool {
        false
    }
}

/// Outcome counts of one dispatch batch
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct DispatchSummary {
    pub requested: usize,
    pub enriched: usize,
    pub failed: usize,
    /// Not attempted: not pending, aborted or cancelled
    pub skipped: usize,
    /// A fatal error stopped the batch
    pub aborted: bool,
}

enum Outcome {
    Enriched(ArticleId),
    Failed,
    Skipped,
}

#[derive(Clone)]
pub struct EnrichmentDispatcher {
    store: Arc<dyn Store>,
    enricher: Arc<dyn Enricher>,
    semaphore: Arc<Semaphore>,
}

impl EnrichmentDispatcher {
    pub fn new(store: Arc<dyn Store>, enricher: Arc<dyn Enricher>, concurrency: usize) -> Self {
        Self {
            store,
            enricher,
            semaphore: Arc::new(Semaphore::new(concurrency.max(1))),
        }
    }

    /// Run `dispatch` in the background.
    pub fn spawn(
        &self,
        ids: Vec<ArticleId>,
        observer: Option<Arc<dyn EnrichmentObserver>>,
    ) -> JoinHandle<DispatchSummary> {
        let this = self.clone();
        tokio::spawn(async move { this.dispatch(ids, observer).await })
    }

    /// Enrich every `pending` article among `ids`, then refresh related
    /// articles for the ones that succeeded.
    pub async fn dispatch(
        &self,
        ids: Vec<ArticleId>,
        observer: Option<Arc<dyn EnrichmentObserver>>,
    ) -> DispatchSummary {
        let mut summary = DispatchSummary {
            requested: ids.len(),
            ..Default::default()
        };
        if ids.is_empty() {
            return summary;
        }

        let articles = match self.store.get_articles(&ids) {
            Ok(a) => a,
            Err(e) => {
                tracing::error!(error = %e, count = ids.len(), "failed to load articles for enrichment");
                summary.skipped = ids.len();
                return summary;
            }
        };
        let pending: Vec<StoredArticle> = articles
            .into_iter()
            .filter(|a| a.enrichment_status == EnrichmentStatus::Pending)
            .collect();
        summary.skipped = ids.len() - pending.len();

        let abort = Arc::new(AtomicBool::new(false));
        let mut join_set = JoinSet::new();

        for article in pending {
            let store = self.store.clone();
            let enricher = self.enricher.clone();
            let semaphore = self.semaphore.clone();
            let abort = abort.clone();
            let observer = observer.clone();

            join_set.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return Outcome::Skipped;
                };
                if abort.load(Ordering::SeqCst) || observer.as_ref().is_some_and(|o| o.is_cancelled()) {
                    return Outcome::Skipped;
                }

                let request = EnrichmentRequest::for_article(&article);
                match enricher.enrich(&request).await {
                    Ok(payload) => match store.save_enrichment(article.id, &payload) {
                        Ok(()) => {
                            if let Some(o) = &observer {
                                o.on_enriched(article.id);
                            }
                            Outcome::Enriched(article.id)
                        }
                        Err(e) => {
                            tracing::error!(article_id = %article.id, error = %e, "failed to store enrichment");
                            Outcome::Skipped
                        }
                    },
                    Err(e) if e.is_fatal() => {
                        if !abort.swap(true, Ordering::SeqCst) {
                            tracing::error!(
                                article_id = %article.id,
                                enricher = enricher.id(),
                                error = %e,
                                "fatal enrichment error, aborting remaining batch"
                            );
                        }
                        Outcome::Skipped
                    }
                    Err(e) => {
                        tracing::warn!(article_id = %article.id, error = %e, "enrichment failed");
                        if let Err(store_err) = store.mark_enrichment_failed(article.id, &e.to_string()) {
                            tracing::error!(article_id = %article.id, error = %store_err, "failed to record enrichment failure");
                            return Outcome::Skipped;
                        }
                        if let Some(o) = &observer {
                            o.on_enrichment_failed(article.id);
                        }
                        Outcome::Failed
                    }
                }
            });
        }

        let mut enriched_ids = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(Outcome::Enriched(id)) => enriched_ids.push(id),
                Ok(Outcome::Failed) => summary.failed += 1,
                Ok(Outcome::Skipped) => summary.skipped += 1,
                Err(e) => {
                    tracing::error!(error = %e, "enrichment task panicked");
                    summary.skipped += 1;
                }
            }
        }
        summary.enriched = enriched_ids.len();
        summary.aborted = abort.load(Ordering::SeqCst);

        enriched_ids.sort();
        self.compute_related(&enriched_ids);

        tracing::info!(
            requested = summary.requested,
            enriched = summary.enriched,
            failed = summary.failed,
            skipped = summary.skipped,
            aborted = summary.aborted,
            "enrichment batch finished"
        );
        summary
    }

    /// Refresh related ids for newly enriched articles. Best effort.
    fn compute_related(&self, ids: &[ArticleId]) {
        if ids.is_empty() {
            return;
        }
        let articles = match self.store.get_articles(ids) {
            Ok(a) => a,
            Err(e) => {
                tracing::warn!(error = %e, "failed to load articles for related ranking");
                return;
            }
        };

        let mut pools: HashMap<NaiveDate, Vec<StoredArticle>> = HashMap::new();
        for article in &articles {
            let date = article.digest_date;
            if !pools.contains_key(&date) {
                let window = DateRange::new(date - Duration::days(RELATED_WINDOW_DAYS), date);
                match self.store.enriched_articles(window) {
                    Ok(pool) => {
                        pools.insert(date, pool);
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, %date, "failed to load related pool");
                        continue;
                    }
                }
            }
            let related = rank_related(article, &pools[&date]);
            if let Err(e) = self.store.set_related(article.id, &related) {
                tracing::warn!(article_id = %article.id, error = %e, "failed to store related articles");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::article::{CandidateArticle, NewArticle};
    use crate::enrich::{Category, EnrichmentError, MockEnricher};
    use crate::storage::{ArticleStore, OpenStore, SqliteStore};
    use std::sync::atomic::AtomicUsize;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 2, 20).unwrap()
    }

    fn store_with(titles: &[&str]) -> (Arc<SqliteStore>, Vec<ArticleId>) {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let ids = titles
            .iter()
            .enumerate()
            .map(|(i, t)| {
                let c = CandidateArticle::new(*t, format!("https://a.example/{}", i));
                store
                    .insert_article(&NewArticle::from_candidate(&c, "A", day(), None, None))
                    .unwrap()
                    .unwrap()
            })
            .collect();
        (store, ids)
    }

    #[derive(Default)]
    struct Counter {
        enriched: AtomicUsize,
        failed: AtomicUsize,
        cancelled: AtomicBool,
    }

    impl EnrichmentObserver for Counter {
        fn on_enriched(&self, _id: ArticleId) {
            self.enriched.fetch_add(1, Ordering::SeqCst);
        }

        fn on_enrichment_failed(&self, _id: ArticleId) {
            self.failed.fetch_add(1, Ordering::SeqCst);
        }

        fn is_cancelled(&self) -> bool {
            self.cancelled.load(Ordering::SeqCst)
        }
    }

    #[tokio::test]
    async fn test_success_and_failure_are_recorded_per_article() {
        let (store, ids) = store_with(&["Agents ship", "Broken one"]);
        let enricher = MockEnricher::new().with_failure("Broken one", EnrichmentError::Timeout(60));
        let dispatcher = EnrichmentDispatcher::new(store.clone(), Arc::new(enricher), 2);
        let counter = Arc::new(Counter::default());

        let summary = dispatcher.dispatch(ids.clone(), Some(counter.clone())).await;

        assert_eq!(summary.enriched, 1);
        assert_eq!(summary.failed, 1);
        assert!(!summary.aborted);
        assert_eq!(counter.enriched.load(Ordering::SeqCst), 1);
        assert_eq!(counter.failed.load(Ordering::SeqCst), 1);

        let ok = store.get_article(ids[0]).unwrap().unwrap();
        assert_eq!(ok.enrichment_status, EnrichmentStatus::Done);
        let bad = store.get_article(ids[1]).unwrap().unwrap();
        assert_eq!(bad.enrichment_status, EnrichmentStatus::Failed);
        assert!(bad.enrichment_error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_fatal_error_aborts_batch_and_leaves_rest_pending() {
        let (store, ids) = store_with(&["first", "second", "third"]);
        let enricher = MockEnricher::new().with_failure("first", EnrichmentError::Fatal("bad key".into()));
        // One permit: articles run in order, so "first" aborts the others
        let dispatcher = EnrichmentDispatcher::new(store.clone(), Arc::new(enricher), 1);

        let summary = dispatcher.dispatch(ids.clone(), None).await;

        assert!(summary.aborted);
        assert_eq!(summary.enriched + summary.failed, 0);
        for id in ids {
            let a = store.get_article(id).unwrap().unwrap();
            assert_eq!(a.enrichment_status, EnrichmentStatus::Pending);
        }
    }

    #[tokio::test]
    async fn test_cancelled_owner_skips_queued_work() {
        let (store, ids) = store_with(&["one", "two"]);
        let enricher = Arc::new(MockEnricher::new());
        let dispatcher = EnrichmentDispatcher::new(store.clone(), enricher.clone(), 1);
        let counter = Arc::new(Counter::default());
        counter.cancelled.store(true, Ordering::SeqCst);

        let summary = dispatcher.dispatch(ids, Some(counter)).await;

        assert_eq!(summary.skipped, 2);
        assert_eq!(enricher.call_count(), 0);
    }

    #[tokio::test]
    async fn test_non_pending_articles_are_not_redispatched() {
        let (store, ids) = store_with(&["one"]);
        let enricher = Arc::new(MockEnricher::new());
        let dispatcher = EnrichmentDispatcher::new(store.clone(), enricher.clone(), 1);

        dispatcher.dispatch(ids.clone(), None).await;
        let summary = dispatcher.dispatch(ids, None).await;

        assert_eq!(summary.skipped, 1);
        assert_eq!(enricher.call_count(), 1);
    }

    #[tokio::test]
    async fn test_related_articles_computed_after_batch() {
        let (store, ids) = store_with(&["llm agents benchmark", "llm agents release", "robot arms"]);
        let enricher = MockEnricher::new().with_default_category(Category::Research);
        let dispatcher = EnrichmentDispatcher::new(store.clone(), Arc::new(enricher), 3);

        dispatcher.dispatch(ids.clone(), None).await;

        let first = store.get_article(ids[0]).unwrap().unwrap();
        assert_eq!(first.related_ids[0], ids[1]);
        assert!(first.related_ids.len() <= 3);
    }
}
