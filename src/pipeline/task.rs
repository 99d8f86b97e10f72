//! Execution of a single task unit
//!
//! fetch → filter known fingerprints → dedup gate → save → enrichment
//! hand-off, one batch at a time. Every error here is recorded on the unit;
//! nothing propagates to the driver.

use super::driver::RETRY_CANCELLED;
use super::tracker::RunTracker;
use super::RunObserver;
use crate::article::{ArticleId, CandidateArticle, NewArticle};
use crate::dedup::{CorpusKey, DedupGate, Screened, SimilarityCorpus};
use crate::enrich::{EnrichmentDispatcher, EnrichmentObserver};
use crate::run::{FeedSelection, Stage, TaskStatus, TaskUnit};
use crate::source::{CandidateStream, SourceError, SourceRegistry};
use crate::storage::{DateRange, StorageError, Store};
use chrono::Duration;
use futures::StreamExt;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;

/// Everything a unit worker needs, shared by all units of one run.
pub(crate) struct UnitContext {
    pub store: Arc<dyn Store>,
    pub registry: Arc<SourceRegistry>,
    pub gate: Arc<DedupGate>,
    pub enrichment: Option<EnrichmentDispatcher>,
    pub feeds: FeedSelection,
    pub batch_size: usize,
    pub window_days: u32,
    pub tracker: Arc<RunTracker>,
    pub observer: Option<Arc<dyn RunObserver>>,
    /// Retries record a cancelled unit as `failed`; a finished run cannot be
    /// re-entered any other way.
    pub cancel_as_failure: bool,
}

#[derive(Debug, Error)]
enum UnitError {
    #[error("no connector configured for source '{0}'")]
    NoConnector(String),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("dedup worker failed: {0}")]
    Dedup(String),
}

enum Ended {
    Completed,
    Cancelled,
}

/// Drive one `pending` unit to a terminal state and return it.
pub(crate) async fn run_unit(ctx: &UnitContext, mut task: TaskUnit) -> TaskUnit {
    if let Err(e) = task.start() {
        tracing::warn!(task_id = %task.id, error = %e, "unit not startable");
        return task;
    }
    match ctx.store.transition_task(&task, TaskStatus::Pending) {
        Ok(true) => {}
        Ok(false) => {
            tracing::warn!(task_id = %task.id, source = %task.source, date = %task.date, "unit claimed elsewhere; skipping");
            return task;
        }
        Err(e) => {
            // The unit never ran; record the failure against the stored
            // `pending` row.
            let _ = task.fail(format!("storage error: {}", e), 0);
            if let Err(e) = ctx.store.transition_task(&task, TaskStatus::Pending) {
                tracing::error!(task_id = %task.id, error = %e, "failed to record unit failure");
            }
            finish(ctx, &task);
            return task;
        }
    }

    tracing::debug!(run_id = %task.run_id, source = %task.source, date = %task.date, attempt = task.attempts, "unit started");

    let mut saved = 0u64;
    let outcome = ingest(ctx, &task, &mut saved).await;
    let transitioned = match outcome {
        Ok(Ended::Completed) => task.succeed(saved),
        Ok(Ended::Cancelled) if ctx.cancel_as_failure => task.fail(RETRY_CANCELLED, saved),
        Ok(Ended::Cancelled) => task.cancel(saved),
        Err(ref e) => task.fail(e.to_string(), saved),
    };
    if let Err(e) = transitioned {
        tracing::error!(task_id = %task.id, error = %e, "illegal unit transition");
    }

    match ctx.store.transition_task(&task, TaskStatus::Running) {
        Ok(true) => {}
        Ok(false) => tracing::warn!(task_id = %task.id, "unit changed while running; final status not written"),
        Err(e) => tracing::error!(task_id = %task.id, error = %e, "failed to persist unit status"),
    }

    match task.status {
        TaskStatus::Failed => tracing::warn!(
            run_id = %task.run_id,
            source = %task.source,
            date = %task.date,
            saved,
            error = task.error_message.as_deref().unwrap_or_default(),
            "unit failed"
        ),
        status => tracing::info!(
            run_id = %task.run_id,
            source = %task.source,
            date = %task.date,
            saved,
            %status,
            "unit finished"
        ),
    }

    finish(ctx, &task);
    task
}

fn finish(ctx: &UnitContext, task: &TaskUnit) {
    ctx.tracker.task_finished(task);
    if let Some(observer) = &ctx.observer {
        observer.on_task_finished(task);
    }
}

async fn ingest(ctx: &UnitContext, task: &TaskUnit, saved: &mut u64) -> Result<Ended, UnitError> {
    let token = ctx.tracker.token();
    if token.is_cancelled() {
        return Ok(Ended::Cancelled);
    }

    let connector = ctx
        .registry
        .connector_for(&task.source, &ctx.feeds)
        .ok_or_else(|| UnitError::NoConnector(task.source.clone()))?;

    ctx.tracker.enter_stage(Stage::Fetching, task.date, &task.source);
    let mut stream = connector.fetch(task.date).await?;

    let window_start = task.date - Duration::days(i64::from(ctx.window_days));
    let stored = ctx
        .store
        .embeddings_for_corpus(DateRange::new(window_start, task.date), Some(&task.run_id))?;
    let mut corpus = SimilarityCorpus::from_stored(stored);
    let mut synced = 0;
    let mut seen = HashSet::new();

    loop {
        if token.is_cancelled() {
            return Ok(Ended::Cancelled);
        }
        let batch = next_batch(&mut stream, ctx.batch_size.max(1)).await;
        if !batch.items.is_empty() {
            let mut items = batch.items;
            for item in &mut items {
                if item.source_name.is_empty() {
                    item.source_name = connector.name().to_string();
                }
            }
            let ended = process_batch(ctx, task, items, &mut corpus, &mut synced, &mut seen, saved).await?;
            if let Ended::Cancelled = ended {
                return Ok(Ended::Cancelled);
            }
        }
        if let Some(e) = batch.error {
            return Err(e.into());
        }
        if batch.exhausted {
            return Ok(Ended::Completed);
        }
    }
}

struct Batch {
    items: Vec<CandidateArticle>,
    error: Option<SourceError>,
    exhausted: bool,
}

/// Pull up to `size` candidates. Candidates read before a stream error are
/// kept so they still get saved.
async fn next_batch(stream: &mut CandidateStream, size: usize) -> Batch {
    let mut items = Vec::with_capacity(size);
    while items.len() < size {
        match stream.next().await {
            Some(Ok(candidate)) => items.push(candidate),
            Some(Err(e)) => {
                return Batch {
                    items,
                    error: Some(e),
                    exhausted: true,
                }
            }
            None => {
                return Batch {
                    items,
                    error: None,
                    exhausted: true,
                }
            }
        }
    }
    Batch {
        items,
        error: None,
        exhausted: false,
    }
}

async fn process_batch(
    ctx: &UnitContext,
    task: &TaskUnit,
    items: Vec<CandidateArticle>,
    corpus: &mut SimilarityCorpus,
    synced: &mut usize,
    seen: &mut HashSet<String>,
    saved: &mut u64,
) -> Result<Ended, UnitError> {
    let fetched = items.len() as u64;
    ctx.tracker.update(|p| {
        p.fetched += fetched;
        p.stage = Some(Stage::Filtering);
    });

    // Repeats within this unit
    let mut fresh = Vec::with_capacity(items.len());
    let mut fingerprints = Vec::with_capacity(items.len());
    for candidate in items {
        let fp = candidate.fingerprint();
        if seen.insert(fp.clone()) {
            fingerprints.push(fp);
            fresh.push(candidate);
        }
    }

    // Sibling units of this run wait here until our inserts are visible
    let mut run_corpus = ctx.tracker.dedup_section().await;
    corpus.extend_stored(run_corpus.since(*synced).iter().cloned());
    *synced = run_corpus.len();

    let existing = ctx.store.existing_fingerprints(&fingerprints)?;
    let fresh: Vec<CandidateArticle> = fresh
        .into_iter()
        .zip(fingerprints)
        .filter(|(_, fp)| !existing.contains(fp))
        .map(|(candidate, _)| candidate)
        .collect();

    let new = fresh.len() as u64;
    ctx.tracker.update(|p| {
        p.new += new;
        p.stage = Some(Stage::Deduplicating);
    });
    if fresh.is_empty() {
        return Ok(Ended::Completed);
    }

    let screened = screen(ctx, fresh, corpus).await?;
    let deduped = screened.accepted.len() as u64;
    ctx.tracker.update(|p| p.deduped += deduped);

    if ctx.tracker.token().is_cancelled() {
        return Ok(Ended::Cancelled);
    }

    ctx.tracker.set_stage(Stage::Saving);
    let mut saved_by_fp: HashMap<String, ArticleId> = HashMap::new();
    let mut new_ids = Vec::with_capacity(screened.accepted.len());
    for (candidate, embedding) in &screened.accepted {
        let article = NewArticle::from_candidate(
            candidate,
            &task.source,
            task.date,
            Some(task.run_id),
            embedding.clone(),
        );
        match ctx.store.insert_article(&article)? {
            Some(id) => {
                corpus.resolve(&article.fingerprint, id);
                if let Some(embedding) = embedding {
                    run_corpus.push(id, embedding.clone());
                }
                saved_by_fp.insert(article.fingerprint, id);
                new_ids.push(id);
            }
            None => {
                tracing::debug!(url = %article.url, "fingerprint stored concurrently; skipping");
            }
        }
    }
    *synced = run_corpus.len();
    let count = new_ids.len() as u64;
    *saved += count;
    ctx.tracker.update(|p| p.saved += count);

    for dup in &screened.near_duplicates {
        let target = match &dup.of {
            CorpusKey::Stored(id) => Some(*id),
            CorpusKey::Pending(fp) => match saved_by_fp.get(fp) {
                Some(id) => Some(*id),
                None => ctx.store.find_by_fingerprint(fp)?.map(|a| a.id),
            },
        };
        let Some(id) = target else { continue };
        if ctx.store.add_reported_by(id, &dup.candidate.source_name)? {
            tracing::debug!(
                article_id = %id,
                reporter = %dup.candidate.source_name,
                similarity = dup.similarity,
                "merged near-duplicate attribution"
            );
        }
    }
    drop(run_corpus);

    if let Some(dispatcher) = &ctx.enrichment {
        if !new_ids.is_empty() {
            ctx.tracker.set_stage(Stage::Enriching);
            let observer: Arc<dyn EnrichmentObserver> = ctx.tracker.clone();
            ctx.tracker.push_enrichment(dispatcher.spawn(new_ids, Some(observer)));
        }
    }

    Ok(Ended::Completed)
}

/// Run the gate, on a blocking thread when the embedder does model
/// inference.
async fn screen(
    ctx: &UnitContext,
    fresh: Vec<CandidateArticle>,
    corpus: &mut SimilarityCorpus,
) -> Result<Screened, UnitError> {
    if !ctx.gate.embedder().is_blocking() {
        return Ok(ctx.gate.screen(fresh, corpus));
    }
    let gate = ctx.gate.clone();
    let mut owned = std::mem::take(corpus);
    let (screened, owned) = tokio::task::spawn_blocking(move || {
        let screened = gate.screen(fresh, &mut owned);
        (screened, owned)
    })
    .await
    .map_err(|e| UnitError::Dedup(e.to_string()))?;
    *corpus = owned;
    Ok(screened)
}
