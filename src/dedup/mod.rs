//! Deduplication gate between fetch and save
//!
//! Two checks, cheapest first:
//! 1. exact: the candidate's URL fingerprint is already known
//! 2. near-duplicate: cosine similarity of the candidate's embedding against
//!    a bounded corpus of recent embeddings reaches the threshold (inclusive)
//!
//! Embedding failures fail open: the candidate is accepted without an
//! embedding rather than silently dropped.

mod embedding;

pub use embedding::{cosine_similarity, Embedder, EmbeddingError, HashingEmbedder};

#[cfg(feature = "embeddings")]
pub use embedding::FastEmbedEmbedder;

use crate::article::{ArticleId, CandidateArticle};
use std::collections::HashSet;
use std::sync::Arc;

/// Default near-duplicate threshold
pub const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.85;

/// Identity of a corpus entry
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CorpusKey {
    /// Already persisted
    Stored(ArticleId),
    /// Accepted by the gate but not yet persisted, keyed by fingerprint
    Pending(String),
}

#[derive(Debug, Clone)]
struct CorpusEntry {
    key: CorpusKey,
    embedding: Vec<f32>,
}

/// The bounded comparison set for one task unit.
///
/// Entries keep insertion order (stored articles ascending by id, then
/// accepted candidates), which makes decisions reproducible.
#[derive(Debug, Clone, Default)]
pub struct SimilarityCorpus {
    entries: Vec<CorpusEntry>,
    fingerprints: HashSet<String>,
    stored_ids: HashSet<ArticleId>,
}

impl SimilarityCorpus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from stored `(id, embedding)` pairs; sorted by id.
    pub fn from_stored(mut stored: Vec<(ArticleId, Vec<f32>)>) -> Self {
        stored.sort_by_key(|(id, _)| *id);
        let mut corpus = Self::default();
        corpus.extend_stored(stored);
        corpus
    }

    /// Add stored articles saved since the corpus was built. Ids already
    /// present are skipped.
    pub fn extend_stored(&mut self, stored: impl IntoIterator<Item = (ArticleId, Vec<f32>)>) {
        for (id, embedding) in stored {
            if self.stored_ids.insert(id) {
                self.entries.push(CorpusEntry {
                    key: CorpusKey::Stored(id),
                    embedding,
                });
            }
        }
    }

    /// Register fingerprints known to be stored already.
    pub fn extend_fingerprints(&mut self, fingerprints: impl IntoIterator<Item = String>) {
        self.fingerprints.extend(fingerprints);
    }

    pub fn contains_fingerprint(&self, fingerprint: &str) -> bool {
        self.fingerprints.contains(fingerprint)
    }

    fn push_pending(&mut self, fingerprint: String, embedding: Option<Vec<f32>>) {
        if let Some(embedding) = embedding {
            self.entries.push(CorpusEntry {
                key: CorpusKey::Pending(fingerprint.clone()),
                embedding,
            });
        }
        self.fingerprints.insert(fingerprint);
    }

    /// Swap a pending key for the id it was persisted under.
    pub fn resolve(&mut self, fingerprint: &str, id: ArticleId) {
        self.stored_ids.insert(id);
        for entry in self.entries.iter_mut() {
            if matches!(&entry.key, CorpusKey::Pending(fp) if fp == fingerprint) {
                entry.key = CorpusKey::Stored(id);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Most similar entry, earliest wins ties.
    fn best_match(&self, query: &[f32]) -> Option<(&CorpusKey, f32)> {
        let mut best: Option<(&CorpusKey, f32)> = None;
        for entry in &self.entries {
            let sim = cosine_similarity(query, &entry.embedding);
            if best.map_or(true, |(_, b)| sim > b) {
                best = Some((&entry.key, sim));
            }
        }
        best
    }
}

/// Outcome of checking one candidate
#[derive(Debug, Clone, PartialEq)]
pub enum DedupDecision {
    Accept { embedding: Option<Vec<f32>> },
    ExactDuplicate,
    NearDuplicate { of: CorpusKey, similarity: f32 },
}

/// A candidate dropped as a near-duplicate of an existing story
#[derive(Debug, Clone)]
pub struct NearDuplicate {
    pub candidate: CandidateArticle,
    pub of: CorpusKey,
    pub similarity: f32,
}

/// Result of screening a batch
#[derive(Debug, Default)]
pub struct Screened {
    /// Survivors with their embedding (None if embedding failed)
    pub accepted: Vec<(CandidateArticle, Option<Vec<f32>>)>,
    pub near_duplicates: Vec<NearDuplicate>,
    pub exact_duplicates: usize,
}

/// Exact + semantic duplicate detection
#[derive(Clone)]
pub struct DedupGate {
    embedder: Arc<dyn Embedder>,
    threshold: f32,
}

impl DedupGate {
    pub fn new(embedder: Arc<dyn Embedder>, threshold: f32) -> Self {
        Self {
            embedder,
            threshold,
        }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.embedder
    }

    /// `true` if the candidate is an exact or near duplicate of the corpus.
    pub fn is_duplicate(&self, candidate: &CandidateArticle, corpus: &SimilarityCorpus) -> bool {
        !matches!(self.check(candidate, corpus), DedupDecision::Accept { .. })
    }

    pub fn check(&self, candidate: &CandidateArticle, corpus: &SimilarityCorpus) -> DedupDecision {
        if corpus.contains_fingerprint(&candidate.fingerprint()) {
            return DedupDecision::ExactDuplicate;
        }
        let embedding = match self.embedder.embed(&candidate.embedding_text()) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    model = self.embedder.model_id(),
                    url = %candidate.url,
                    "embedding failed, accepting candidate without similarity check"
                );
                return DedupDecision::Accept { embedding: None };
            }
        };
        if let Some((key, similarity)) = corpus.best_match(&embedding) {
            if similarity >= self.threshold {
                return DedupDecision::NearDuplicate {
                    of: key.clone(),
                    similarity,
                };
            }
        }
        DedupDecision::Accept {
            embedding: Some(embedding),
        }
    }

    /// Screen a batch in order; accepted candidates join the corpus so later
    /// candidates in the same batch are compared against them too.
    pub fn screen(&self, candidates: Vec<CandidateArticle>, corpus: &mut SimilarityCorpus) -> Screened {
        let mut screened = Screened::default();
        for candidate in candidates {
            match self.check(&candidate, corpus) {
                DedupDecision::Accept { embedding } => {
                    corpus.push_pending(candidate.fingerprint(), embedding.clone());
                    screened.accepted.push((candidate, embedding));
                }
                DedupDecision::ExactDuplicate => {
                    screened.exact_duplicates += 1;
                }
                DedupDecision::NearDuplicate { of, similarity } => {
                    tracing::debug!(
                        title = %candidate.title,
                        similarity,
                        "dropping near-duplicate"
                    );
                    screened.near_duplicates.push(NearDuplicate {
                        candidate,
                        of,
                        similarity,
                    });
                }
            }
        }
        screened
    }
}
