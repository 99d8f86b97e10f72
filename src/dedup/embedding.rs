//! Text embeddings for near-duplicate detection
//!
//! Uses a trait-based embedding backend (`Embedder`) so the gate can run on
//! the deterministic `HashingEmbedder` by default, or on fastembed-rs when
//! the `embeddings` feature is enabled.

use thiserror::Error;

/// Error type for embedding operations.
#[derive(Debug, Error)]
pub enum EmbeddingError {
    /// Nothing embeddable in the input text
    #[error("embedding input has no usable tokens")]
    EmptyInput,
    /// The embedding model returned no results
    #[error("embedding returned no results")]
    EmptyResult,
    /// Model loading or inference failed
    #[error("embedding model error: {0}")]
    ModelError(String),
}

/// Trait for embedding text into fixed-dimension vectors.
pub trait Embedder: Send + Sync {
    /// Embed a single text.
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;

    /// Stable identifier of the model, recorded in logs.
    fn model_id(&self) -> &str;

    /// `true` if `embed` is heavy enough (model inference) that callers on
    /// an async runtime should move it to a blocking thread.
    fn is_blocking(&self) -> bool {
        true
    }
}

/// Cosine similarity between two vectors. Zero vectors compare as 0.0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

const STOP_WORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "for", "from", "has", "have", "in", "is",
    "it", "its", "of", "on", "or", "that", "the", "this", "to", "was", "were", "will", "with",
];

/// FNV-1a, 64 bit. Stable across processes and platforms.
fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in bytes {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash
}

/// Deterministic feature-hashing embedder.
///
/// Lowercased word unigrams and bigrams (stop words removed) are hashed
/// into `dimensions` signed buckets; the resulting term-frequency vector is
/// L2-normalised. Same text in, same vector out, on every machine.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimensions: usize,
    id: String,
}

impl HashingEmbedder {
    pub fn new(dimensions: usize) -> Self {
        let dimensions = dimensions.max(16);
        Self {
            dimensions,
            id: format!("hashing:{}", dimensions),
        }
    }

    fn tokens(text: &str) -> Vec<String> {
        text.split(|c: char| !c.is_alphanumeric())
            .filter(|t| t.chars().count() > 1)
            .map(|t| t.to_lowercase())
            .filter(|t| !STOP_WORDS.contains(&t.as_str()))
            .collect()
    }

    fn add_feature(&self, vector: &mut [f32], feature: &str) {
        let hash = fnv1a(feature.as_bytes());
        let index = (hash % self.dimensions as u64) as usize;
        let sign = if hash >> 63 == 0 { 1.0 } else { -1.0 };
        vector[index] += sign;
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(512)
    }
}

impl Embedder for HashingEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let tokens = Self::tokens(text);
        if tokens.is_empty() {
            return Err(EmbeddingError::EmptyInput);
        }
        let mut vector = vec![0.0f32; self.dimensions];
        for token in &tokens {
            self.add_feature(&mut vector, token);
        }
        for pair in tokens.windows(2) {
            self.add_feature(&mut vector, &format!("{} {}", pair[0], pair[1]));
        }
        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm == 0.0 {
            return Err(EmbeddingError::EmptyResult);
        }
        for x in vector.iter_mut() {
            *x /= norm;
        }
        Ok(vector)
    }

    fn model_id(&self) -> &str {
        &self.id
    }

    fn is_blocking(&self) -> bool {
        false
    }
}

// ---------------------------------------------------------------------------
// FastEmbedEmbedder — production embedder behind `embeddings` feature
// ---------------------------------------------------------------------------

#[cfg(feature = "embeddings")]
mod fastembed_impl {
    use super::{Embedder, EmbeddingError};
    use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
    use std::sync::Mutex;

    /// Embedder backed by fastembed (ONNX Runtime).
    ///
    /// Wraps `fastembed::TextEmbedding` in a `Mutex` because its `embed`
    /// method requires `&mut self`, while the `Embedder` trait uses `&self`.
    pub struct FastEmbedEmbedder {
        model: Mutex<TextEmbedding>,
        id: String,
    }

    impl FastEmbedEmbedder {
        pub fn new(model: EmbeddingModel) -> Result<Self, EmbeddingError> {
            let id = format!("fastembed:{:?}", model);
            let options = InitOptions::new(model).with_show_download_progress(false);
            let embedding = TextEmbedding::try_new(options)
                .map_err(|e| EmbeddingError::ModelError(e.to_string()))?;
            Ok(Self {
                model: Mutex::new(embedding),
                id,
            })
        }

        /// nomic-embed-text-v1.5
        pub fn default_model() -> Result<Self, EmbeddingError> {
            Self::new(EmbeddingModel::NomicEmbedTextV15)
        }
    }

    impl Embedder for FastEmbedEmbedder {
        fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
            if text.trim().is_empty() {
                return Err(EmbeddingError::EmptyInput);
            }
            let mut model = self
                .model
                .lock()
                .map_err(|_| EmbeddingError::ModelError("embedding model lock poisoned".into()))?;
            let mut embeddings = model
                .embed(vec![text], None)
                .map_err(|e| EmbeddingError::ModelError(e.to_string()))?;
            embeddings.pop().ok_or(EmbeddingError::EmptyResult)
        }

        fn model_id(&self) -> &str {
            &self.id
        }
    }
}

#[cfg(feature = "embeddings")]
pub use fastembed_impl::FastEmbedEmbedder;
