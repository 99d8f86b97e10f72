//! YAML configuration
//!
//! ```yaml
//! database: ~/.local/share/newsroom/newsroom.db
//! pipeline:
//!   concurrency: 2
//!   batch_size: 50
//!   max_range_days: 31
//! dedup:
//!   similarity_threshold: 0.85
//!   window_days: 7
//!   embedding_dimensions: 512
//! enrichment:
//!   concurrency: 5
//!   retry_cap: 3
//!   timeout_seconds: 60
//!   command: ["newsroom-enrich", "--model", "gpt-4o-mini"]
//! sources:
//!   - id: hackernews
//!     name: Hacker News
//!     command: ["scrape-hn"]
//! feeds:
//!   - id: openai
//!     name: OpenAI Blog
//!     command: ["scrape-rss", "https://openai.com/blog/rss.xml"]
//! ```
//!
//! Every section is optional; missing values take the defaults above.

use crate::dedup::{DedupGate, Embedder, HashingEmbedder, DEFAULT_SIMILARITY_THRESHOLD};
use crate::enrich::{CommandEnricher, Enricher};
use crate::source::{CommandSource, SourceRegistry, FEED_SET_SOURCE};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid YAML in {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Worker pool and batching for task units
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Task units run concurrently per run
    pub concurrency: usize,
    /// Candidates pulled from a source stream per filter/dedup/save pass
    pub batch_size: usize,
    /// Longest accepted date range in days; 0 disables the limit
    pub max_range_days: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            concurrency: 2,
            batch_size: 50,
            max_range_days: 31,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// Cosine similarity at or above which a candidate is a near-duplicate
    pub similarity_threshold: f32,
    /// Days before the task date whose articles form the comparison corpus
    pub window_days: u32,
    pub embedding_dimensions: usize,
    /// Use the fastembed model instead of the hashing embedder (needs the
    /// `embeddings` feature)
    pub use_model: bool,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
            window_days: 7,
            embedding_dimensions: 512,
            use_model: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnrichmentConfig {
    /// Concurrent enrichment calls, shared across runs and sweeps
    pub concurrency: usize,
    /// Failed articles are retried by sweeps at most this many times
    pub retry_cap: u32,
    pub timeout_seconds: u64,
    /// Enricher command; enrichment is disabled when absent
    pub command: Option<Vec<String>>,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            retry_cap: 3,
            timeout_seconds: 60,
            command: None,
        }
    }
}

/// A command-backed source or feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub command: Vec<String>,
    #[serde(default = "default_source_timeout")]
    pub timeout_seconds: u64,
}

fn default_source_timeout() -> u64 {
    120
}

impl SourceConfig {
    fn connector(&self) -> Result<CommandSource, ConfigError> {
        let source = CommandSource::new(&self.id, self.command.clone())
            .map_err(|e| ConfigError::Invalid(e.to_string()))?
            .with_timeout(Duration::from_secs(self.timeout_seconds));
        Ok(match &self.name {
            Some(name) => source.with_name(name),
            None => source,
        })
    }
}

/// Top-level configuration file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: Option<PathBuf>,
    pub pipeline: PipelineConfig,
    pub dedup: DedupConfig,
    pub enrichment: EnrichmentConfig,
    pub sources: Vec<SourceConfig>,
    pub feeds: Vec<SourceConfig>,
}

impl Config {
    /// `<config_dir>/newsroom/config.yaml`
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("newsroom")
            .join("config.yaml")
    }

    /// `<data_dir>/newsroom/newsroom.db`
    pub fn default_db_path() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("newsroom")
            .join("newsroom.db")
    }

    pub fn from_yaml(text: &str, path: &Path) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml::from_str(text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&text, path)
    }

    /// Load `path` if given, else the default path if it exists, else defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(p) => Self::load(p),
            None => {
                let p = Self::default_path();
                if p.exists() {
                    Self::load(&p)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.database.clone().unwrap_or_else(Self::default_db_path)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pipeline.concurrency == 0 {
            return Err(ConfigError::Invalid("pipeline.concurrency must be at least 1".into()));
        }
        if self.pipeline.batch_size == 0 {
            return Err(ConfigError::Invalid("pipeline.batch_size must be at least 1".into()));
        }
        if self.enrichment.concurrency == 0 {
            return Err(ConfigError::Invalid("enrichment.concurrency must be at least 1".into()));
        }
        let t = self.dedup.similarity_threshold;
        if !t.is_finite() || t <= 0.0 || t > 1.0 {
            return Err(ConfigError::Invalid(format!(
                "dedup.similarity_threshold must be in (0, 1], got {}",
                t
            )));
        }
        let mut seen = HashSet::new();
        for s in &self.sources {
            if s.id == FEED_SET_SOURCE {
                return Err(ConfigError::Invalid(format!("source id '{}' is reserved", FEED_SET_SOURCE)));
            }
            if !seen.insert(&s.id) {
                return Err(ConfigError::Invalid(format!("duplicate source id '{}'", s.id)));
            }
        }
        let mut seen = HashSet::new();
        for f in &self.feeds {
            if !seen.insert(&f.id) {
                return Err(ConfigError::Invalid(format!("duplicate feed id '{}'", f.id)));
            }
        }
        Ok(())
    }

    pub fn build_registry(&self) -> Result<SourceRegistry, ConfigError> {
        let mut registry = SourceRegistry::new();
        for s in &self.sources {
            registry.register_source(Arc::new(s.connector()?));
        }
        for f in &self.feeds {
            registry.register_feed(Arc::new(f.connector()?));
        }
        Ok(registry)
    }

    pub fn build_enricher(&self) -> Result<Option<Arc<dyn Enricher>>, ConfigError> {
        let Some(command) = &self.enrichment.command else {
            return Ok(None);
        };
        let enricher = CommandEnricher::new(command.clone())
            .map_err(|e| ConfigError::Invalid(e.to_string()))?
            .with_timeout(Duration::from_secs(self.enrichment.timeout_seconds));
        Ok(Some(Arc::new(enricher)))
    }

    pub fn build_gate(&self) -> Result<DedupGate, ConfigError> {
        let embedder: Arc<dyn Embedder> = if self.dedup.use_model {
            Self::model_embedder()?
        } else {
            Arc::new(HashingEmbedder::new(self.dedup.embedding_dimensions))
        };
        Ok(DedupGate::new(embedder, self.dedup.similarity_threshold))
    }

    #[cfg(feature = "embeddings")]
    fn model_embedder() -> Result<Arc<dyn Embedder>, ConfigError> {
        let embedder = crate::dedup::FastEmbedEmbedder::default_model()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        Ok(Arc::new(embedder))
    }

    #[cfg(not(feature = "embeddings"))]
    fn model_embedder() -> Result<Arc<dyn Embedder>, ConfigError> {
        Err(ConfigError::Invalid(
            "dedup.use_model requires the `embeddings` feature".into(),
        ))
    }
}
