//! newsroom: multi-source article ingestion orchestrator
//!
//! Pulls candidate articles from configured sources for a date range,
//! drops exact and near duplicates, persists the survivors and hands them to
//! an enrichment collaborator.
//!
//! # Core Concepts
//!
//! - **Runs**: one invocation over a date range and source selection,
//!   addressed by `RunId`; several may execute at once
//! - **Task units**: one (source, date) slice of a run with its own status,
//!   error and retry
//! - **Articles**: unique by URL fingerprint; near duplicates are merged into
//!   the first stored record's `also_reported_by`
//!
//! # Example
//!
//! ```no_run
//! use newsroom::config::Config;
//! use newsroom::pipeline::Orchestrator;
//! use newsroom::run::SourceSelection;
//! use newsroom::storage::{OpenStore, SqliteStore};
//! use std::sync::Arc;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::load_or_default(None)?;
//! let store = Arc::new(SqliteStore::open(config.db_path())?);
//! let orchestrator = Orchestrator::from_config(&config, store)?.build();
//!
//! let day = chrono::NaiveDate::from_ymd_opt(2026, 2, 20).unwrap();
//! let run_id = orchestrator.start_run(day, day, SourceSelection::new(["hackernews"]))?;
//! let run = orchestrator.wait(&run_id).await?;
//! println!("{} saved {}", run.status, run.progress.saved);
//! # Ok(())
//! # }
//! ```

pub mod article;
pub mod config;
pub mod dedup;
pub mod enrich;
pub mod mcp;
pub mod pipeline;
pub mod run;
pub mod source;
pub mod storage;

pub use article::{ArticleId, CandidateArticle, StoredArticle};
pub use config::{Config, ConfigError};
pub use pipeline::{Orchestrator, PipelineError, PipelineResult, RunObserver};
pub use run::{Run, RunId, RunStatus, SourceSelection, TaskStatus, TaskUnit};
pub use storage::{OpenStore, SqliteStore, StorageError, StorageResult};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
