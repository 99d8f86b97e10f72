//! Storage backends for newsroom
//!
//! Runs, task units and articles live behind the `RunStore` and
//! `ArticleStore` traits. The primary implementation is `SqliteStore`, which
//! any process can open to observe runs driven elsewhere.

mod sqlite;
mod traits;

pub use sqlite::SqliteStore;
pub use traits::{
    ArticleStore, DateRange, OpenStore, RunStore, StorageError, StorageResult, Store,
};
