//! Summit Store
//!
//! The storage capability the progress engine runs against, plus two
//! implementations:
//!
//! - [`MemoryStore`]: pure in-memory, with failure injection for tests
//! - [`SqliteStore`]: durable, `sqlx` + SQLite (feature `sqlite`, default)
//!
//! # Architecture
//!
//! ```text
//! Engine ──load_*──────────▶ ProgressStore ──▶ Goal / SubGoal / Action / Task
//!        ──commit(batch)───▶ (atomic: progress + markers + history)
//!        ──history_entries─▶
//! ```

#![warn(missing_docs)]
#![warn(unreachable_pub)]

// Core modules
pub mod error;
pub mod memory;
#[cfg(feature = "sqlite")]
pub mod sqlite;
pub mod store;

// Re-exports for convenience
pub use error::StorageError;
pub use memory::{FailPoint, MemoryStore};
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;
pub use store::{HistoryQuery, ProgressStore, Write, WriteBatch};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
