//! Summit Engine
//!
//! Hierarchical goal progress: aggregation, caching, cascading writes,
//! history analytics and integrity auditing.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                   ProgressEngine                     │
//! │  calculate_*  recalculate_from_task  integrity/batch │
//! └───────┬───────────────┬──────────────────┬───────────┘
//!         │               │                  │
//!   ProgressCache   ProgressHistory     summit_model
//!    (moka LRU)    (trend, changes,    (calculator)
//!         │          retention)
//!         └───────────────┴──────▶ ProgressStore (memory | sqlite)
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use summit_engine::prelude::*;
//! use summit_store::MemoryStore;
//!
//! let store = Arc::new(MemoryStore::new());
//! let engine = ProgressEngine::new(store, EngineConfig::default())?;
//! let outcome = engine.recalculate_from_task(&task_id).await?;
//! println!("goal now at {}%", outcome.goal.current);
//! ```

#![warn(missing_docs)]
#![warn(unreachable_pub)]

// Core modules
pub mod config;
pub mod engine;
pub mod error;
pub mod history;
pub mod integrity;
pub mod telemetry;

// Re-exports for convenience
pub use config::EngineConfig;
pub use engine::{CascadeOutcome, LevelChange, ProgressEngine};
pub use error::ProgressError;
pub use history::{
    compute_trend, find_significant_changes, ProgressHistory, ProgressTrend, SignificantChange,
    TrendDirection,
};
pub use integrity::{BatchReport, Discrepancy, DiscrepancyKind, IntegrityReport, RepairReport};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for driving the engine
    pub use crate::config::EngineConfig;
    pub use crate::engine::{CascadeOutcome, ProgressEngine};
    pub use crate::error::ProgressError;
    pub use crate::history::{ProgressTrend, TrendDirection};
    pub use crate::integrity::{IntegrityReport, RepairReport};
    pub use summit_model::prelude::*;
    pub use summit_store::{HistoryQuery, ProgressStore};
}
