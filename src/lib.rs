//! Memvault - versioned memory storage for AI agents
//!
//! Keeps an append-only version history per memory in SQLite, organizes
//! memories into contexts and tags, and answers structured filter queries
//! (context, tags, date range, author) over the current snapshot. Batch
//! operations apply one action to many memories in a single transaction.

pub mod batch;
pub mod error;
pub mod filter;
pub mod index;
pub mod registry;
pub mod requests;
pub mod service;
pub mod storage;
pub mod types;
pub mod versions;

pub use batch::BatchCoordinator;
pub use error::{MemvaultError, Result};
pub use filter::FilterEngine;
pub use index::{Embedder, EmbeddingTask, IndexHit, IndexSync, SyncReport, VectorIndex};
pub use registry::Registry;
pub use service::{ImportSummary, MemoryService};
pub use storage::Storage;
pub use types::*;
pub use versions::{StagedWrite, VersionStore, VersionWrite};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
