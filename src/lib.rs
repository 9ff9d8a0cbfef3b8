//! # VexDB
//!
//! Embedded vector database: a keyed store of fixed-dimension `f32`
//! vectors with exact and approximate nearest-neighbor search, durable
//! write-ahead logging, atomic snapshots, and transactional batches.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use vexdb::{Config, PersistenceConfig, Vector, VexDB};
//!
//! // Open (and crash-recover) a 3-dimensional database
//! let db = VexDB::open(Config {
//!     persistence: PersistenceConfig::under("./vexdb"),
//!     ..Config::new(3)
//! })?;
//!
//! // Keyed inserts with optional metadata
//! db.insert("doc-1", Vector::from(vec![0.1, 0.2, 0.3]), Some("intro"))?;
//! db.insert("doc-2", Vector::from(vec![0.9, 0.1, 0.0]), None)?;
//!
//! // k-nearest-neighbor search
//! let hits = db.similarity_search(&Vector::from(vec![0.1, 0.2, 0.25]), 1)?;
//! assert_eq!(hits[0].0, "doc-1");
//!
//! // Flush the WAL and close
//! db.close()?;
//! ```
//!
//! ## Key Concepts
//!
//! ### Authoritative maps
//!
//! The key→vector and key→metadata maps are the source of truth. Every
//! index (KD-tree, LSH, HNSW) is a rebuildable derivative kept in
//! lockstep by the facade.
//!
//! ### Durability
//!
//! Every mutation appends one checksummed record to the write-ahead log
//! before it is acknowledged; if the append fails, the in-memory
//! mutation is rolled back. Snapshots serialize the full maps through an
//! atomic temp-file + fsync + rename, after which the WAL rotates and
//! superseded segments are deleted. Recovery replays the newest snapshot
//! plus the WAL tail and is robust to torn records from a crash
//! mid-append.
//!
//! ### Search algorithms
//!
//! - `exact`: KD-tree descent, exact results under the active metric
//! - `lsh`: random-hyperplane bucketing, fastest inserts
//! - `hnsw`: hierarchical proximity graph, best recall/latency balance
//!
//! ## Thread Safety
//!
//! [`VexDB`] is `Send + Sync`; share it across threads with `Arc`.
//! Mutations serialize through a single writer lock and the WAL reflects
//! that order; searches run concurrently under the read half.

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![deny(unsafe_code)]

// ============================================================================
// Module declarations
// ============================================================================

mod batch;
mod cache;
mod config;
mod db;
mod error;
mod metric;
mod types;

pub mod index;
pub mod storage;

// ============================================================================
// Public API re-exports
// ============================================================================

// Main database interface
pub use db::{DatabaseStats, VexDB};

// Configuration
pub use config::{Algorithm, Config, HnswConfig, LshConfig, PersistenceConfig};

// Error handling
pub use error::{NotFoundError, Result, StorageError, ValidationError, VexDBError};

// Core types
pub use metric::DistanceMetric;
pub use types::{SearchResult, Vector};

// Batches
pub use batch::{BatchOperation, BatchResult, BatchStats, OperationType};

// Cache statistics
pub use cache::CacheStats;

// Storage surface (recovery status, WAL statistics)
pub use storage::{PersistenceStats, RecoveryInfo, RecoveryState, WalStats};

// ============================================================================
// Prelude module for convenient imports
// ============================================================================

/// Convenient imports for common VexDB usage.
///
/// ```rust
/// use vexdb::prelude::*;
/// ```
pub mod prelude {
    pub use crate::config::{Algorithm, Config, PersistenceConfig};
    pub use crate::db::VexDB;
    pub use crate::error::{Result, VexDBError};
    pub use crate::metric::DistanceMetric;
    pub use crate::types::{SearchResult, Vector};
}
