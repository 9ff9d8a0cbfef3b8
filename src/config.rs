//! Configuration types for VexDB.
//!
//! The [`Config`] struct controls database behavior including:
//! - Vector dimension (fixed for the lifetime of a database)
//! - Search algorithm (exact KD-tree, LSH, or HNSW)
//! - Durability settings (WAL rotation, checkpoint triggers)
//! - Query cache capacity
//!
//! # Example
//! ```rust
//! use vexdb::{Algorithm, Config, DistanceMetric};
//!
//! // Defaults: exact search, Euclidean, persistence enabled
//! let config = Config::new(128);
//!
//! // Customize for approximate search
//! let config = Config {
//!     algorithm: Algorithm::Hnsw,
//!     metric: DistanceMetric::Cosine,
//!     ..Config::new(768)
//! };
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Search algorithm selector.
///
/// The database always maintains the exact KD-tree; selecting `Lsh` or
/// `Hnsw` additionally maintains that approximate index and routes
/// similarity searches through it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Algorithm {
    /// Exact nearest neighbors via KD-tree descent.
    #[default]
    Exact,
    /// Approximate neighbors via random-hyperplane locality-sensitive
    /// hashing. Fast inserts, recall bounded by table count.
    Lsh,
    /// Approximate neighbors via a hierarchical proximity graph.
    /// Best recall/latency trade-off for most workloads.
    Hnsw,
}

impl Algorithm {
    /// Parse an algorithm from its lowercase wire name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "exact" => Some(Self::Exact),
            "lsh" => Some(Self::Lsh),
            "hnsw" => Some(Self::Hnsw),
            _ => None,
        }
    }

    /// Lowercase wire name of the algorithm.
    pub fn name(self) -> &'static str {
        match self {
            Self::Exact => "exact",
            Self::Lsh => "lsh",
            Self::Hnsw => "hnsw",
        }
    }
}

impl std::fmt::Display for Algorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Database configuration options.
///
/// All fields except `dimension` have sensible defaults. Use struct
/// update syntax to override specific settings:
///
/// ```rust
/// use vexdb::Config;
///
/// let config = Config {
///     query_cache_capacity: 256,
///     ..Config::new(128)
/// };
/// ```
#[derive(Clone, Debug)]
pub struct Config {
    /// Vector dimension D. Every stored vector and every query must have
    /// exactly this many components.
    pub dimension: usize,

    /// Which index answers similarity searches.
    pub algorithm: Algorithm,

    /// Distance metric shared by every index. Changing it at runtime via
    /// `VexDB::set_metric` rebuilds the indexes.
    pub metric: crate::metric::DistanceMetric,

    /// Enables the write-ahead log and snapshot machinery. When false the
    /// database is purely in-memory.
    pub atomic_persistence: bool,

    /// Enables the transactional batch coordinator and the batch
    /// endpoints on the facade.
    pub batch_operations: bool,

    /// Durability settings. Ignored unless `atomic_persistence` is set.
    pub persistence: PersistenceConfig,

    /// Capacity of the query result cache. `0` disables caching.
    pub query_cache_capacity: usize,

    /// LSH index parameters. Used when `algorithm` is [`Algorithm::Lsh`].
    pub lsh: LshConfig,

    /// HNSW index parameters. Used when `algorithm` is [`Algorithm::Hnsw`].
    pub hnsw: HnswConfig,

    /// Seed for index-internal randomness (LSH hyperplanes, HNSW level
    /// draws). `None` seeds from the OS; setting it makes index
    /// construction reproducible.
    pub index_seed: Option<u64>,

    /// Maximum operations accepted in one batch.
    pub max_batch_size: usize,

    /// Validate every batch operation before applying any of them.
    pub batch_validation: bool,
}

impl Config {
    /// Creates a configuration for the given vector dimension with all
    /// other settings at their defaults.
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            algorithm: Algorithm::default(),
            metric: crate::metric::DistanceMetric::default(),
            atomic_persistence: true,
            batch_operations: true,
            persistence: PersistenceConfig::default(),
            query_cache_capacity: 128,
            lsh: LshConfig::default(),
            hnsw: HnswConfig::default(),
            index_seed: None,
            max_batch_size: 10_000,
            batch_validation: true,
        }
    }

    /// Creates an in-memory configuration: no WAL, no snapshots.
    ///
    /// Useful for tests and ephemeral workloads.
    pub fn in_memory(dimension: usize) -> Self {
        Self {
            atomic_persistence: false,
            ..Self::new(dimension)
        }
    }

    /// Validates the configuration.
    ///
    /// Called automatically by `VexDB::open()`. You can also call this
    /// explicitly to check a configuration before attempting to open.
    ///
    /// # Errors
    /// Returns `ValidationError` if:
    /// - `dimension` is 0 or exceeds 4096
    /// - `query_cache_capacity` exceeds 1,048,576
    /// - any LSH/HNSW parameter is 0, or LSH uses more than 64 hash bits
    /// - persistence triggers or limits are 0
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.dimension == 0 {
            return Err(ValidationError::invalid_field(
                "dimension",
                "must be greater than 0",
            ));
        }
        if self.dimension > 4096 {
            return Err(ValidationError::invalid_field(
                "dimension",
                "must not exceed 4096",
            ));
        }

        if self.query_cache_capacity > 1_048_576 {
            return Err(ValidationError::invalid_field(
                "query_cache_capacity",
                "must not exceed 1048576",
            ));
        }

        if self.lsh.num_tables == 0 {
            return Err(ValidationError::invalid_field(
                "lsh.num_tables",
                "must be greater than 0",
            ));
        }
        if self.lsh.num_hash_bits == 0 || self.lsh.num_hash_bits > 64 {
            return Err(ValidationError::invalid_field(
                "lsh.num_hash_bits",
                "must be between 1 and 64",
            ));
        }

        if self.hnsw.m == 0 {
            return Err(ValidationError::invalid_field(
                "hnsw.m",
                "must be greater than 0",
            ));
        }
        if self.hnsw.ef_construction == 0 {
            return Err(ValidationError::invalid_field(
                "hnsw.ef_construction",
                "must be greater than 0",
            ));
        }
        if self.hnsw.ef_search == 0 {
            return Err(ValidationError::invalid_field(
                "hnsw.ef_search",
                "must be greater than 0",
            ));
        }

        if self.max_batch_size == 0 {
            return Err(ValidationError::invalid_field(
                "max_batch_size",
                "must be greater than 0",
            ));
        }

        if self.atomic_persistence {
            self.persistence.validate()?;
        }

        Ok(())
    }
}

/// Durability configuration: WAL placement, rotation, and checkpoint
/// triggers.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Directory holding the snapshot file (`main.db`) and in-flight
    /// checkpoint temporaries.
    pub data_directory: PathBuf,

    /// Directory holding the WAL segments (`commit.log.NNNNNN`).
    pub log_directory: PathBuf,

    /// Time-based checkpoint cadence. Reserved: carried in the config and
    /// surfaced in statistics, but no timer thread consults it yet.
    pub checkpoint_interval: Duration,

    /// Snapshot after this many durable operations since the last one.
    pub checkpoint_trigger_ops: u64,

    /// Rotate the current WAL segment once it exceeds this many bytes.
    pub log_rotation_size: u64,

    /// Upper bound on retained WAL segments between checkpoints.
    pub max_log_files: usize,

    /// Recover automatically during `initialize()`. When false,
    /// initialization fails if on-disk state needs recovery.
    pub auto_recovery: bool,

    /// Verify per-record checksums during WAL replay.
    pub validate_checksums: bool,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            data_directory: PathBuf::from("data"),
            log_directory: PathBuf::from("logs"),
            checkpoint_interval: Duration::from_secs(60 * 60),
            checkpoint_trigger_ops: 10_000,
            log_rotation_size: 100 * 1024 * 1024,
            max_log_files: 10,
            auto_recovery: true,
            validate_checksums: true,
        }
    }
}

impl PersistenceConfig {
    /// Places both the data and log directories under `root`.
    ///
    /// The conventional layout is `<root>/data` and `<root>/logs`.
    pub fn under(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            data_directory: root.join("data"),
            log_directory: root.join("logs"),
            ..Self::default()
        }
    }

    fn validate(&self) -> Result<(), ValidationError> {
        if self.checkpoint_trigger_ops == 0 {
            return Err(ValidationError::invalid_field(
                "persistence.checkpoint_trigger_ops",
                "must be greater than 0",
            ));
        }
        if self.log_rotation_size == 0 {
            return Err(ValidationError::invalid_field(
                "persistence.log_rotation_size",
                "must be greater than 0",
            ));
        }
        if self.max_log_files == 0 {
            return Err(ValidationError::invalid_field(
                "persistence.max_log_files",
                "must be greater than 0",
            ));
        }
        Ok(())
    }
}

/// Configuration for the LSH index.
///
/// Recall grows with `num_tables`; bucket precision grows with
/// `num_hash_bits`. There is no fallback scan: if the union of matching
/// buckets holds fewer than k candidates, fewer than k results come back.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct LshConfig {
    /// Number of independent hash tables (T).
    pub num_tables: usize,
    /// Sign bits per table signature (H), at most 64.
    pub num_hash_bits: usize,
}

impl Default for LshConfig {
    fn default() -> Self {
        Self {
            num_tables: 10,
            num_hash_bits: 8,
        }
    }
}

/// Configuration for the HNSW index.
///
/// Controls the trade-off between build time, memory, and recall.
///
/// # Tuning Guide
///
/// | Use Case    | m  | ef_construction | ef_search |
/// |-------------|----|-----------------|-----------|
/// | Low memory  |  8 |             100 |        30 |
/// | Balanced    | 16 |             200 |        50 |
/// | High recall | 32 |             400 |       100 |
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct HnswConfig {
    /// Maximum bidirectional connections per node above layer 0 (M).
    /// Layer 0 allows 2·M.
    pub m: usize,
    /// Frontier width during construction. Rule of thumb: ≥ 2·m.
    pub ef_construction: usize,
    /// Frontier width during search. Effective width is
    /// `max(ef_search, k)`.
    pub ef_search: usize,
}

impl Default for HnswConfig {
    fn default() -> Self {
        Self {
            m: 16,
            ef_construction: 200,
            ef_search: 50,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::new(128);
        assert_eq!(config.dimension, 128);
        assert_eq!(config.algorithm, Algorithm::Exact);
        assert!(config.atomic_persistence);
        assert!(config.batch_operations);
        assert_eq!(config.query_cache_capacity, 128);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_in_memory_config() {
        let config = Config::in_memory(64);
        assert!(!config.atomic_persistence);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_zero_dimension() {
        let config = Config::new(0);
        let err = config.validate().unwrap_err();
        assert!(matches!(
            err,
            ValidationError::InvalidField { field, .. } if field == "dimension"
        ));
    }

    #[test]
    fn test_validate_dimension_too_large() {
        let config = Config::new(5000);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_cache_capacity_bound() {
        let config = Config {
            query_cache_capacity: 2_000_000,
            ..Config::new(8)
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_lsh_bits_bound() {
        let config = Config {
            lsh: LshConfig {
                num_tables: 4,
                num_hash_bits: 65,
            },
            ..Config::new(8)
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_hnsw_zero_m() {
        let config = Config {
            hnsw: HnswConfig {
                m: 0,
                ..Default::default()
            },
            ..Config::new(8)
        };
        let err = config.validate().unwrap_err();
        assert!(matches!(
            err,
            ValidationError::InvalidField { field, .. } if field == "hnsw.m"
        ));
    }

    #[test]
    fn test_validate_persistence_triggers() {
        let mut config = Config::new(8);
        config.persistence.checkpoint_trigger_ops = 0;
        assert!(config.validate().is_err());

        // The same config is fine once persistence is off.
        config.atomic_persistence = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_persistence_under_root() {
        let p = PersistenceConfig::under("/tmp/vex");
        assert_eq!(p.data_directory, PathBuf::from("/tmp/vex/data"));
        assert_eq!(p.log_directory, PathBuf::from("/tmp/vex/logs"));
    }

    #[test]
    fn test_algorithm_names_round_trip() {
        for alg in [Algorithm::Exact, Algorithm::Lsh, Algorithm::Hnsw] {
            assert_eq!(Algorithm::from_name(alg.name()), Some(alg));
        }
        assert_eq!(Algorithm::from_name("annoy"), None);
    }
}
