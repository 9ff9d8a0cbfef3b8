//! VexDB main struct and lifecycle operations.
//!
//! The [`VexDB`] struct is the primary interface for interacting with
//! the database. It provides methods for:
//!
//! - Opening and closing the database
//! - Inserting, updating, and removing keyed vectors
//! - Exact and approximate similarity search
//! - Transactional batch operations
//! - Checkpointing and recovery status
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use vexdb::{Config, Vector, VexDB};
//!
//! // Open (and recover) a database
//! let db = VexDB::open(Config::new(3))?;
//!
//! // Store an embedding
//! db.insert("doc-1", Vector::from(vec![0.1, 0.2, 0.3]), Some("title"))?;
//!
//! // Find the two nearest entries
//! let hits = db.similarity_search(&Vector::from(vec![0.1, 0.2, 0.25]), 2)?;
//!
//! // Flush and close
//! db.close()?;
//! ```
//!
//! # Thread Safety
//!
//! `VexDB` is `Send + Sync` and can be shared across threads using
//! `Arc`. A single reader-writer lock protects the authoritative maps
//! and every index: mutations serialize through the write half (their
//! WAL records inherit that total order), searches share the read half.
//! The query cache and the persistence layer carry their own internal
//! locking and are only touched while a guard is held.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::RwLock;

use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::batch::{BatchCoordinator, BatchOperation, BatchResult, BatchStats, OperationType};
use crate::cache::{CacheStats, QueryCache};
use crate::config::{Algorithm, Config};
use crate::error::{NotFoundError, Result, ValidationError, VexDBError};
use crate::index::{HnswIndex, KdTree, LshIndex, VectorIndex};
use crate::metric::DistanceMetric;
use crate::storage::{AtomicPersistence, PersistenceStats, RecoveryInfo};
use crate::types::{SearchResult, Vector};

/// Rebuild the indexes once this many stale entries accumulate (and they
/// outnumber half the live entries). Below the floor, result filtering
/// alone is cheaper than a rebuild.
const STALE_REBUILD_FLOOR: usize = 64;

struct DatabaseInner {
    vectors: HashMap<String, Vector>,
    metadata: HashMap<String, String>,
    kdtree: KdTree,
    lsh: Option<LshIndex>,
    hnsw: Option<HnswIndex>,
    algorithm: Algorithm,
    metric: DistanceMetric,
    // Index entries whose key was removed or re-inserted elsewhere.
    // Searches over-fetch by this amount and filter; crossing the
    // rebuild threshold resets it.
    stale_entries: usize,
}

#[derive(Default)]
struct FacadeCounters {
    total_inserts: AtomicU64,
    total_updates: AtomicU64,
    total_deletes: AtomicU64,
    total_searches: AtomicU64,
}

/// Aggregated statistics across the facade and its subsystems.
#[derive(Clone, Debug, Serialize)]
pub struct DatabaseStats {
    /// Configured vector dimension.
    pub dimension: usize,
    /// Index currently answering searches.
    pub algorithm: Algorithm,
    /// Active distance metric.
    pub metric: DistanceMetric,
    /// Live entries in the authoritative map.
    pub vector_count: usize,
    /// Successful inserts since open.
    pub total_inserts: u64,
    /// Successful updates since open.
    pub total_updates: u64,
    /// Successful deletes since open.
    pub total_deletes: u64,
    /// Similarity searches since open.
    pub total_searches: u64,
    /// Persistence counters, when the WAL is enabled.
    pub persistence: Option<PersistenceStats>,
    /// Batch counters, when batches are enabled.
    pub batch: Option<BatchStats>,
    /// Query cache counters, when the cache is enabled.
    pub cache: Option<CacheStats>,
}

/// The main VexDB database handle.
///
/// Create an instance with [`VexDB::open()`] and close it with
/// [`VexDB::close()`].
///
/// # Ownership
///
/// `VexDB` owns its indexes, persistence layer, batch coordinator, and
/// query cache. `close()` consumes the handle, so a closed database
/// cannot be used by mistake.
pub struct VexDB {
    config: Config,
    inner: RwLock<DatabaseInner>,
    persistence: Option<AtomicPersistence>,
    batch: Option<BatchCoordinator>,
    cache: Option<QueryCache>,
    ready: AtomicBool,
    counters: FacadeCounters,
}

impl std::fmt::Debug for VexDB {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.inner.read().map(|i| i.vectors.len()).unwrap_or(0);
        f.debug_struct("VexDB")
            .field("dimension", &self.config.dimension)
            .field("algorithm", &self.config.algorithm)
            .field("vector_count", &count)
            .field("ready", &self.ready.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl VexDB {
    /// Constructs the database without touching disk.
    ///
    /// Most callers want [`VexDB::open()`], which also runs
    /// [`VexDB::initialize()`].
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let lsh = (config.algorithm == Algorithm::Lsh).then(|| {
            LshIndex::new(
                config.dimension,
                config.lsh.num_tables,
                config.lsh.num_hash_bits,
                config.metric,
                config.index_seed,
            )
        });
        let hnsw = (config.algorithm == Algorithm::Hnsw).then(|| {
            HnswIndex::new(
                config.dimension,
                config.hnsw.m,
                config.hnsw.ef_construction,
                config.hnsw.ef_search,
                config.metric,
                config.index_seed,
            )
        });

        let inner = DatabaseInner {
            vectors: HashMap::new(),
            metadata: HashMap::new(),
            kdtree: KdTree::new(config.dimension, config.metric),
            lsh,
            hnsw,
            algorithm: config.algorithm,
            metric: config.metric,
            stale_entries: 0,
        };

        let persistence = config
            .atomic_persistence
            .then(|| AtomicPersistence::new(config.persistence.clone()));
        let batch = config.batch_operations.then(|| BatchCoordinator::new(&config));
        let cache = (config.query_cache_capacity > 0)
            .then(|| QueryCache::new(config.query_cache_capacity));

        Ok(Self {
            config,
            inner: RwLock::new(inner),
            persistence,
            batch,
            cache,
            ready: AtomicBool::new(false),
            counters: FacadeCounters::default(),
        })
    }

    /// Opens a database: validates the configuration, recovers prior
    /// state from disk, and rebuilds the indexes.
    #[instrument(skip(config), fields(dimension = config.dimension, algorithm = %config.algorithm))]
    pub fn open(config: Config) -> Result<Self> {
        let db = Self::new(config)?;
        db.initialize()?;
        Ok(db)
    }

    /// Recovers prior state and marks the database ready. Idempotent.
    pub fn initialize(&self) -> Result<()> {
        if self.ready.load(Ordering::Acquire) {
            return Ok(());
        }

        if let Some(persistence) = &self.persistence {
            persistence.initialize()?;

            let mut vectors = HashMap::new();
            let mut metadata = HashMap::new();
            persistence.load_database(&mut vectors, &mut metadata)?;

            let mut guard = self.write_inner()?;
            guard.vectors = vectors;
            guard.metadata = metadata;
            Self::rebuild_locked(&mut guard);
            info!(entries = guard.vectors.len(), "database initialized from disk");
        } else {
            info!("database initialized in memory");
        }

        self.ready.store(true, Ordering::Release);
        Ok(())
    }

    /// Flushes the WAL and marks the database not ready. Idempotent.
    pub fn shutdown(&self) -> Result<()> {
        if let Some(persistence) = &self.persistence {
            persistence.shutdown()?;
        }
        self.ready.store(false, Ordering::Release);
        Ok(())
    }

    /// Closes the database, consuming the handle.
    #[instrument(skip(self))]
    pub fn close(self) -> Result<()> {
        self.shutdown()
    }

    /// Returns a reference to the configuration the database was opened
    /// with.
    #[inline]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Vector dimension D.
    #[inline]
    pub fn dimension(&self) -> usize {
        self.config.dimension
    }

    /// True once `initialize()` completed and before `shutdown()`.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// True while crash recovery is replaying the WAL.
    pub fn is_recovering(&self) -> bool {
        self.persistence
            .as_ref()
            .map(|p| p.is_recovering())
            .unwrap_or(false)
    }

    /// Findings of the last recovery analysis, if persistence is on.
    pub fn recovery_info(&self) -> Result<Option<RecoveryInfo>> {
        match &self.persistence {
            Some(p) => Ok(Some(p.recovery_info()?)),
            None => Ok(None),
        }
    }

    // =========================================================================
    // Lock helpers
    // =========================================================================

    fn read_inner(&self) -> Result<std::sync::RwLockReadGuard<'_, DatabaseInner>> {
        self.inner
            .read()
            .map_err(|_| VexDBError::poisoned("database"))
    }

    fn write_inner(&self) -> Result<std::sync::RwLockWriteGuard<'_, DatabaseInner>> {
        self.inner
            .write()
            .map_err(|_| VexDBError::poisoned("database"))
    }

    fn ensure_ready(&self) -> Result<()> {
        if !self.ready.load(Ordering::Acquire) || self.is_recovering() {
            return Err(VexDBError::NotInitialized);
        }
        Ok(())
    }

    fn validate_vector(&self, vector: &Vector) -> Result<()> {
        if vector.len() != self.config.dimension {
            return Err(
                ValidationError::dimension_mismatch(self.config.dimension, vector.len()).into(),
            );
        }
        if let Some(position) = vector.first_non_finite() {
            warn!(position, "rejecting vector with non-finite component");
            return Err(ValidationError::non_finite(position).into());
        }
        Ok(())
    }

    fn clear_cache(&self) -> Result<()> {
        if let Some(cache) = &self.cache {
            cache.clear()?;
        }
        Ok(())
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    /// Inserts a new entry.
    ///
    /// # Errors
    ///
    /// - [`ValidationError::DimensionMismatch`] if the vector length ≠ D
    /// - [`ValidationError::NonFinite`] if any component is NaN/infinite
    /// - [`VexDBError::DuplicateKey`] if the key exists (use
    ///   [`update`](Self::update) to replace)
    /// - [`VexDBError::Io`] if the WAL append fails; the in-memory
    ///   mutation is rolled back first
    #[instrument(skip(self, vector, metadata), fields(key = %key))]
    pub fn insert(&self, key: &str, vector: Vector, metadata: Option<&str>) -> Result<()> {
        self.ensure_ready()?;
        let mut guard = self.write_inner()?;
        self.insert_locked(&mut guard, key, &vector, metadata)?;
        self.clear_cache()?;
        self.maybe_checkpoint(&mut guard);
        Ok(())
    }

    /// Replaces the vector (and metadata) of an existing entry.
    ///
    /// Passing `None` or an empty string as metadata erases the entry's
    /// metadata, matching the durable record's semantics.
    ///
    /// # Errors
    ///
    /// [`NotFoundError::Key`] if the key does not exist, plus the same
    /// validation and I/O errors as [`insert`](Self::insert).
    #[instrument(skip(self, vector, metadata), fields(key = %key))]
    pub fn update(&self, key: &str, vector: Vector, metadata: Option<&str>) -> Result<()> {
        self.ensure_ready()?;
        let mut guard = self.write_inner()?;
        self.update_locked(&mut guard, key, &vector, metadata)?;
        self.clear_cache()?;
        self.maybe_checkpoint(&mut guard);
        Ok(())
    }

    /// Removes an entry and its metadata.
    ///
    /// Indexes are not rewritten; the now-stale entries are filtered out
    /// of every search and reclaimed by the next rebuild.
    #[instrument(skip(self), fields(key = %key))]
    pub fn remove(&self, key: &str) -> Result<()> {
        self.ensure_ready()?;
        let mut guard = self.write_inner()?;
        self.remove_locked(&mut guard, key)?;
        self.clear_cache()?;
        self.maybe_checkpoint(&mut guard);
        Ok(())
    }

    fn insert_locked(
        &self,
        inner: &mut DatabaseInner,
        key: &str,
        vector: &Vector,
        metadata: Option<&str>,
    ) -> Result<()> {
        if key.is_empty() {
            return Err(ValidationError::required_field("key").into());
        }
        self.validate_vector(vector)?;
        if inner.vectors.contains_key(key) {
            return Err(VexDBError::DuplicateKey(key.to_string()));
        }

        let meta = metadata.unwrap_or("");
        inner.vectors.insert(key.to_string(), vector.clone());
        if !meta.is_empty() {
            inner.metadata.insert(key.to_string(), meta.to_string());
        }
        Self::index_insert(inner, key, vector);

        if let Some(persistence) = &self.persistence {
            if let Err(e) = persistence.log_insert(key, vector, meta) {
                // Roll back the in-memory half; the index entries just
                // added become stale and are filtered out of searches.
                inner.vectors.remove(key);
                inner.metadata.remove(key);
                inner.stale_entries += 1;
                return Err(e);
            }
        }

        self.counters.total_inserts.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn update_locked(
        &self,
        inner: &mut DatabaseInner,
        key: &str,
        vector: &Vector,
        metadata: Option<&str>,
    ) -> Result<()> {
        self.validate_vector(vector)?;
        let Some(old_vector) = inner.vectors.get(key).cloned() else {
            return Err(NotFoundError::key(key).into());
        };
        let old_metadata = inner.metadata.get(key).cloned();

        let meta = metadata.unwrap_or("");
        inner.vectors.insert(key.to_string(), vector.clone());
        if meta.is_empty() {
            inner.metadata.remove(key);
        } else {
            inner.metadata.insert(key.to_string(), meta.to_string());
        }
        // Re-insert into every index: the displaced position (or, if the
        // WAL append fails below, the new one) becomes a stale entry.
        Self::index_insert(inner, key, vector);
        inner.stale_entries += 1;

        if let Some(persistence) = &self.persistence {
            if let Err(e) = persistence.log_update(key, vector, meta) {
                inner.vectors.insert(key.to_string(), old_vector);
                match old_metadata {
                    Some(m) => {
                        inner.metadata.insert(key.to_string(), m);
                    }
                    None => {
                        inner.metadata.remove(key);
                    }
                }
                return Err(e);
            }
        }

        self.counters.total_updates.fetch_add(1, Ordering::Relaxed);
        self.maybe_rebuild(inner);
        Ok(())
    }

    fn remove_locked(&self, inner: &mut DatabaseInner, key: &str) -> Result<()> {
        let Some(old_vector) = inner.vectors.remove(key) else {
            return Err(NotFoundError::key(key).into());
        };
        let old_metadata = inner.metadata.remove(key);
        inner.stale_entries += 1;

        if let Some(persistence) = &self.persistence {
            if let Err(e) = persistence.log_remove(key) {
                inner.vectors.insert(key.to_string(), old_vector);
                if let Some(m) = old_metadata {
                    inner.metadata.insert(key.to_string(), m);
                }
                // The index entries are live again.
                inner.stale_entries -= 1;
                return Err(e);
            }
        }

        self.counters.total_deletes.fetch_add(1, Ordering::Relaxed);
        self.maybe_rebuild(inner);
        Ok(())
    }

    fn index_insert(inner: &mut DatabaseInner, key: &str, vector: &Vector) {
        inner.kdtree.insert(key, vector);
        if let Some(lsh) = inner.lsh.as_mut() {
            lsh.insert(key, vector);
        }
        if let Some(hnsw) = inner.hnsw.as_mut() {
            hnsw.insert(key, vector);
        }
    }

    /// Rebuilds every index from the authoritative map.
    fn rebuild_locked(inner: &mut DatabaseInner) {
        let DatabaseInner {
            vectors,
            kdtree,
            lsh,
            hnsw,
            stale_entries,
            ..
        } = inner;

        kdtree.clear();
        if let Some(lsh) = lsh.as_mut() {
            lsh.clear();
        }
        if let Some(hnsw) = hnsw.as_mut() {
            hnsw.clear();
        }
        for (key, vector) in vectors.iter() {
            kdtree.insert(key, vector);
            if let Some(lsh) = lsh.as_mut() {
                lsh.insert(key, vector);
            }
            if let Some(hnsw) = hnsw.as_mut() {
                hnsw.insert(key, vector);
            }
        }
        *stale_entries = 0;
    }

    fn maybe_rebuild(&self, inner: &mut DatabaseInner) {
        if inner.stale_entries > STALE_REBUILD_FLOOR
            && inner.stale_entries * 2 > inner.vectors.len()
        {
            info!(
                stale = inner.stale_entries,
                live = inner.vectors.len(),
                "rebuilding indexes to reclaim stale entries"
            );
            Self::rebuild_locked(inner);
        }
    }

    fn maybe_checkpoint(&self, inner: &mut DatabaseInner) {
        let Some(persistence) = &self.persistence else {
            return;
        };
        if !persistence.should_checkpoint() {
            return;
        }
        // A failed auto-checkpoint must not fail the mutation that
        // triggered it; the WAL still holds every record.
        if let Err(e) = persistence.save_snapshot(&inner.vectors, &inner.metadata) {
            warn!(error = %e, "auto-checkpoint failed; WAL remains authoritative");
        }
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Returns the vector stored under `key`, or `None`.
    pub fn get(&self, key: &str) -> Result<Option<Vector>> {
        self.ensure_ready()?;
        Ok(self.read_inner()?.vectors.get(key).cloned())
    }

    /// Returns the metadata stored under `key`; absent means empty.
    pub fn metadata(&self, key: &str) -> Result<String> {
        self.ensure_ready()?;
        Ok(self
            .read_inner()?
            .metadata
            .get(key)
            .cloned()
            .unwrap_or_default())
    }

    /// True if an entry exists under `key`.
    pub fn contains(&self, key: &str) -> Result<bool> {
        self.ensure_ready()?;
        Ok(self.read_inner()?.vectors.contains_key(key))
    }

    /// Number of live entries.
    pub fn len(&self) -> Result<usize> {
        self.ensure_ready()?;
        Ok(self.read_inner()?.vectors.len())
    }

    /// True when no entries are stored.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Every live key, in no particular order.
    pub fn all_keys(&self) -> Result<Vec<String>> {
        self.ensure_ready()?;
        Ok(self.read_inner()?.vectors.keys().cloned().collect())
    }

    // =========================================================================
    // Similarity search
    // =========================================================================

    /// Returns the `k` nearest entries to `query` under the active
    /// metric, closest first.
    ///
    /// Served from the query cache when the exact query vector was
    /// searched since the last mutation. An empty database or `k = 0`
    /// returns an empty list without touching index or cache.
    #[instrument(skip(self, query))]
    pub fn similarity_search(&self, query: &Vector, k: usize) -> Result<Vec<(String, f32)>> {
        self.ensure_ready()?;
        if query.len() != self.config.dimension {
            return Err(
                ValidationError::dimension_mismatch(self.config.dimension, query.len()).into(),
            );
        }
        self.counters.total_searches.fetch_add(1, Ordering::Relaxed);

        let guard = self.read_inner()?;
        let inner = &*guard;

        if k == 0 || inner.vectors.is_empty() {
            return Ok(Vec::new());
        }

        if let Some(cache) = &self.cache {
            if let Some(hit) = cache.get(query)? {
                return Ok(hit);
            }
        }

        // Over-fetch so stale index entries (deleted or displaced by
        // updates) can be filtered without shrinking the result set.
        let fetch = k.saturating_add(inner.stale_entries);
        let raw = match inner.algorithm {
            Algorithm::Exact => inner.kdtree.search(query, fetch),
            Algorithm::Lsh => inner
                .lsh
                .as_ref()
                .map(|index| index.search(query, fetch))
                .unwrap_or_default(),
            Algorithm::Hnsw => inner
                .hnsw
                .as_ref()
                .map(|index| index.search(query, fetch))
                .unwrap_or_default(),
        };

        // Keep only live keys, once each, and re-score against the
        // authoritative vector so results always reflect current state.
        let mut seen: HashSet<&str> = HashSet::with_capacity(raw.len());
        let mut results: Vec<(String, f32)> = Vec::with_capacity(raw.len().min(k));
        for (key, _) in &raw {
            if let Some(live) = inner.vectors.get(key) {
                if seen.insert(key.as_str()) {
                    results.push((key.clone(), inner.metric.distance(query, live)));
                }
            }
        }
        results.sort_by(|a, b| a.1.total_cmp(&b.1));
        results.truncate(k);

        if let Some(cache) = &self.cache {
            cache.put(query.clone(), results.clone())?;
        }
        Ok(results)
    }

    /// As [`similarity_search`](Self::similarity_search), joined with
    /// each key's metadata (absent metadata yields an empty string).
    pub fn similarity_search_with_metadata(
        &self,
        query: &Vector,
        k: usize,
    ) -> Result<Vec<SearchResult>> {
        let rows = self.similarity_search(query, k)?;
        let guard = self.read_inner()?;
        Ok(rows
            .into_iter()
            .map(|(key, distance)| {
                let metadata = guard.metadata.get(&key).cloned().unwrap_or_default();
                SearchResult {
                    key,
                    distance,
                    metadata,
                }
            })
            .collect())
    }

    /// Runs one search per query, preserving query order.
    pub fn batch_similarity_search(
        &self,
        queries: &[Vector],
        k: usize,
    ) -> Result<Vec<Vec<(String, f32)>>> {
        queries
            .iter()
            .map(|query| self.similarity_search(query, k))
            .collect()
    }

    // =========================================================================
    // Batch operations
    // =========================================================================

    fn coordinator(&self) -> Result<&BatchCoordinator> {
        self.batch
            .as_ref()
            .ok_or_else(|| VexDBError::config("batch operations are disabled"))
    }

    /// Executes a mixed transactional batch.
    ///
    /// Operations apply in order through the same validation, in-memory
    /// mutation, and WAL append as the single-op methods. The first
    /// failure stops the batch: operations before it remain committed
    /// (maps and WAL agree), the failing operation is fully rolled back,
    /// and later operations are never attempted.
    #[instrument(skip(self, operations), fields(operations = operations.len()))]
    pub fn execute_batch(&self, operations: &[BatchOperation]) -> Result<BatchResult> {
        self.ensure_ready()?;
        let coordinator = self.coordinator()?;

        let mut guard = self.write_inner()?;
        let inner = &mut *guard;
        let result = coordinator.run(operations, |op| {
            fn vector(op: &BatchOperation) -> Result<&Vector> {
                op.vector
                    .as_ref()
                    .ok_or_else(|| ValidationError::required_field("vector").into())
            }
            match op.op {
                OperationType::Insert => {
                    self.insert_locked(inner, &op.key, vector(op)?, op.metadata.as_deref())
                }
                OperationType::Update => {
                    self.update_locked(inner, &op.key, vector(op)?, op.metadata.as_deref())
                }
                OperationType::Delete => self.remove_locked(inner, &op.key),
            }
        });

        if result.operations_committed > 0 {
            self.clear_cache()?;
            self.maybe_checkpoint(&mut guard);
        }
        Ok(result)
    }

    /// Transactionally inserts aligned keys/vectors (+ optional aligned
    /// metadata).
    pub fn batch_insert(
        &self,
        keys: &[String],
        vectors: &[Vector],
        metadata: &[String],
    ) -> Result<BatchResult> {
        let ops = Self::aligned_ops(OperationType::Insert, keys, vectors, metadata)?;
        self.execute_batch(&ops)
    }

    /// Transactionally updates aligned keys/vectors (+ optional aligned
    /// metadata).
    pub fn batch_update(
        &self,
        keys: &[String],
        vectors: &[Vector],
        metadata: &[String],
    ) -> Result<BatchResult> {
        let ops = Self::aligned_ops(OperationType::Update, keys, vectors, metadata)?;
        self.execute_batch(&ops)
    }

    /// Transactionally deletes the given keys.
    pub fn batch_delete(&self, keys: &[String]) -> Result<BatchResult> {
        let ops: Vec<BatchOperation> = keys
            .iter()
            .map(|key| BatchOperation::delete(key.clone()))
            .collect();
        self.execute_batch(&ops)
    }

    fn aligned_ops(
        op: OperationType,
        keys: &[String],
        vectors: &[Vector],
        metadata: &[String],
    ) -> Result<Vec<BatchOperation>> {
        if keys.len() != vectors.len() {
            return Err(ValidationError::invalid_batch(format!(
                "{} keys but {} vectors",
                keys.len(),
                vectors.len()
            ))
            .into());
        }
        Ok(keys
            .iter()
            .zip(vectors.iter())
            .enumerate()
            .map(|(i, (key, vector))| BatchOperation {
                op,
                key: key.clone(),
                vector: Some(vector.clone()),
                metadata: metadata.get(i).cloned(),
            })
            .collect())
    }

    // =========================================================================
    // Durability controls
    // =========================================================================

    /// Fsyncs the WAL. A no-op without persistence.
    pub fn flush(&self) -> Result<()> {
        self.ensure_ready()?;
        if let Some(persistence) = &self.persistence {
            persistence.flush()?;
        }
        Ok(())
    }

    /// Forces a snapshot now: serializes the maps, records a CHECKPOINT,
    /// rotates the WAL, and deletes superseded segments.
    #[instrument(skip(self))]
    pub fn checkpoint(&self) -> Result<()> {
        self.ensure_ready()?;
        let persistence = self
            .persistence
            .as_ref()
            .ok_or_else(|| VexDBError::config("atomic persistence is disabled"))?;

        let guard = self.read_inner()?;
        persistence.save_snapshot(&guard.vectors, &guard.metadata)?;
        persistence.on_checkpoint_completed()?;
        Ok(())
    }

    // =========================================================================
    // Runtime reconfiguration
    // =========================================================================

    /// Switches the distance metric, rebuilding every index from the
    /// authoritative map and clearing the cache.
    #[instrument(skip(self))]
    pub fn set_metric(&self, metric: DistanceMetric) -> Result<()> {
        self.ensure_ready()?;
        let mut guard = self.write_inner()?;
        guard.metric = metric;
        guard.kdtree.reset_metric(metric);
        if let Some(lsh) = guard.lsh.as_mut() {
            lsh.reset_metric(metric);
        }
        if let Some(hnsw) = guard.hnsw.as_mut() {
            hnsw.reset_metric(metric);
        }
        Self::rebuild_locked(&mut guard);
        self.clear_cache()?;
        info!(metric = %metric, "distance metric switched");
        Ok(())
    }

    /// Switches the search algorithm, building its index on first use.
    #[instrument(skip(self))]
    pub fn set_algorithm(&self, algorithm: Algorithm) -> Result<()> {
        self.ensure_ready()?;
        let mut guard = self.write_inner()?;
        if guard.algorithm == algorithm {
            return Ok(());
        }

        match algorithm {
            Algorithm::Exact => {}
            Algorithm::Lsh if guard.lsh.is_none() => {
                guard.lsh = Some(LshIndex::new(
                    self.config.dimension,
                    self.config.lsh.num_tables,
                    self.config.lsh.num_hash_bits,
                    guard.metric,
                    self.config.index_seed,
                ));
            }
            Algorithm::Hnsw if guard.hnsw.is_none() => {
                guard.hnsw = Some(HnswIndex::new(
                    self.config.dimension,
                    self.config.hnsw.m,
                    self.config.hnsw.ef_construction,
                    self.config.hnsw.ef_search,
                    guard.metric,
                    self.config.index_seed,
                ));
            }
            _ => {}
        }

        guard.algorithm = algorithm;
        Self::rebuild_locked(&mut guard);
        self.clear_cache()?;
        info!(algorithm = %algorithm, "search algorithm switched");
        Ok(())
    }

    /// Adjusts the HNSW query frontier width, when HNSW is built.
    pub fn set_ef_search(&self, ef_search: usize) -> Result<()> {
        self.ensure_ready()?;
        let mut guard = self.write_inner()?;
        match guard.hnsw.as_mut() {
            Some(hnsw) => {
                hnsw.set_ef_search(ef_search);
                Ok(())
            }
            None => Err(VexDBError::config("HNSW index is not enabled")),
        }
    }

    // =========================================================================
    // Statistics
    // =========================================================================

    /// Aggregates counters across the facade, persistence layer, batch
    /// coordinator, and query cache.
    pub fn statistics(&self) -> Result<DatabaseStats> {
        let guard = self.read_inner()?;
        Ok(DatabaseStats {
            dimension: self.config.dimension,
            algorithm: guard.algorithm,
            metric: guard.metric,
            vector_count: guard.vectors.len(),
            total_inserts: self.counters.total_inserts.load(Ordering::Relaxed),
            total_updates: self.counters.total_updates.load(Ordering::Relaxed),
            total_deletes: self.counters.total_deletes.load(Ordering::Relaxed),
            total_searches: self.counters.total_searches.load(Ordering::Relaxed),
            persistence: match &self.persistence {
                Some(p) => Some(p.statistics()?),
                None => None,
            },
            batch: self.batch.as_ref().map(|b| b.stats()),
            cache: self.cache.as_ref().map(|c| c.stats()),
        })
    }

    // =========================================================================
    // Test Helpers
    // =========================================================================

    /// Fails WAL appends after `n` more succeed.
    ///
    /// Intentionally hidden: integration tests use it to exercise the
    /// rollback paths. Production code has no reason to call it.
    #[doc(hidden)]
    pub fn inject_wal_failures_after(&self, n: u64) -> Result<()> {
        match &self.persistence {
            Some(p) => p.inject_append_failures_after(n),
            None => Err(VexDBError::config("atomic persistence is disabled")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(xs: &[f32]) -> Vector {
        Vector::from(xs.to_vec())
    }

    fn mem_db(dimension: usize) -> VexDB {
        VexDB::open(Config::in_memory(dimension)).unwrap()
    }

    #[test]
    fn test_open_in_memory() {
        let db = mem_db(3);
        assert!(db.is_ready());
        assert!(!db.is_recovering());
        assert_eq!(db.dimension(), 3);
        db.close().unwrap();
    }

    #[test]
    fn test_not_initialized_rejected() {
        let db = VexDB::new(Config::in_memory(2)).unwrap();
        let err = db.insert("a", v(&[1.0, 2.0]), None).unwrap_err();
        assert!(matches!(err, VexDBError::NotInitialized));
    }

    #[test]
    fn test_insert_get_contains() {
        let db = mem_db(2);
        db.insert("a", v(&[1.0, 2.0]), Some("meta-a")).unwrap();

        assert!(db.contains("a").unwrap());
        assert_eq!(db.get("a").unwrap().unwrap(), v(&[1.0, 2.0]));
        assert_eq!(db.metadata("a").unwrap(), "meta-a");
        assert_eq!(db.metadata("missing").unwrap(), "");
        assert_eq!(db.len().unwrap(), 1);
    }

    #[test]
    fn test_duplicate_insert_rejected_without_side_effects() {
        let db = mem_db(2);
        db.insert("a", v(&[1.0, 2.0]), None).unwrap();
        let err = db.insert("a", v(&[9.0, 9.0]), None).unwrap_err();
        assert!(err.is_duplicate_key());

        assert_eq!(db.get("a").unwrap().unwrap(), v(&[1.0, 2.0]));
        let stats = db.statistics().unwrap();
        assert_eq!(stats.total_inserts, 1);
    }

    #[test]
    fn test_dimension_mismatch_no_side_effects() {
        let db = mem_db(3);
        let err = db.insert("bad", v(&[1.0]), None).unwrap_err();
        assert!(err.is_validation());
        assert!(!db.contains("bad").unwrap());
        assert_eq!(db.statistics().unwrap().total_inserts, 0);
    }

    #[test]
    fn test_nan_rejected() {
        let db = mem_db(2);
        let err = db.insert("nan", v(&[1.0, f32::NAN]), None).unwrap_err();
        assert!(matches!(
            err,
            VexDBError::Validation(ValidationError::NonFinite { position: 1 })
        ));
        assert_eq!(db.len().unwrap(), 0);
    }

    #[test]
    fn test_update_and_remove() {
        let db = mem_db(2);
        db.insert("a", v(&[1.0, 1.0]), Some("old")).unwrap();

        db.update("a", v(&[2.0, 2.0]), None).unwrap();
        assert_eq!(db.get("a").unwrap().unwrap(), v(&[2.0, 2.0]));
        // Empty metadata erases, matching WAL replay semantics.
        assert_eq!(db.metadata("a").unwrap(), "");

        db.remove("a").unwrap();
        assert!(!db.contains("a").unwrap());

        assert!(db.update("a", v(&[3.0, 3.0]), None).unwrap_err().is_not_found());
        assert!(db.remove("a").unwrap_err().is_not_found());
    }

    #[test]
    fn test_search_empty_and_k_zero() {
        let db = mem_db(2);
        assert!(db.similarity_search(&v(&[0.0, 0.0]), 5).unwrap().is_empty());

        db.insert("a", v(&[1.0, 1.0]), None).unwrap();
        assert!(db.similarity_search(&v(&[0.0, 0.0]), 0).unwrap().is_empty());
    }

    #[test]
    fn test_exact_search_orders_results() {
        let db = mem_db(3);
        db.insert("a", v(&[0.0, 0.0, 0.0]), None).unwrap();
        db.insert("b", v(&[1.0, 0.0, 0.0]), None).unwrap();
        db.insert("c", v(&[3.0, 0.0, 0.0]), None).unwrap();

        let results = db.similarity_search(&v(&[0.9, 0.0, 0.0]), 2).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].0, "b");
        assert!((results[0].1 - 0.1).abs() < 1e-4);
        assert_eq!(results[1].0, "a");
        assert!((results[1].1 - 0.9).abs() < 1e-4);
    }

    #[test]
    fn test_deleted_keys_never_surface() {
        let db = mem_db(2);
        db.insert("a", v(&[0.0, 0.0]), None).unwrap();
        db.insert("b", v(&[1.0, 0.0]), None).unwrap();
        db.remove("a").unwrap();

        let results = db.similarity_search(&v(&[0.1, 0.0]), 5).unwrap();
        let keys: Vec<&str> = results.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["b"]);
    }

    #[test]
    fn test_update_does_not_duplicate_results() {
        let db = mem_db(2);
        db.insert("a", v(&[0.0, 0.0]), None).unwrap();
        db.update("a", v(&[5.0, 5.0]), None).unwrap();

        let results = db.similarity_search(&v(&[0.0, 0.0]), 5).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, "a");
        // Distance reflects the updated position, not the stale one.
        let expected = DistanceMetric::Euclidean.distance(&v(&[0.0, 0.0]), &v(&[5.0, 5.0]));
        assert!((results[0].1 - expected).abs() < 1e-4);
    }

    #[test]
    fn test_cache_hit_and_invalidation() {
        let db = mem_db(2);
        db.insert("a", v(&[0.0, 0.0]), None).unwrap();
        db.insert("b", v(&[1.0, 0.0]), None).unwrap();

        let query = v(&[0.5, 0.0]);
        db.similarity_search(&query, 1).unwrap();
        db.similarity_search(&query, 1).unwrap();
        let stats = db.statistics().unwrap();
        let cache = stats.cache.unwrap();
        assert_eq!(cache.hits, 1);
        assert_eq!(cache.misses, 1);

        db.remove("a").unwrap();
        let results = db.similarity_search(&query, 1).unwrap();
        assert_eq!(results[0].0, "b");
        let cache = db.statistics().unwrap().cache.unwrap();
        assert_eq!(cache.misses, 2, "mutation must force a recompute");
    }

    #[test]
    fn test_metadata_join() {
        let db = mem_db(2);
        db.insert("a", v(&[0.0, 0.0]), Some("alpha")).unwrap();
        db.insert("b", v(&[1.0, 0.0]), None).unwrap();

        let rows = db
            .similarity_search_with_metadata(&v(&[0.0, 0.0]), 2)
            .unwrap();
        assert_eq!(rows[0].key, "a");
        assert_eq!(rows[0].metadata, "alpha");
        assert_eq!(rows[1].key, "b");
        assert_eq!(rows[1].metadata, "");
    }

    #[test]
    fn test_batch_search_preserves_order() {
        let db = mem_db(2);
        db.insert("a", v(&[0.0, 0.0]), None).unwrap();
        db.insert("b", v(&[10.0, 10.0]), None).unwrap();

        let queries = vec![v(&[0.1, 0.1]), v(&[9.9, 9.9])];
        let results = db.batch_similarity_search(&queries, 1).unwrap();
        assert_eq!(results[0][0].0, "a");
        assert_eq!(results[1][0].0, "b");
    }

    #[test]
    fn test_set_metric_rebuilds() {
        let db = mem_db(2);
        db.insert("x", v(&[1.0, 0.0]), None).unwrap();
        db.insert("y", v(&[0.0, 1.0]), None).unwrap();

        db.set_metric(DistanceMetric::Cosine).unwrap();
        let results = db.similarity_search(&v(&[2.0, 0.01]), 1).unwrap();
        assert_eq!(results[0].0, "x");
        assert!(results[0].1 < 0.05);
        assert_eq!(db.statistics().unwrap().metric, DistanceMetric::Cosine);
    }

    #[test]
    fn test_set_algorithm_switches_index() {
        let db = mem_db(4);
        for i in 0..20 {
            db.insert(&format!("p{i}"), v(&[i as f32, 0.0, 0.0, 0.0]), None)
                .unwrap();
        }

        db.set_algorithm(Algorithm::Hnsw).unwrap();
        let results = db.similarity_search(&v(&[7.1, 0.0, 0.0, 0.0]), 1).unwrap();
        assert_eq!(results[0].0, "p7");
        assert_eq!(db.statistics().unwrap().algorithm, Algorithm::Hnsw);
    }

    #[test]
    fn test_statistics_counters() {
        let db = mem_db(2);
        db.insert("a", v(&[0.0, 0.0]), None).unwrap();
        db.insert("b", v(&[1.0, 1.0]), None).unwrap();
        db.update("a", v(&[2.0, 2.0]), None).unwrap();
        db.remove("b").unwrap();
        db.similarity_search(&v(&[0.0, 0.0]), 1).unwrap();

        let stats = db.statistics().unwrap();
        assert_eq!(stats.total_inserts, 2);
        assert_eq!(stats.total_updates, 1);
        assert_eq!(stats.total_deletes, 1);
        assert_eq!(stats.total_searches, 1);
        assert_eq!(stats.vector_count, 1);
    }

    #[test]
    fn test_vexdb_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<VexDB>();
    }
}
