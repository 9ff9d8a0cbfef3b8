//! Nearest-neighbor index engines.
//!
//! Three engines implement a common [`VectorIndex`] interface:
//!
//! ```text
//! ┌──────────────────────────────────┐
//! │         VectorIndex trait        │
//! └──────────┬───────────────────────┘
//!            │
//!    ┌───────┼──────────────┐
//!    │       │              │
//! KdTree  LshIndex     HnswIndex
//! (exact) (hyperplane  (layered proximity
//!          buckets)     graph)
//! ```
//!
//! The authoritative key→vector map owned by the facade is the source of
//! truth; every index is a rebuildable derivative. Indexes are never
//! updated on delete; the facade filters stale keys out of results and
//! rebuilds when staleness accumulates.

mod hnsw;
mod kdtree;
mod lsh;

pub use hnsw::HnswIndex;
pub use kdtree::KdTree;
pub use lsh::LshIndex;

use crate::metric::DistanceMetric;
use crate::types::Vector;

/// Common interface over the nearest-neighbor engines.
///
/// The facade holds every engine behind its single database lock, so
/// mutation takes `&mut self` and no engine needs interior mutability.
///
/// Searches return `(key, distance)` rows sorted ascending by distance,
/// at most `k` of them. Distances are computed against the vectors the
/// index stored at insert time; the facade recomputes against the
/// authoritative map before results reach callers.
pub trait VectorIndex: Send + Sync {
    /// Inserts a vector under the given key. Keys are not deduplicated at
    /// this layer; re-inserting a key adds a second entry whose staleness
    /// the facade tracks.
    fn insert(&mut self, key: &str, vector: &Vector);

    /// Returns up to `k` nearest entries to `query`, closest first.
    /// An empty index yields an empty list.
    fn search(&self, query: &Vector, k: usize) -> Vec<(String, f32)>;

    /// Number of stored entries (including any stale duplicates).
    fn len(&self) -> usize;

    /// Returns true if nothing is stored.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes every entry, keeping configuration.
    fn clear(&mut self);

    /// Replaces the scoring metric, dropping all entries.
    ///
    /// The caller is expected to re-insert from the authoritative map;
    /// distances and graph structure derived under the old metric are not
    /// reusable.
    fn reset_metric(&mut self, metric: DistanceMetric);
}
