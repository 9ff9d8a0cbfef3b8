//! Approximate nearest neighbors by random-hyperplane hashing.
//!
//! T independent tables each hash a vector to an H-bit signature: bit j
//! is `sign(⟨v, w⟩ + b)` for a hyperplane (w, b) drawn from a standard
//! normal at construction. Search unions the query's bucket across all
//! tables, deduplicates by key, and scores candidates with the active
//! metric.
//!
//! There is no fallback scan of neighboring buckets: if the union holds
//! fewer than k candidates, fewer than k results are returned. Recall
//! grows with T, bucket precision with H.

use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::index::VectorIndex;
use crate::metric::{dot, DistanceMetric};
use crate::types::Vector;

struct Hyperplane {
    weights: Vec<f32>,
    bias: f32,
}

impl Hyperplane {
    fn side(&self, v: &[f32]) -> u64 {
        if dot(v, &self.weights) + self.bias > 0.0 {
            1
        } else {
            0
        }
    }
}

/// Approximate nearest-neighbor index over bucketed hyperplane signatures.
pub struct LshIndex {
    // hyperplanes[t * num_hash_bits + j] is bit j of table t.
    hyperplanes: Vec<Hyperplane>,
    tables: Vec<HashMap<u64, Vec<(Vector, String)>>>,
    num_tables: usize,
    num_hash_bits: usize,
    dimension: usize,
    metric: DistanceMetric,
    seed: Option<u64>,
    len: usize,
}

impl LshIndex {
    /// Creates an index with `num_tables` tables of `num_hash_bits`-bit
    /// signatures. Hyperplanes are drawn immediately; a seed makes the
    /// draw reproducible.
    pub fn new(
        dimension: usize,
        num_tables: usize,
        num_hash_bits: usize,
        metric: DistanceMetric,
        seed: Option<u64>,
    ) -> Self {
        let mut rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_os_rng(),
        };

        let hyperplanes = (0..num_tables * num_hash_bits)
            .map(|_| Hyperplane {
                weights: (0..dimension).map(|_| sample_normal(&mut rng)).collect(),
                bias: sample_normal(&mut rng),
            })
            .collect();

        Self {
            hyperplanes,
            tables: (0..num_tables).map(|_| HashMap::new()).collect(),
            num_tables,
            num_hash_bits,
            dimension,
            metric,
            seed,
            len: 0,
        }
    }

    /// H-bit signature of `v` in table `t`, packed into a u64.
    fn signature(&self, table: usize, v: &[f32]) -> u64 {
        let base = table * self.num_hash_bits;
        let mut sig = 0u64;
        for j in 0..self.num_hash_bits {
            sig = (sig << 1) | self.hyperplanes[base + j].side(v);
        }
        sig
    }

    /// Number of hash tables (T).
    pub fn num_tables(&self) -> usize {
        self.num_tables
    }

    /// Signature width in bits (H).
    pub fn num_hash_bits(&self) -> usize {
        self.num_hash_bits
    }
}

/// Standard-normal sample via Box–Muller over two uniforms.
fn sample_normal(rng: &mut StdRng) -> f32 {
    let u1: f64 = rng.random::<f64>().max(1e-12);
    let u2: f64 = rng.random();
    ((-2.0 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos()) as f32
}

impl VectorIndex for LshIndex {
    fn insert(&mut self, key: &str, vector: &Vector) {
        for t in 0..self.num_tables {
            let sig = self.signature(t, vector.as_slice());
            self.tables[t]
                .entry(sig)
                .or_default()
                .push((vector.clone(), key.to_string()));
        }
        self.len += 1;
    }

    fn search(&self, query: &Vector, k: usize) -> Vec<(String, f32)> {
        if k == 0 || self.len == 0 {
            return Vec::new();
        }

        // Union of bucket contents across tables, first hit per key wins.
        let mut candidates: HashMap<&str, f32> = HashMap::new();
        for t in 0..self.num_tables {
            let sig = self.signature(t, query.as_slice());
            let Some(bucket) = self.tables[t].get(&sig) else {
                continue;
            };
            for (vector, key) in bucket {
                candidates
                    .entry(key.as_str())
                    .or_insert_with(|| self.metric.distance(query, vector));
            }
        }

        let mut results: Vec<(String, f32)> = candidates
            .into_iter()
            .map(|(key, dist)| (key.to_string(), dist))
            .collect();
        results.sort_by(|a, b| a.1.total_cmp(&b.1));
        results.truncate(k);
        results
    }

    fn len(&self) -> usize {
        self.len
    }

    fn clear(&mut self) {
        for table in &mut self.tables {
            table.clear();
        }
        self.len = 0;
    }

    fn reset_metric(&mut self, metric: DistanceMetric) {
        // Bucket structure only depends on the hyperplanes, but scored
        // candidates must not mix metrics with the rest of the database,
        // so entries are dropped for the caller to re-insert.
        *self = Self::new(
            self.dimension,
            self.num_tables,
            self.num_hash_bits,
            metric,
            self.seed,
        );
    }
}

impl std::fmt::Debug for LshIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LshIndex")
            .field("dimension", &self.dimension)
            .field("num_tables", &self.num_tables)
            .field("num_hash_bits", &self.num_hash_bits)
            .field("metric", &self.metric)
            .field("len", &self.len)
            .finish()
    }
}
