//! Approximate nearest neighbors over a hierarchical proximity graph
//! (HNSW, Malkov & Yashunin 2018).
//!
//! Nodes live in an index-addressed arena; each node carries one
//! adjacency list per layer it participates in. A single global entry
//! point at the top layer is refined by greedy descent, then a best-first
//! search with a bounded visited list runs at the target layer.
//!
//! Layer assignment draws `floor(−ln(U) · mL)` with `mL = 1/ln(M)`, so the
//! expected fraction of nodes above layer L decays geometrically and the
//! entry descent is logarithmic in N.

use std::collections::{BinaryHeap, HashSet};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use smallvec::SmallVec;

use crate::index::VectorIndex;
use crate::metric::DistanceMetric;
use crate::types::Vector;

type NeighborList = SmallVec<[u32; 16]>;

/// Hard cap on assigned layers; the geometric draw exceeds this with
/// negligible probability but the cap bounds worst-case descent.
const MAX_ASSIGNED_LEVEL: usize = 32;

struct HnswNode {
    key: String,
    vector: Vector,
    level: usize,
    // neighbors[l] is the adjacency list at layer l, for l in 0..=level.
    neighbors: Vec<NeighborList>,
}

impl HnswNode {
    fn neighbors_at(&self, layer: usize) -> &[u32] {
        self.neighbors.get(layer).map(|l| l.as_slice()).unwrap_or(&[])
    }
}

/// Candidate node during layer search, ordered as a min-heap by distance.
#[derive(Clone, Copy, PartialEq)]
struct Candidate {
    id: u32,
    distance: f32,
}

impl Eq for Candidate {}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Min-heap: smaller distance = higher priority. total_cmp gives
        // IEEE 754 total ordering, so NaN queries cannot panic the heap.
        self.distance.total_cmp(&other.distance).reverse()
    }
}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Approximate nearest-neighbor index over a layered proximity graph.
pub struct HnswIndex {
    nodes: Vec<HnswNode>,
    entry_point: Option<u32>,
    max_level: usize,
    m: usize,
    m0: usize,
    ef_construction: usize,
    ef_search: usize,
    level_mult: f64,
    dimension: usize,
    metric: DistanceMetric,
    rng: StdRng,
    seed: Option<u64>,
}

impl HnswIndex {
    /// Creates an empty index.
    ///
    /// `m` is the per-node connection budget above layer 0; layer 0
    /// allows `2·m`. `ef_construction` is the frontier width during
    /// insertion, `ef_search` the default width during queries.
    pub fn new(
        dimension: usize,
        m: usize,
        ef_construction: usize,
        ef_search: usize,
        metric: DistanceMetric,
        seed: Option<u64>,
    ) -> Self {
        let rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_os_rng(),
        };
        Self {
            nodes: Vec::new(),
            entry_point: None,
            max_level: 0,
            m,
            m0: m * 2,
            ef_construction,
            ef_search,
            level_mult: 1.0 / (m.max(2) as f64).ln(),
            dimension,
            metric,
            rng,
            seed,
        }
    }

    /// Replaces the query-time frontier width.
    pub fn set_ef_search(&mut self, ef_search: usize) {
        self.ef_search = ef_search.max(1);
    }

    /// Current query-time frontier width.
    pub fn ef_search(&self) -> usize {
        self.ef_search
    }

    /// Highest layer currently assigned to any node.
    pub fn max_level(&self) -> usize {
        self.max_level
    }

    fn random_level(&mut self) -> usize {
        let u: f64 = self.rng.random::<f64>().max(f64::MIN_POSITIVE);
        let level = (-u.ln() * self.level_mult) as usize;
        level.min(MAX_ASSIGNED_LEVEL)
    }

    fn distance_to(&self, query: &Vector, id: u32) -> f32 {
        self.metric.distance(query, &self.nodes[id as usize].vector)
    }

    fn connection_cap(&self, layer: usize) -> usize {
        if layer == 0 {
            self.m0
        } else {
            self.m
        }
    }

    /// Best-first search within one layer.
    ///
    /// Maintains a min-heap of candidates and a sorted visited list
    /// bounded to `ef`. Pops the closest candidate; stops once it is
    /// farther than the worst retained visitor. Returns the visited list
    /// sorted ascending by distance.
    fn search_layer(&self, query: &Vector, entry: u32, layer: usize, ef: usize) -> Vec<Candidate> {
        let mut candidates: BinaryHeap<Candidate> = BinaryHeap::with_capacity(ef * 2);
        let mut visited: Vec<Candidate> = Vec::with_capacity(ef + 1);
        let mut seen: HashSet<u32> = HashSet::with_capacity(ef * 2);

        let first = Candidate {
            id: entry,
            distance: self.distance_to(query, entry),
        };
        candidates.push(first);
        visited.push(first);
        seen.insert(entry);

        while let Some(current) = candidates.pop() {
            let worst = visited.last().map(|c| c.distance).unwrap_or(f32::INFINITY);
            if current.distance > worst {
                break;
            }

            for &neighbor_id in self.nodes[current.id as usize].neighbors_at(layer) {
                if !seen.insert(neighbor_id) {
                    continue;
                }
                let distance = self.distance_to(query, neighbor_id);
                let worst = visited.last().map(|c| c.distance).unwrap_or(f32::INFINITY);
                if visited.len() < ef || distance < worst {
                    let candidate = Candidate {
                        id: neighbor_id,
                        distance,
                    };
                    candidates.push(candidate);
                    let pos = visited.partition_point(|c| c.distance <= distance);
                    visited.insert(pos, candidate);
                    if visited.len() > ef {
                        visited.pop();
                    }
                }
            }
        }

        visited
    }

    /// Greedy descent from the top layer down to `target_layer + 1`,
    /// refining the entry point with width-1 searches.
    fn descend(&self, query: &Vector, mut entry: u32, from: usize, target_layer: usize) -> u32 {
        if from <= target_layer {
            return entry;
        }
        for layer in (target_layer + 1..=from).rev() {
            if let Some(best) = self.search_layer(query, entry, layer, 1).first() {
                entry = best.id;
            }
        }
        entry
    }

    /// Re-scores a node's adjacency list and keeps the `cap` closest.
    fn prune_neighbors(&mut self, node_id: u32, layer: usize, cap: usize) {
        if self.nodes[node_id as usize].neighbors_at(layer).len() <= cap {
            return;
        }
        let mut scored: Vec<(u32, f32)> = {
            let node = &self.nodes[node_id as usize];
            node.neighbors_at(layer)
                .iter()
                .map(|&other| {
                    (
                        other,
                        self.metric
                            .distance(&node.vector, &self.nodes[other as usize].vector),
                    )
                })
                .collect()
        };
        scored.sort_by(|a, b| a.1.total_cmp(&b.1));
        scored.truncate(cap);
        self.nodes[node_id as usize].neighbors[layer] =
            scored.into_iter().map(|(id, _)| id).collect();
    }
}

impl VectorIndex for HnswIndex {
    fn insert(&mut self, key: &str, vector: &Vector) {
        let level = self.random_level();
        let new_id = self.nodes.len() as u32;

        // First node becomes the entry point outright.
        if self.nodes.is_empty() {
            self.nodes.push(HnswNode {
                key: key.to_string(),
                vector: vector.clone(),
                level,
                neighbors: vec![NeighborList::new(); level + 1],
            });
            self.entry_point = Some(new_id);
            self.max_level = level;
            return;
        }

        let entry = self.entry_point.expect("non-empty graph has an entry point");
        let mut ep = self.descend(vector, entry, self.max_level, level);

        // Immutable pass: collect the selected neighbors per layer while
        // propagating the refined entry point downwards.
        let top = level.min(self.max_level);
        let mut selected_per_layer: Vec<(usize, Vec<u32>)> = Vec::with_capacity(top + 1);
        for layer in (0..=top).rev() {
            let frontier = self.search_layer(vector, ep, layer, self.ef_construction);
            if let Some(best) = frontier.first() {
                ep = best.id;
            }
            let cap = self.connection_cap(layer);
            // Frontier is sorted ascending: simple distance-greedy
            // selection takes the closest `cap`.
            let selected: Vec<u32> = frontier.iter().take(cap).map(|c| c.id).collect();
            selected_per_layer.push((layer, selected));
        }

        self.nodes.push(HnswNode {
            key: key.to_string(),
            vector: vector.clone(),
            level,
            neighbors: vec![NeighborList::new(); level + 1],
        });

        // Mutable pass: symmetric edges plus reverse-list pruning.
        for (layer, selected) in selected_per_layer {
            let cap = self.connection_cap(layer);
            for &neighbor_id in &selected {
                if !self.nodes[new_id as usize].neighbors[layer].contains(&neighbor_id) {
                    self.nodes[new_id as usize].neighbors[layer].push(neighbor_id);
                }
                let reverse = &mut self.nodes[neighbor_id as usize].neighbors[layer];
                if !reverse.contains(&new_id) {
                    reverse.push(new_id);
                }
                self.prune_neighbors(neighbor_id, layer, cap);
            }
        }

        if level > self.max_level {
            self.max_level = level;
            self.entry_point = Some(new_id);
        }
    }

    fn search(&self, query: &Vector, k: usize) -> Vec<(String, f32)> {
        if k == 0 {
            return Vec::new();
        }
        let Some(entry) = self.entry_point else {
            return Vec::new();
        };

        let ep = self.descend(query, entry, self.max_level, 0);
        let ef = self.ef_search.max(k);
        let frontier = self.search_layer(query, ep, 0, ef);

        frontier
            .into_iter()
            .take(k)
            .map(|c| (self.nodes[c.id as usize].key.clone(), c.distance))
            .collect()
    }

    fn len(&self) -> usize {
        self.nodes.len()
    }

    fn clear(&mut self) {
        self.nodes.clear();
        self.entry_point = None;
        self.max_level = 0;
    }

    fn reset_metric(&mut self, metric: DistanceMetric) {
        self.metric = metric;
        // Graph edges were chosen under the old metric; start over.
        let seed = self.seed;
        self.rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_os_rng(),
        };
        self.clear();
    }
}

impl std::fmt::Debug for HnswIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HnswIndex")
            .field("dimension", &self.dimension)
            .field("len", &self.nodes.len())
            .field("max_level", &self.max_level)
            .field("m", &self.m)
            .field("ef_construction", &self.ef_construction)
            .field("ef_search", &self.ef_search)
            .field("metric", &self.metric)
            .finish()
    }
}
