//! Exact nearest-neighbor search via a binary space-partitioning tree.
//!
//! At depth `d` the split dimension is `d mod D`; the splitting value is
//! the inserted vector's component at that dimension. There is no median
//! rebalancing; the tree degrades gracefully under random input.
//!
//! k-NN is k sequential 1-NN calls over a per-call exclusion set: each
//! found key joins the set before the next pass, and the set simply goes
//! out of scope afterwards. This keeps the 1-NN descent trivially correct.

use std::collections::HashSet;

use crate::index::VectorIndex;
use crate::metric::DistanceMetric;
use crate::types::Vector;

struct Node {
    vector: Vector,
    key: String,
    split_dimension: usize,
    left: Option<Box<Node>>,
    right: Option<Box<Node>>,
}

/// Exact nearest-neighbor index.
pub struct KdTree {
    root: Option<Box<Node>>,
    dimension: usize,
    metric: DistanceMetric,
    len: usize,
}

impl KdTree {
    /// Creates an empty tree for vectors of the given dimension.
    pub fn new(dimension: usize, metric: DistanceMetric) -> Self {
        Self {
            root: None,
            dimension,
            metric,
            len: 0,
        }
    }

    /// Finds the single nearest entry whose key is not in `excluded`.
    ///
    /// Returns `None` on an empty tree or when every entry is excluded.
    pub fn nearest_excluding(
        &self,
        query: &Vector,
        excluded: &HashSet<&str>,
    ) -> Option<(String, f32)> {
        let mut best: Option<(&str, f32)> = None;
        Self::nearest_recursive(self.root.as_deref(), query, self.metric, excluded, &mut best);
        best.map(|(k, d)| (k.to_string(), d))
    }

    fn nearest_recursive<'a>(
        node: Option<&'a Node>,
        query: &Vector,
        metric: DistanceMetric,
        excluded: &HashSet<&str>,
        best: &mut Option<(&'a str, f32)>,
    ) {
        let Some(node) = node else {
            return;
        };

        if !excluded.contains(node.key.as_str()) {
            let distance = metric.distance(query, &node.vector);
            let improves = match best {
                Some((_, best_distance)) => distance < *best_distance,
                None => true,
            };
            if improves {
                *best = Some((node.key.as_str(), distance));
            }
        }

        let dim = node.split_dimension;
        let delta = query[dim] - node.vector[dim];
        let (near, far) = if delta < 0.0 {
            (node.left.as_deref(), node.right.as_deref())
        } else {
            (node.right.as_deref(), node.left.as_deref())
        };

        Self::nearest_recursive(near, query, metric, excluded, best);

        if Self::far_side_viable(metric, delta, best.map(|(_, d)| d)) {
            Self::nearest_recursive(far, query, metric, excluded, best);
        }
    }

    /// Whether the far child can still hold a closer entry.
    ///
    /// The splitting-plane bound only holds for metrics where per-axis
    /// displacement lower-bounds the distance; cosine admits no such
    /// bound, so both subtrees are always visited (exact, O(N)).
    fn far_side_viable(metric: DistanceMetric, delta: f32, best: Option<f32>) -> bool {
        let Some(best) = best else {
            return true;
        };
        match metric {
            DistanceMetric::Euclidean => delta * delta < best * best,
            DistanceMetric::Manhattan => delta.abs() < best,
            DistanceMetric::Cosine => true,
        }
    }

    fn insert_recursive(node: &mut Option<Box<Node>>, vector: &Vector, key: &str, depth: usize, dimension: usize) {
        match node {
            None => {
                *node = Some(Box::new(Node {
                    vector: vector.clone(),
                    key: key.to_string(),
                    split_dimension: depth % dimension,
                    left: None,
                    right: None,
                }));
            }
            Some(n) => {
                let dim = depth % dimension;
                if vector[dim] < n.vector[dim] {
                    Self::insert_recursive(&mut n.left, vector, key, depth + 1, dimension);
                } else {
                    Self::insert_recursive(&mut n.right, vector, key, depth + 1, dimension);
                }
            }
        }
    }
}

impl VectorIndex for KdTree {
    fn insert(&mut self, key: &str, vector: &Vector) {
        Self::insert_recursive(&mut self.root, vector, key, 0, self.dimension);
        self.len += 1;
    }

    fn search(&self, query: &Vector, k: usize) -> Vec<(String, f32)> {
        if k == 0 {
            return Vec::new();
        }
        let mut results: Vec<(String, f32)> = Vec::with_capacity(k.min(self.len));
        let mut excluded_owned: Vec<String> = Vec::with_capacity(k);
        for _ in 0..k.min(self.len) {
            let excluded: HashSet<&str> = excluded_owned.iter().map(|s| s.as_str()).collect();
            match self.nearest_excluding(query, &excluded) {
                Some((key, dist)) => {
                    excluded_owned.push(key.clone());
                    results.push((key, dist));
                }
                None => break,
            }
        }
        results
    }

    fn len(&self) -> usize {
        self.len
    }

    fn clear(&mut self) {
        self.root = None;
        self.len = 0;
    }

    fn reset_metric(&mut self, metric: DistanceMetric) {
        self.metric = metric;
        self.clear();
    }
}

impl std::fmt::Debug for KdTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KdTree")
            .field("dimension", &self.dimension)
            .field("metric", &self.metric)
            .field("len", &self.len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(xs: &[f32]) -> Vector {
        Vector::from(xs.to_vec())
    }

    fn tree_with(points: &[(&str, &[f32])]) -> KdTree {
        let mut tree = KdTree::new(points[0].1.len(), DistanceMetric::Euclidean);
        for (key, xs) in points {
            tree.insert(key, &v(xs));
        }
        tree
    }

    #[test]
    fn test_empty_tree_searches_empty() {
        let tree = KdTree::new(3, DistanceMetric::Euclidean);
        assert!(tree.search(&v(&[0.0, 0.0, 0.0]), 5).is_empty());
        assert!(tree
            .nearest_excluding(&v(&[0.0, 0.0, 0.0]), &HashSet::new())
            .is_none());
    }

    #[test]
    fn test_single_nearest() {
        let tree = tree_with(&[
            ("a", &[0.0, 0.0]),
            ("b", &[1.0, 0.0]),
            ("c", &[3.0, 0.0]),
        ]);
        let (key, dist) = tree
            .nearest_excluding(&v(&[0.9, 0.0]), &HashSet::new())
            .unwrap();
        assert_eq!(key, "b");
        assert!((dist - 0.1).abs() < 1e-4);
    }

    #[test]
    fn test_knn_orders_by_distance() {
        let tree = tree_with(&[
            ("a", &[0.0, 0.0]),
            ("b", &[1.0, 0.0]),
            ("c", &[3.0, 0.0]),
            ("d", &[-2.0, 0.0]),
        ]);
        let results = tree.search(&v(&[0.9, 0.0]), 3);
        let keys: Vec<&str> = results.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["b", "a", "c"]);
        for w in results.windows(2) {
            assert!(w[0].1 <= w[1].1);
        }
    }

    #[test]
    fn test_knn_caps_at_tree_size() {
        let tree = tree_with(&[("a", &[0.0, 0.0]), ("b", &[1.0, 1.0])]);
        assert_eq!(tree.search(&v(&[0.0, 0.0]), 10).len(), 2);
    }

    #[test]
    fn test_k_zero_is_empty() {
        let tree = tree_with(&[("a", &[0.0, 0.0])]);
        assert!(tree.search(&v(&[0.0, 0.0]), 0).is_empty());
    }

    #[test]
    fn test_exclusion_skips_keys() {
        let tree = tree_with(&[("a", &[0.0, 0.0]), ("b", &[1.0, 0.0])]);
        let mut excluded = HashSet::new();
        excluded.insert("a");
        let (key, _) = tree
            .nearest_excluding(&v(&[0.1, 0.0]), &excluded)
            .unwrap();
        assert_eq!(key, "b");
    }

    #[test]
    fn test_exact_against_brute_force() {
        // Deterministic scattered points; verify the prune never drops
        // the true nearest neighbor.
        let dim = 4;
        let points: Vec<(String, Vector)> = (0..60)
            .map(|i| {
                let xs: Vec<f32> = (0..dim)
                    .map(|j| ((i * 31 + j * 17) % 13) as f32 - 6.0)
                    .collect();
                (format!("p{i}"), Vector::from(xs))
            })
            .collect();

        let mut tree = KdTree::new(dim, DistanceMetric::Euclidean);
        for (key, vec) in &points {
            tree.insert(key, vec);
        }

        let query = v(&[0.5, -1.5, 2.0, 0.0]);
        let got = tree.search(&query, 5);

        let mut brute: Vec<(String, f32)> = points
            .iter()
            .map(|(k, p)| (k.clone(), DistanceMetric::Euclidean.distance(&query, p)))
            .collect();
        brute.sort_by(|a, b| a.1.total_cmp(&b.1));
        brute.truncate(5);

        let got_dists: Vec<f32> = got.iter().map(|(_, d)| *d).collect();
        let brute_dists: Vec<f32> = brute.iter().map(|(_, d)| *d).collect();
        for (g, b) in got_dists.iter().zip(brute_dists.iter()) {
            assert!((g - b).abs() < 1e-4, "kd {got_dists:?} vs brute {brute_dists:?}");
        }
    }

    #[test]
    fn test_manhattan_metric_exact() {
        let mut tree = KdTree::new(2, DistanceMetric::Manhattan);
        tree.insert("a", &v(&[0.0, 0.0]));
        tree.insert("b", &v(&[2.0, 2.0]));
        tree.insert("c", &v(&[-1.0, 1.0]));
        let results = tree.search(&v(&[1.5, 1.5]), 1);
        assert_eq!(results[0].0, "b");
        assert!((results[0].1 - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_metric_visits_everything() {
        let mut tree = KdTree::new(2, DistanceMetric::Cosine);
        tree.insert("x", &v(&[1.0, 0.0]));
        tree.insert("y", &v(&[0.0, 1.0]));
        tree.insert("xy", &v(&[1.0, 1.0]));
        let results = tree.search(&v(&[2.0, 2.1]), 1);
        assert_eq!(results[0].0, "xy");
    }

    #[test]
    fn test_reset_metric_clears() {
        let mut tree = tree_with(&[("a", &[0.0, 0.0])]);
        tree.reset_metric(DistanceMetric::Cosine);
        assert!(tree.is_empty());
    }
}
