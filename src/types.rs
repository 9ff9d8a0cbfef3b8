//! Core value types: the fixed-dimension [`Vector`] and search results.
//!
//! A `Vector` is an ordered sequence of `f32` whose length is fixed for
//! the lifetime of a database. Equality is elementwise and hashing is
//! order-sensitive over the raw bit patterns, which lets vectors act as
//! query-cache keys.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::Index;

/// A fixed-length sequence of `f32` components.
///
/// Vectors are the unit of storage and search. The database validates
/// length and finiteness on every write path, so stored vectors never
/// contain NaN and `Eq` behaves reflexively for them.
///
/// # Example
/// ```rust
/// use vexdb::Vector;
///
/// let v = Vector::from(vec![1.0, 0.0, 0.0]);
/// assert_eq!(v.len(), 3);
/// assert_eq!(v[0], 1.0);
/// assert_eq!(v.get(7), None);
/// ```
#[derive(Clone, Debug, Default)]
pub struct Vector {
    data: Vec<f32>,
}

impl Vector {
    /// Creates a zero vector of the given length.
    pub fn zeros(len: usize) -> Self {
        Self {
            data: vec![0.0; len],
        }
    }

    /// Returns the number of components.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true if the vector has no components.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Bounds-checked component access.
    #[inline]
    pub fn get(&self, index: usize) -> Option<f32> {
        self.data.get(index).copied()
    }

    /// Contiguous read access for distance kernels.
    #[inline]
    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    /// Consumes the vector, returning the underlying buffer.
    pub fn into_inner(self) -> Vec<f32> {
        self.data
    }

    /// Returns the index of the first non-finite component, if any.
    ///
    /// Used by the write paths to reject NaN/infinite inputs before any
    /// side effect occurs.
    pub fn first_non_finite(&self) -> Option<usize> {
        self.data.iter().position(|x| !x.is_finite())
    }

    /// Dot product of two vectors.
    ///
    /// This is the seam where an accelerated (SIMD/GPU) kernel would plug
    /// in; the fallback is the plain elementwise loop. Mismatched lengths
    /// yield 0.0 over the common prefix of length `min(a, b)`.
    #[inline]
    pub fn dot_product(a: &Vector, b: &Vector) -> f32 {
        crate::metric::dot(a.as_slice(), b.as_slice())
    }
}

impl From<Vec<f32>> for Vector {
    fn from(data: Vec<f32>) -> Self {
        Self { data }
    }
}

impl From<&[f32]> for Vector {
    fn from(data: &[f32]) -> Self {
        Self {
            data: data.to_vec(),
        }
    }
}

impl Index<usize> for Vector {
    type Output = f32;

    #[inline]
    fn index(&self, index: usize) -> &f32 {
        &self.data[index]
    }
}

impl PartialEq for Vector {
    fn eq(&self, other: &Self) -> bool {
        self.data.len() == other.data.len()
            && self
                .data
                .iter()
                .zip(other.data.iter())
                .all(|(a, b)| a.to_bits() == b.to_bits())
    }
}

// Stored vectors are validated finite, so bitwise equality is reflexive
// for every vector that can act as a cache key.
impl Eq for Vector {}

impl Hash for Vector {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.data.len().hash(state);
        for x in &self.data {
            x.to_bits().hash(state);
        }
    }
}

impl fmt::Display for Vector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, x) in self.data.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{x}")?;
        }
        write!(f, "]")
    }
}

/// A single row of a metadata-joined similarity search.
///
/// `metadata` is the empty string when the key has none.
#[derive(Clone, Debug, PartialEq)]
pub struct SearchResult {
    /// Key of the matched entry.
    pub key: String,
    /// Distance from the query under the active metric.
    pub distance: f32,
    /// Metadata attached to the key, or empty.
    pub metadata: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_zeros_and_len() {
        let v = Vector::zeros(4);
        assert_eq!(v.len(), 4);
        assert!(!v.is_empty());
        assert_eq!(v.as_slice(), &[0.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_bounds_checked_get() {
        let v = Vector::from(vec![1.0, 2.0]);
        assert_eq!(v.get(1), Some(2.0));
        assert_eq!(v.get(2), None);
    }

    #[test]
    #[should_panic]
    fn test_index_out_of_range_panics() {
        let v = Vector::from(vec![1.0]);
        let _ = v[3];
    }

    #[test]
    fn test_equality_is_elementwise() {
        let a = Vector::from(vec![1.0, 2.0, 3.0]);
        let b = Vector::from(vec![1.0, 2.0, 3.0]);
        let c = Vector::from(vec![3.0, 2.0, 1.0]);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, Vector::from(vec![1.0, 2.0]));
    }

    #[test]
    fn test_hash_usable_as_map_key() {
        let mut map: HashMap<Vector, &str> = HashMap::new();
        map.insert(Vector::from(vec![0.5, 0.5]), "hit");
        assert_eq!(map.get(&Vector::from(vec![0.5, 0.5])), Some(&"hit"));
        assert_eq!(map.get(&Vector::from(vec![0.5, 0.6])), None);
    }

    #[test]
    fn test_first_non_finite() {
        let ok = Vector::from(vec![1.0, -2.0]);
        assert_eq!(ok.first_non_finite(), None);

        let nan = Vector::from(vec![1.0, f32::NAN, 3.0]);
        assert_eq!(nan.first_non_finite(), Some(1));

        let inf = Vector::from(vec![f32::INFINITY]);
        assert_eq!(inf.first_non_finite(), Some(0));
    }

    #[test]
    fn test_dot_product() {
        let a = Vector::from(vec![1.0, 2.0, 3.0]);
        let b = Vector::from(vec![4.0, 5.0, 6.0]);
        assert_eq!(Vector::dot_product(&a, &b), 32.0);
    }

    #[test]
    fn test_negative_zero_distinct_from_zero() {
        // Bit-pattern equality: -0.0 and 0.0 hash and compare differently,
        // which keeps the cache key total.
        let pos = Vector::from(vec![0.0]);
        let neg = Vector::from(vec![-0.0]);
        assert_ne!(pos, neg);
    }
}
