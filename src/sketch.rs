//! HyperLogLog++ cardinality sketches
//!
//! Shards keep two sketches per catalog dimension (one counting insertions,
//! one counting tombstones); the store merges them across a database's
//! shards and reports `items - tombstones`. Sketches with the same
//! precision merge losslessly, which is what makes the estimates
//! combinable across replicas of the same data.

use crate::error::{Error, Result};
use std::hash::{Hash, Hasher};

/// Register index bits. 2^14 registers gives a standard error of ~0.8%.
const PRECISION: u8 = 14;

/// A dense HyperLogLog++ estimator over byte strings.
#[derive(Debug, Clone)]
pub struct Sketch {
    precision: u8,
    registers: Vec<u8>,
}

impl Default for Sketch {
    fn default() -> Self {
        Self::new()
    }
}

impl Sketch {
    /// An empty sketch of the default precision.
    pub fn new() -> Self {
        Self::with_precision(PRECISION)
    }

    /// An empty sketch with `precision` index bits (4..=16).
    pub fn with_precision(precision: u8) -> Self {
        let precision = precision.clamp(4, 16);
        Self {
            precision,
            registers: vec![0u8; 1 << precision],
        }
    }

    /// Observe a value.
    pub fn insert(&mut self, value: &[u8]) {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        value.hash(&mut hasher);
        let hash = hasher.finish();

        let idx = (hash >> (64 - self.precision)) as usize;
        // Position of the first set bit in the remaining hash bits.
        let rest = hash << self.precision;
        let rho = if rest == 0 {
            64 - self.precision + 1
        } else {
            rest.leading_zeros() as u8 + 1
        };
        if rho > self.registers[idx] {
            self.registers[idx] = rho;
        }
    }

    /// Estimated number of distinct values observed.
    pub fn count(&self) -> u64 {
        let m = self.registers.len() as f64;
        let mut sum = 0.0;
        let mut zeros = 0u64;
        for &r in &self.registers {
            sum += 1.0 / ((1u64 << r) as f64);
            if r == 0 {
                zeros += 1;
            }
        }

        let alpha = match self.registers.len() {
            16 => 0.673,
            32 => 0.697,
            64 => 0.709,
            m => 0.7213 / (1.0 + 1.079 / m as f64),
        };
        let raw = alpha * m * m / sum;

        // Linear counting handles the low range better than the raw
        // estimator.
        let estimate = if raw <= 2.5 * m && zeros > 0 {
            m * (m / zeros as f64).ln()
        } else {
            raw
        };
        estimate.round() as u64
    }

    /// True when nothing has been observed.
    pub fn is_empty(&self) -> bool {
        self.registers.iter().all(|&r| r == 0)
    }

    /// Fold another sketch into this one. Fails when precisions differ.
    pub fn merge(&mut self, other: &Sketch) -> Result<()> {
        if self.precision != other.precision {
            return Err(Error::SketchMerge(format!(
                "precision mismatch: {} vs {}",
                self.precision, other.precision
            )));
        }
        for (r, &o) in self.registers.iter_mut().zip(&other.registers) {
            if o > *r {
                *r = o;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_counts_zero() {
        let s = Sketch::new();
        assert!(s.is_empty());
        assert_eq!(s.count(), 0);
    }

    #[test]
    fn small_counts_are_exact() {
        let mut s = Sketch::new();
        for i in 0..100u32 {
            s.insert(format!("series-{i}").as_bytes());
        }
        assert_eq!(s.count(), 100);
    }

    #[test]
    fn duplicates_are_not_double_counted() {
        let mut s = Sketch::new();
        for _ in 0..3 {
            for i in 0..500u32 {
                s.insert(format!("key-{i}").as_bytes());
            }
        }
        let count = s.count();
        assert!((495..=505).contains(&count), "got {count}");
    }

    #[test]
    fn large_counts_within_two_percent() {
        let mut s = Sketch::new();
        let n = 200_000u64;
        for i in 0..n {
            s.insert(format!("cpu,host=h{i},region=r{}", i % 7).as_bytes());
        }
        let count = s.count() as f64;
        let err = (count - n as f64).abs() / n as f64;
        assert!(err < 0.02, "estimate {count} off by {err}");
    }

    #[test]
    fn merge_matches_union() {
        let mut a = Sketch::new();
        let mut b = Sketch::new();
        for i in 0..1000u32 {
            a.insert(format!("a-{i}").as_bytes());
        }
        for i in 0..1000u32 {
            b.insert(format!("b-{i}").as_bytes());
        }
        a.merge(&b).unwrap();
        let count = a.count();
        assert!((1960..=2040).contains(&count), "got {count}");
    }

    #[test]
    fn merge_of_identical_sets_is_idempotent() {
        let mut a = Sketch::new();
        let mut b = Sketch::new();
        for i in 0..1000u32 {
            a.insert(format!("x-{i}").as_bytes());
            b.insert(format!("x-{i}").as_bytes());
        }
        let before = a.count();
        a.merge(&b).unwrap();
        assert_eq!(a.count(), before);
    }

    #[test]
    fn merge_rejects_mismatched_precision() {
        let mut a = Sketch::with_precision(12);
        let b = Sketch::with_precision(14);
        assert!(a.merge(&b).is_err());
    }
}
