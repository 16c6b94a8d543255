//! # Latency Bucket Scheme
//!
//! The fixed set of boundaries, in milliseconds, that every latency histogram
//! shares. Boundaries are fine-grained at the low end (single milliseconds up
//! to a few hundred) and coarse for outliers, ending with a sentinel equal to
//! the largest 32-bit signed integer.
//!
//! Bucket `i` covers `[boundary[i], boundary[i + 1])`. Values below the first
//! boundary are counted in bucket 0 and values at or above the last boundary
//! land in the final, overflow bucket. Percentile estimates are therefore
//! expressed as bucket boundaries, never as recovered sample values.

use crate::error::{LoadtestError, Result};

/// Standard latency boundaries in milliseconds.
pub const LATENCY_BUCKETS_MS: [f64; 24] = [
    0.0,
    1.0,
    5.0,
    10.0,
    20.0,
    40.0,
    60.0,
    80.0,
    100.0,
    150.0,
    200.0,
    500.0,
    1_000.0,
    2_000.0,
    3_000.0,
    10_000.0,
    20_000.0,
    100_000.0,
    400_000.0,
    1_000_000.0,
    10_000_000.0,
    100_000_000.0,
    1_000_000_000.0,
    i32::MAX as f64,
];

/// The process-wide bucket scheme used by the load test.
pub static STANDARD: BucketScheme = BucketScheme::standard();

/// An immutable, ordered set of bucket boundaries.
///
/// The scheme borrows a `'static` slice so that it can be copied freely into
/// every histogram without allocation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketScheme {
    boundaries: &'static [f64],
}

impl BucketScheme {
    /// The standard scheme built from [`LATENCY_BUCKETS_MS`].
    pub const fn standard() -> Self {
        Self {
            boundaries: &LATENCY_BUCKETS_MS,
        }
    }

    /// Build a scheme from custom boundaries.
    ///
    /// Boundaries must be finite, non-negative, non-decreasing and there must
    /// be at least two of them.
    pub fn new(boundaries: &'static [f64]) -> Result<Self> {
        if boundaries.len() < 2 {
            return Err(LoadtestError::invalid(format!(
                "a bucket scheme needs at least 2 boundaries, got {}",
                boundaries.len()
            )));
        }
        if let Some(bad) = boundaries.iter().find(|b| !b.is_finite() || **b < 0.0) {
            return Err(LoadtestError::invalid(format!(
                "bucket boundary {} is not a finite non-negative value",
                bad
            )));
        }
        if let Some(pos) = boundaries.windows(2).position(|w| w[1] < w[0]) {
            return Err(LoadtestError::invalid(format!(
                "bucket boundaries must be non-decreasing ({} follows {} at index {})",
                boundaries[pos + 1],
                boundaries[pos],
                pos + 1
            )));
        }
        Ok(Self { boundaries })
    }

    /// Number of buckets (equal to the number of boundaries).
    pub fn len(&self) -> usize {
        self.boundaries.len()
    }

    /// Always false; a valid scheme holds at least two boundaries.
    pub fn is_empty(&self) -> bool {
        self.boundaries.is_empty()
    }

    pub fn boundaries(&self) -> &'static [f64] {
        self.boundaries
    }

    /// Boundary at `index`. Panics when out of range, like slice indexing.
    pub fn boundary(&self, index: usize) -> f64 {
        self.boundaries[index]
    }

    pub fn lowest(&self) -> f64 {
        self.boundaries[0]
    }

    pub fn highest(&self) -> f64 {
        self.boundaries[self.boundaries.len() - 1]
    }

    /// Index of the bucket a latency value (ms) belongs to.
    ///
    /// Returns the last bucket whose boundary is `<= value_ms`, falling back
    /// to bucket 0 for values below the first boundary. Values at or above the
    /// last boundary map to the overflow bucket.
    pub fn bucket_index(&self, value_ms: f64) -> usize {
        self.boundaries
            .partition_point(|&boundary| boundary <= value_ms)
            .saturating_sub(1)
    }
}

impl Default for BucketScheme {
    fn default() -> Self {
        Self::standard()
    }
}
