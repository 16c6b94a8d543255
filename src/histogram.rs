//! # Streaming Latency Histogram
//!
//! A memory-bounded latency distribution for one reporting unit. Samples are
//! never stored; each one updates the running mean and sum of squared
//! deviations (Welford's online algorithm) and increments the count of the
//! bucket it falls into.
//!
//! ## Concurrency
//!
//! `record` takes `&self` and may be called from many threads at once. The
//! state is split into two independently synchronized field groups:
//!
//! - the moments `(count, mean, sum_squared_deviation)` behind a
//!   `parking_lot::Mutex`
//! - the bucket counters, one `AtomicU64` each
//!
//! Neither group ever loses an increment. `record` updates the moments first
//! and the bucket second, and `snapshot` reads the buckets while holding the
//! moments lock. A snapshot taken while `record` calls are in flight may
//! therefore report a `count` ahead of the bucket sum, by at most the number of
//! threads currently recording. Once recording is quiescent the two always
//! agree.

use crate::buckets::BucketScheme;
use crate::error::{LoadtestError, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Clone, Copy, Default)]
struct Moments {
    count: u64,
    mean: f64,
    sum_squared_deviation: f64,
}

impl Moments {
    fn update(&mut self, value: f64) {
        let delta = value - self.mean;
        self.count += 1;
        self.mean += delta / self.count as f64;
        // Second factor uses the updated mean.
        self.sum_squared_deviation += delta * (value - self.mean);
    }
}

/// Thread-safe latency histogram over a fixed [`BucketScheme`].
#[derive(Debug)]
pub struct LatencyHistogram {
    scheme: BucketScheme,
    moments: Mutex<Moments>,
    buckets: Box<[AtomicU64]>,
}

impl LatencyHistogram {
    /// Create an empty histogram over the standard bucket scheme.
    pub fn new() -> Self {
        Self::with_scheme(BucketScheme::standard())
    }

    /// Create an empty histogram over a custom bucket scheme.
    pub fn with_scheme(scheme: BucketScheme) -> Self {
        let buckets = (0..scheme.len()).map(|_| AtomicU64::new(0)).collect();
        Self {
            scheme,
            moments: Mutex::new(Moments::default()),
            buckets,
        }
    }

    /// Record one latency sample, in milliseconds.
    ///
    /// Negative and NaN values are rejected with
    /// [`LoadtestError::InvalidArgument`] and leave the histogram untouched.
    pub fn record(&self, latency_ms: f64) -> Result<()> {
        if latency_ms.is_nan() || latency_ms < 0.0 {
            return Err(LoadtestError::invalid(format!(
                "latency must be a non-negative number of milliseconds, got {}",
                latency_ms
            )));
        }

        self.record_unchecked(latency_ms);
        Ok(())
    }

    /// Record a measured [`Duration`]; durations are never negative.
    pub fn record_duration(&self, latency: Duration) {
        self.record_unchecked(latency.as_secs_f64() * 1_000.0);
    }

    fn record_unchecked(&self, latency_ms: f64) {
        self.moments.lock().update(latency_ms);

        let index = self.scheme.bucket_index(latency_ms);
        self.buckets[index].fetch_add(1, Ordering::Relaxed);
    }

    /// Return the histogram to its empty state.
    ///
    /// Not ordered against concurrent `record` calls: a sample recorded while
    /// the reset runs may survive in one field group and not the other. Reset
    /// between recording phases only.
    pub fn reset(&self) {
        *self.moments.lock() = Moments::default();
        for bucket in self.buckets.iter() {
            bucket.store(0, Ordering::Relaxed);
        }
    }

    /// Take an immutable copy of the current state.
    pub fn snapshot(&self) -> HistogramSnapshot {
        // Buckets are read under the lock so no new sample can slip into them
        // without also being counted.
        let moments = self.moments.lock();
        HistogramSnapshot {
            bucket_counts: self.bucket_counts(),
            count: moments.count,
            mean: moments.mean,
            sum_squared_deviation: moments.sum_squared_deviation,
        }
    }

    pub fn scheme(&self) -> BucketScheme {
        self.scheme
    }

    pub fn count(&self) -> u64 {
        self.moments.lock().count
    }

    pub fn mean(&self) -> f64 {
        self.moments.lock().mean
    }

    pub fn sum_squared_deviation(&self) -> f64 {
        self.moments.lock().sum_squared_deviation
    }

    /// Population variance, or `None` before the first sample.
    pub fn variance(&self) -> Option<f64> {
        let moments = *self.moments.lock();
        (moments.count > 0).then(|| moments.sum_squared_deviation / moments.count as f64)
    }

    pub fn std_dev(&self) -> Option<f64> {
        self.variance().map(f64::sqrt)
    }

    /// Current bucket counts, loaded one counter at a time.
    pub fn bucket_counts(&self) -> Vec<u64> {
        self.buckets
            .iter()
            .map(|bucket| bucket.load(Ordering::Relaxed))
            .collect()
    }
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of a [`LatencyHistogram`].
///
/// Snapshots are what cross thread and process boundaries; the aggregator and
/// the percentile estimator only ever see snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistogramSnapshot {
    pub bucket_counts: Vec<u64>,
    pub count: u64,
    pub mean: f64,
    pub sum_squared_deviation: f64,
}

impl HistogramSnapshot {
    /// An all-zero snapshot with `buckets` entries.
    pub fn empty(buckets: usize) -> Self {
        Self {
            bucket_counts: vec![0; buckets],
            count: 0,
            mean: 0.0,
            sum_squared_deviation: 0.0,
        }
    }

    /// Sum of the bucket counts.
    pub fn total(&self) -> u64 {
        self.bucket_counts
            .iter()
            .fold(0u64, |total, &count| total.saturating_add(count))
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn variance(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum_squared_deviation / self.count as f64)
    }

    pub fn std_dev(&self) -> Option<f64> {
        self.variance().map(f64::sqrt)
    }
}
