//! # Histogram Aggregation
//!
//! Combines histogram snapshots from many reporting units into one logical
//! distribution per grouping key (the driver groups by client type). Merging
//! is an element-wise sum of bucket counts plus a sum of sample counts, so it
//! is commutative and associative and the result does not depend on the order
//! in which units report.
//!
//! Snapshots may have been taken at slightly different moments; no time
//! alignment is attempted. The merged mean and variance are not reconstructed,
//! only bucket-derived percentiles are reported for a group.

use crate::buckets::BucketScheme;
use crate::error::{LoadtestError, Result};
use crate::histogram::HistogramSnapshot;
use crate::percentile::{self, PercentileValue, Quantile};
use std::borrow::Borrow;
use std::collections::BTreeMap;

/// Bucket counts summed over several reporting units.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregatedHistogram {
    scheme: BucketScheme,
    bucket_counts: Vec<u64>,
    count: u64,
    units: usize,
}

impl AggregatedHistogram {
    /// An empty aggregate with no contributing units.
    pub fn new(scheme: BucketScheme) -> Self {
        Self {
            scheme,
            bucket_counts: vec![0; scheme.len()],
            count: 0,
            units: 0,
        }
    }

    /// Add one unit's snapshot.
    pub fn absorb(&mut self, snapshot: &HistogramSnapshot) -> Result<()> {
        LoadtestError::check_len(self.bucket_counts.len(), snapshot.bucket_counts.len())?;
        self.add(&snapshot.bucket_counts, snapshot.count, 1)
    }

    /// Fold another aggregate into this one.
    pub fn merge(&mut self, other: &AggregatedHistogram) -> Result<()> {
        LoadtestError::check_len(self.bucket_counts.len(), other.bucket_counts.len())?;
        self.add(&other.bucket_counts, other.count, other.units)
    }

    // All sums are computed before any field changes, so an overflow leaves
    // the aggregate as it was.
    fn add(&mut self, bucket_counts: &[u64], count: u64, units: usize) -> Result<()> {
        let summed = self
            .bucket_counts
            .iter()
            .zip(bucket_counts)
            .enumerate()
            .map(|(bucket, (&sum, &added))| {
                sum.checked_add(added)
                    .ok_or_else(|| LoadtestError::overflow(format!("bucket {} count", bucket)))
            })
            .collect::<Result<Vec<u64>>>()?;
        let count = self
            .count
            .checked_add(count)
            .ok_or_else(|| LoadtestError::overflow("sample count"))?;
        let units = self
            .units
            .checked_add(units)
            .ok_or_else(|| LoadtestError::overflow("unit count"))?;

        self.bucket_counts = summed;
        self.count = count;
        self.units = units;
        Ok(())
    }

    pub fn scheme(&self) -> BucketScheme {
        self.scheme
    }

    pub fn bucket_counts(&self) -> &[u64] {
        &self.bucket_counts
    }

    /// Sum of the units' reported sample counts.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Sum of the bucket counts.
    pub fn total(&self) -> u64 {
        self.bucket_counts
            .iter()
            .fold(0u64, |total, &count| total.saturating_add(count))
    }

    /// Number of snapshots folded into this aggregate.
    pub fn units(&self) -> usize {
        self.units
    }

    pub fn percentile(&self, quantile: Quantile) -> Result<f64> {
        percentile::percentile(&self.scheme, &self.bucket_counts, quantile)
    }

    pub fn percentiles(&self, quantiles: &[Quantile]) -> Result<Vec<PercentileValue>> {
        percentile::percentiles(&self.scheme, &self.bucket_counts, quantiles)
    }
}

/// Groups snapshots by key and merges each group.
#[derive(Debug, Clone)]
pub struct Aggregator<K: Ord> {
    scheme: BucketScheme,
    groups: BTreeMap<K, AggregatedHistogram>,
}

impl<K: Ord> Aggregator<K> {
    pub fn new(scheme: BucketScheme) -> Self {
        Self {
            scheme,
            groups: BTreeMap::new(),
        }
    }

    /// Fold `snapshot` into the group for `key`, creating the group if needed.
    pub fn add(&mut self, key: K, snapshot: &HistogramSnapshot) -> Result<()> {
        // Validate before touching the map so a bad snapshot leaves no empty group.
        LoadtestError::check_len(self.scheme.len(), snapshot.bucket_counts.len())?;
        let scheme = self.scheme;
        self.groups
            .entry(key)
            .or_insert_with(|| AggregatedHistogram::new(scheme))
            .absorb(snapshot)
    }

    pub fn get(&self, key: &K) -> Option<&AggregatedHistogram> {
        self.groups.get(key)
    }

    pub fn groups(&self) -> &BTreeMap<K, AggregatedHistogram> {
        &self.groups
    }

    pub fn into_groups(self) -> BTreeMap<K, AggregatedHistogram> {
        self.groups
    }
}

/// Merge keyed snapshots into one aggregate per key.
pub fn merge<K, S, I>(scheme: BucketScheme, snapshots: I) -> Result<BTreeMap<K, AggregatedHistogram>>
where
    K: Ord,
    S: Borrow<HistogramSnapshot>,
    I: IntoIterator<Item = (K, S)>,
{
    let mut aggregator = Aggregator::new(scheme);
    for (key, snapshot) in snapshots {
        aggregator.add(key, snapshot.borrow())?;
    }
    Ok(aggregator.into_groups())
}

/// Merge snapshots that all belong to a single group.
pub fn merge_all<'a, I>(scheme: BucketScheme, snapshots: I) -> Result<AggregatedHistogram>
where
    I: IntoIterator<Item = &'a HistogramSnapshot>,
{
    let mut aggregate = AggregatedHistogram::new(scheme);
    for snapshot in snapshots {
        aggregate.absorb(snapshot)?;
    }
    Ok(aggregate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::histogram::LatencyHistogram;
    use rand::Rng;

    fn random_snapshot(samples: usize) -> HistogramSnapshot {
        let histogram = LatencyHistogram::new();
        let mut rng = rand::thread_rng();
        for _ in 0..samples {
            histogram.record(rng.gen_range(0.0..5_000.0)).unwrap();
        }
        histogram.snapshot()
    }

    #[test]
    fn test_merge_is_order_independent() {
        let scheme = BucketScheme::standard();
        let a = random_snapshot(300);
        let b = random_snapshot(50);
        let c = random_snapshot(1_000);

        let abc = merge_all(scheme, [&a, &b, &c]).unwrap();
        let cba = merge_all(scheme, [&c, &b, &a]).unwrap();

        let mut ab_then_c = merge_all(scheme, [&a, &b]).unwrap();
        ab_then_c.merge(&merge_all(scheme, [&c]).unwrap()).unwrap();

        let mut a_then_bc = merge_all(scheme, [&a]).unwrap();
        a_then_bc.merge(&merge_all(scheme, [&b, &c]).unwrap()).unwrap();

        for other in [&cba, &ab_then_c, &a_then_bc] {
            assert_eq!(abc.bucket_counts(), other.bucket_counts());
            assert_eq!(abc.count(), other.count());
            assert_eq!(abc.units(), other.units());
        }
        assert_eq!(abc.count(), 1_350);
        assert_eq!(abc.total(), 1_350);
        assert_eq!(abc.units(), 3);
    }

    #[test]
    fn test_merge_groups_by_key() {
        let scheme = BucketScheme::standard();
        let fast = LatencyHistogram::new();
        fast.record(0.5).unwrap();
        let slow = LatencyHistogram::new();
        slow.record(250.0).unwrap();

        let groups = merge(
            scheme,
            vec![
                ("publisher", fast.snapshot()),
                ("subscriber", slow.snapshot()),
                ("publisher", fast.snapshot()),
            ],
        )
        .unwrap();

        assert_eq!(groups.len(), 2);
        let publisher = &groups["publisher"];
        assert_eq!(publisher.units(), 2);
        assert_eq!(publisher.bucket_counts()[0], 2);
        assert_eq!(publisher.percentile(Quantile::P99).unwrap(), 0.0);

        let subscriber = &groups["subscriber"];
        assert_eq!(subscriber.units(), 1);
        assert_eq!(subscriber.bucket_counts()[10], 1);
        assert_eq!(subscriber.percentile(Quantile::P50).unwrap(), 200.0);
    }

    #[test]
    fn test_mismatched_lengths_fail_loudly() {
        let scheme = BucketScheme::standard();
        let mut aggregator = Aggregator::new(scheme);
        let short = HistogramSnapshot::empty(3);

        assert_eq!(
            aggregator.add("publisher", &short),
            Err(LoadtestError::AggregationMismatch {
                expected: 24,
                found: 3
            })
        );
        assert!(aggregator.get(&"publisher").is_none());

        let mut aggregate = AggregatedHistogram::new(scheme);
        let narrow = AggregatedHistogram::new(BucketScheme::new(&[0.0, 1.0]).unwrap());
        assert!(matches!(
            aggregate.merge(&narrow),
            Err(LoadtestError::AggregationMismatch { .. })
        ));
    }

    #[test]
    fn test_count_overflow_fails_loudly() {
        let scheme = BucketScheme::standard();
        let mut huge = HistogramSnapshot::empty(scheme.len());
        huge.bucket_counts[3] = u64::MAX - 1;
        huge.count = u64::MAX - 1;
        let mut small = HistogramSnapshot::empty(scheme.len());
        small.bucket_counts[3] = 5;
        small.count = 5;

        assert!(matches!(
            merge_all(scheme, [&huge, &small]),
            Err(LoadtestError::CountOverflow(_))
        ));

        // The failed absorb leaves the aggregate untouched.
        let mut aggregate = merge_all(scheme, [&huge]).unwrap();
        let before = aggregate.clone();
        assert!(matches!(
            aggregate.absorb(&small),
            Err(LoadtestError::CountOverflow(_))
        ));
        assert_eq!(aggregate, before);

        let mut other = merge_all(scheme, [&small]).unwrap();
        assert!(other.merge(&before).is_err());
        assert_eq!(other.bucket_counts()[3], 5);
        assert_eq!(other.units(), 1);

        // Only the sample count overflows.
        let mut counted = HistogramSnapshot::empty(scheme.len());
        counted.count = u64::MAX;
        let mut one = HistogramSnapshot::empty(scheme.len());
        one.count = 1;
        let mut aggregate = merge_all(scheme, [&counted]).unwrap();
        assert!(aggregate.absorb(&one).is_err());
        assert_eq!(aggregate.count(), u64::MAX);
        assert_eq!(aggregate.units(), 1);
    }

    #[test]
    fn test_empty_aggregate() {
        let aggregate = merge_all(BucketScheme::standard(), std::iter::empty()).unwrap();
        assert_eq!(aggregate.units(), 0);
        assert_eq!(aggregate.count(), 0);
        assert_eq!(aggregate.percentile(Quantile::P50).unwrap(), 0.0);
    }

    #[test]
    fn test_snapshots_of_different_ages() {
        // A unit that is still recording contributes whatever it had.
        let scheme = BucketScheme::standard();
        let histogram = LatencyHistogram::new();
        histogram.record(12.0).unwrap();
        let early = histogram.snapshot();
        histogram.record(12.0).unwrap();
        let late = histogram.snapshot();

        let aggregate = merge_all(scheme, [&early, &late]).unwrap();
        assert_eq!(aggregate.count(), 3);
        assert_eq!(aggregate.bucket_counts()[3], 3);
    }
}
