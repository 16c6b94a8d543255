//! # Percentile Estimation From Bucket Counts
//!
//! Estimates quantiles of a latency distribution using only the bucket counts
//! of a [`BucketScheme`]. Exact latency values are not recoverable, so every
//! answer is a bucket boundary or, when the requested rank lands exactly on
//! the edge between two buckets, the midpoint of the two boundaries.
//!
//! Quantiles are rational numbers ([`Quantile`]) rather than floats: the
//! target rank and the "rank lands exactly on an edge" test are computed in
//! integer arithmetic, so `99.9%` of 1000 samples is exactly rank 999.

use crate::buckets::BucketScheme;
use crate::error::{LoadtestError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A quantile strictly between 0 and 1, stored as a reduced fraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "QuantileRepr", into = "QuantileRepr")]
pub struct Quantile {
    numerator: u64,
    denominator: u64,
}

#[derive(Serialize, Deserialize)]
struct QuantileRepr {
    numerator: u64,
    denominator: u64,
}

impl Quantile {
    /// Median.
    pub const P50: Quantile = Quantile {
        numerator: 1,
        denominator: 2,
    };
    pub const P99: Quantile = Quantile {
        numerator: 99,
        denominator: 100,
    };
    pub const P999: Quantile = Quantile {
        numerator: 999,
        denominator: 1000,
    };

    /// Build `numerator / denominator`, which must lie strictly between 0 and 1.
    pub fn new(numerator: u64, denominator: u64) -> Result<Self> {
        if denominator == 0 || numerator == 0 || numerator >= denominator {
            return Err(LoadtestError::invalid(format!(
                "quantile {}/{} must lie strictly between 0 and 1",
                numerator, denominator
            )));
        }
        let divisor = gcd(numerator, denominator);
        Ok(Self {
            numerator: numerator / divisor,
            denominator: denominator / divisor,
        })
    }

    pub fn numerator(&self) -> u64 {
        self.numerator
    }

    pub fn denominator(&self) -> u64 {
        self.denominator
    }

    pub fn as_f64(&self) -> f64 {
        self.numerator as f64 / self.denominator as f64
    }

    /// The quantile expressed as a percentage, e.g. `99.9`.
    pub fn as_percent(&self) -> f64 {
        self.numerator as f64 * 100.0 / self.denominator as f64
    }
}

impl TryFrom<QuantileRepr> for Quantile {
    type Error = LoadtestError;

    fn try_from(repr: QuantileRepr) -> Result<Self> {
        Quantile::new(repr.numerator, repr.denominator)
    }
}

impl From<Quantile> for QuantileRepr {
    fn from(quantile: Quantile) -> Self {
        Self {
            numerator: quantile.numerator,
            denominator: quantile.denominator,
        }
    }
}

/// Parses a percentage such as `"50"`, `"99.9"` or `"99.99%"` exactly.
impl FromStr for Quantile {
    type Err = LoadtestError;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        let digits = trimmed.strip_suffix('%').unwrap_or(trimmed).trim();
        let (whole, fraction) = digits.split_once('.').unwrap_or((digits, ""));

        let malformed = || LoadtestError::invalid(format!("'{}' is not a valid percentile", s));
        if whole.is_empty() && fraction.is_empty() {
            return Err(malformed());
        }
        if !whole.chars().chain(fraction.chars()).all(|c| c.is_ascii_digit()) {
            return Err(malformed());
        }
        // Keeps 100 * 10^scale within u64.
        if fraction.len() > 15 || whole.len() > 3 {
            return Err(malformed());
        }

        let scale = 10u64.pow(fraction.len() as u32);
        let whole: u64 = if whole.is_empty() { 0 } else { whole.parse().map_err(|_| malformed())? };
        let fraction: u64 = if fraction.is_empty() { 0 } else { fraction.parse().map_err(|_| malformed())? };

        Quantile::new(whole * scale + fraction, 100 * scale)
    }
}

/// Formats as a percentage without the sign, e.g. `99.9`.
impl fmt::Display for Quantile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_percent())
    }
}

fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        let r = a % b;
        a = b;
        b = r;
    }
    a
}

/// A quantile together with its estimated latency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PercentileValue {
    pub quantile: Quantile,
    pub percentile: f64,
    pub value_ms: f64,
}

/// Estimate `quantile` of the distribution described by `bucket_counts`.
///
/// The buckets are walked from the highest index down, removing each bucket's
/// samples from the running total. The answer is the first bucket at which at
/// most `floor(total * q)` samples remain below it; if exactly that many
/// remain and `total * q` has no fractional part, the rank sits on the edge
/// between two buckets and their midpoint is returned instead.
///
/// An empty distribution yields the lowest boundary. A count array whose
/// length differs from the scheme fails with
/// [`LoadtestError::AggregationMismatch`].
pub fn percentile(scheme: &BucketScheme, bucket_counts: &[u64], quantile: Quantile) -> Result<f64> {
    LoadtestError::check_len(scheme.len(), bucket_counts.len())?;

    let total: u128 = bucket_counts.iter().map(|&count| u128::from(count)).sum();
    if total == 0 {
        return Ok(scheme.lowest());
    }

    let scaled = total
        .checked_mul(u128::from(quantile.numerator))
        .ok_or_else(|| {
            LoadtestError::invalid(format!(
                "quantile {}/{} is too fine for {} samples",
                quantile.numerator, quantile.denominator, total
            ))
        })?;
    let denominator = u128::from(quantile.denominator);
    let target = scaled / denominator;
    let evenly_divisible = scaled % denominator == 0;

    let mut remaining = total;
    for index in (0..bucket_counts.len()).rev() {
        remaining -= u128::from(bucket_counts[index]);
        if evenly_divisible && remaining == target && index > 0 {
            return Ok((scheme.boundary(index) + scheme.boundary(index - 1)) / 2.0);
        }
        if remaining <= target {
            return Ok(scheme.boundary(index));
        }
    }

    Ok(scheme.lowest())
}

/// Evaluate several quantiles over the same bucket counts.
pub fn percentiles(
    scheme: &BucketScheme,
    bucket_counts: &[u64],
    quantiles: &[Quantile],
) -> Result<Vec<PercentileValue>> {
    quantiles
        .iter()
        .map(|&quantile| {
            Ok(PercentileValue {
                quantile,
                percentile: quantile.as_percent(),
                value_ms: percentile(scheme, bucket_counts, quantile)?,
            })
        })
        .collect()
}
