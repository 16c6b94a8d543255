//! # Error Taxonomy
//!
//! Errors raised by the statistics core and by configuration validation.
//! The core (buckets, histogram, percentile estimator, aggregator) returns
//! [`LoadtestError`] directly; the application layers wrap it in
//! `anyhow::Error` with additional context.
//!
//! ## Categories
//!
//! - **InvalidArgument**: a single value is out of its legal domain, such as a
//!   quantile outside `(0, 1)`, a negative latency, or a non-positive size
//! - **ConfigurationInconsistency**: individually valid parameters that do not
//!   make sense together (Kafka units without a broker, no units at all)
//! - **AggregationMismatch**: bucket arrays of different lengths were combined;
//!   this indicates a programming error and aborts the run
//! - **CountOverflow**: merged counts no longer fit in 64 bits, which only
//!   happens with corrupt reports

use thiserror::Error;

/// Errors produced by the latency statistics core and run configuration.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LoadtestError {
    /// A parameter is outside its legal domain.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Configuration values contradict each other.
    #[error("inconsistent configuration: {0}")]
    ConfigurationInconsistency(String),

    /// Bucket arrays with differing lengths were combined.
    #[error("aggregation mismatch: expected {expected} buckets, found {found}")]
    AggregationMismatch { expected: usize, found: usize },

    /// Merging would overflow a counter.
    #[error("count overflow while merging {0}")]
    CountOverflow(String),
}

impl LoadtestError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    pub(crate) fn inconsistent(message: impl Into<String>) -> Self {
        Self::ConfigurationInconsistency(message.into())
    }

    pub(crate) fn overflow(what: impl Into<String>) -> Self {
        Self::CountOverflow(what.into())
    }

    /// Fails with [`LoadtestError::AggregationMismatch`] unless the lengths agree.
    pub(crate) fn check_len(expected: usize, found: usize) -> Result<()> {
        if expected == found {
            Ok(())
        } else {
            Err(Self::AggregationMismatch { expected, found })
        }
    }
}

/// Result alias for operations of the statistics core.
pub type Result<T> = std::result::Result<T, LoadtestError>;
