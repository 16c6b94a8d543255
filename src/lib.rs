//! # Pub/Sub Load Test Library
//!
//! Latency measurement core of a distributed publish/subscribe load tester.
//! Many load-generating units (publishers and subscribers of different
//! messaging backends) each record operation latencies into a local,
//! memory-bounded histogram. Units periodically report snapshots to a central
//! collector, which merges them per client type and answers percentile
//! queries over the merged distributions.
//!
//! ## Architecture Overview
//!
//! - `buckets`: the fixed latency bucket boundaries and sample classification
//! - `histogram`: thread-safe streaming histogram with running mean/variance
//! - `percentile`: exact rational quantiles and bucket-based percentile estimates
//! - `aggregator`: order-independent merging of snapshots by client type
//! - `collector`: the unit report protocol and the collecting side of it
//! - `controller`: the run lifecycle trait and an in-process implementation
//! - `config`: validated run configuration and the client plan
//! - `cli`: command-line parsing
//! - `results`: logged, printed and JSON results
//! - `logging`: log subscriber setup
//! - `error`: error taxonomy of the core
//! - `utils`: formatting and validation helpers
//!
//! ## Usage Example
//!
//! ```rust
//! use pubsub_loadtest::{aggregator, BucketScheme, LatencyHistogram, Quantile};
//!
//! let unit_a = LatencyHistogram::new();
//! let unit_b = LatencyHistogram::new();
//! for _ in 0..5 {
//!     unit_a.record(0.0)?;
//!     unit_b.record(1.0)?;
//! }
//!
//! let merged = aggregator::merge_all(
//!     BucketScheme::standard(),
//!     [&unit_a.snapshot(), &unit_b.snapshot()],
//! )?;
//! assert_eq!(merged.percentile(Quantile::P50)?, 0.5);
//! # Ok::<(), pubsub_loadtest::LoadtestError>(())
//! ```

pub mod aggregator;
pub mod buckets;
pub mod cli;
pub mod collector;
pub mod config;

/// Run lifecycle
///
/// The `Controller` trait separates the driver from how units are provisioned;
/// `LocalController` runs them as tokio tasks in this process.
pub mod controller;

pub mod error;
pub mod histogram;
pub mod logging;
pub mod percentile;
pub mod results;
pub mod utils;

pub use aggregator::{AggregatedHistogram, Aggregator};
pub use buckets::{BucketScheme, LATENCY_BUCKETS_MS};
pub use cli::Args;
pub use collector::{ResultCollector, UnitReport};
pub use config::{ClientType, LoadtestConfig};
pub use controller::{Controller, LocalController};
pub use error::LoadtestError;
pub use histogram::{HistogramSnapshot, LatencyHistogram};
pub use percentile::{PercentileValue, Quantile};
pub use results::ResultsManager;

/// The current version of the load tester
///
/// Recorded in the results file for reproducibility.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
///
/// Shared by the command-line parser and code that builds a configuration
/// directly.
pub mod defaults {
    use crate::percentile::Quantile;
    use std::time::Duration;

    /// Publishers on the CPS (gcloud) backend
    pub const CPS_PUBLISHER_COUNT: usize = 1;

    /// Subscribers on the CPS (gcloud) backend
    pub const CPS_SUBSCRIBER_COUNT: usize = 1;

    /// Kafka units are off unless a broker is configured
    pub const KAFKA_PUBLISHER_COUNT: usize = 0;
    pub const KAFKA_SUBSCRIBER_COUNT: usize = 0;

    /// Message size in bytes
    pub const MESSAGE_SIZE: usize = 1000;

    /// Load test duration in seconds
    pub const LOADTEST_SECONDS: usize = 120;

    /// Messages per publish request
    pub const BATCH_SIZE: usize = 1000;

    pub const SUBSCRIBER_FANOUT: usize = 1;

    /// Operations per second per unit
    pub const REQUEST_RATE: usize = 1;

    pub const MAX_OUTSTANDING: usize = 1;

    /// How often units report their histograms
    pub const REPORT_INTERVAL: Duration = Duration::from_secs(1);

    /// Reported when no percentiles are requested explicitly
    pub const PERCENTILES: [Quantile; 3] = [Quantile::P50, Quantile::P99, Quantile::P999];
}
