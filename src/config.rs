//! # Run Configuration
//!
//! The immutable parameters of one load test run. A [`LoadtestConfig`] is built
//! once, validated before any unit starts, and then shared by reference (or
//! `Arc`) with every component that needs it. Nothing here is global state.
//!
//! The configuration also derives the client plan: which kinds of units to
//! start and how many of each, including how subscriber units are spread over
//! subscription identities when a fanout greater than one is requested.

use crate::cli::Args;
use crate::error::{LoadtestError, Result};
use crate::percentile::Quantile;
use crate::utils::validate_positive;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Kinds of load-generating units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClientType {
    CpsGcloudPublisher,
    CpsGcloudSubscriber,
    KafkaPublisher,
    KafkaSubscriber,
}

impl ClientType {
    pub const ALL: [ClientType; 4] = [
        ClientType::CpsGcloudPublisher,
        ClientType::CpsGcloudSubscriber,
        ClientType::KafkaPublisher,
        ClientType::KafkaSubscriber,
    ];

    pub fn is_publisher(&self) -> bool {
        matches!(self, Self::CpsGcloudPublisher | Self::KafkaPublisher)
    }

    /// Kafka units need a broker address.
    pub fn is_broker_backed(&self) -> bool {
        matches!(self, Self::KafkaPublisher | Self::KafkaSubscriber)
    }
}

impl std::fmt::Display for ClientType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientType::CpsGcloudPublisher => write!(f, "CPS Publisher (gcloud)"),
            ClientType::CpsGcloudSubscriber => write!(f, "CPS Subscriber (gcloud)"),
            ClientType::KafkaPublisher => write!(f, "Kafka Publisher"),
            ClientType::KafkaSubscriber => write!(f, "Kafka Subscriber"),
        }
    }
}

/// A client type plus the subscription it reads from, if any.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClientParams {
    pub client_type: ClientType,
    pub subscription: Option<String>,
}

impl ClientParams {
    pub fn new(client_type: ClientType, subscription: Option<String>) -> Self {
        Self {
            client_type,
            subscription,
        }
    }
}

/// One line of the client plan: start `count` units with `params`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanEntry {
    pub params: ClientParams,
    pub count: usize,
}

/// Validated, immutable parameters of a load test run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadtestConfig {
    /// Cloud project the topics and subscriptions live in
    pub project: String,

    /// Message size in bytes
    pub message_size: usize,

    /// Operations per second issued by each unit
    pub request_rate: usize,

    /// Messages per publish request
    pub batch_size: usize,

    /// How long units keep issuing operations
    pub loadtest_duration: Duration,

    pub cps_publisher_count: usize,
    pub cps_subscriber_count: usize,
    pub kafka_publisher_count: usize,
    pub kafka_subscriber_count: usize,

    /// Number of subscription identities subscriber units are spread over
    pub subscriber_fanout: usize,

    /// Kafka broker address; required exactly when Kafka units are requested
    pub broker: Option<String>,

    /// How often units send a cumulative snapshot to the collector
    pub report_interval: Duration,

    /// Concurrent operations a single unit keeps in flight
    pub max_outstanding: usize,

    /// Quantiles reported for each client type
    pub percentiles: Vec<Quantile>,

    /// Wall-clock time the configuration was created
    pub start_time: chrono::DateTime<chrono::Utc>,
}

impl LoadtestConfig {
    /// Build and validate a configuration from parsed command-line arguments.
    pub fn from_args(args: &Args) -> Result<Self> {
        let config = Self {
            project: args.project.trim().to_string(),
            message_size: args.message_size,
            request_rate: args.request_rate,
            batch_size: args.batch_size,
            loadtest_duration: Duration::from_secs(args.loadtest_seconds as u64),
            cps_publisher_count: args.cps_publisher_count,
            cps_subscriber_count: args.cps_subscriber_count,
            kafka_publisher_count: args.kafka_publisher_count,
            kafka_subscriber_count: args.kafka_subscriber_count,
            subscriber_fanout: args.subscriber_fanout,
            broker: args
                .broker
                .as_deref()
                .map(str::trim)
                .filter(|broker| !broker.is_empty())
                .map(str::to_string),
            report_interval: args.report_interval,
            max_outstanding: args.max_outstanding,
            percentiles: args.percentiles.clone(),
            start_time: chrono::Utc::now(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Check every parameter and their combinations.
    ///
    /// Single-value problems are reported as `InvalidArgument`, contradictions
    /// between values as `ConfigurationInconsistency`.
    pub fn validate(&self) -> Result<()> {
        if self.project.is_empty() {
            return Err(LoadtestError::invalid("a project must be specified"));
        }
        validate_positive("--message-size", self.message_size)?;
        validate_positive("--request-rate", self.request_rate)?;
        validate_positive("--batch-size", self.batch_size)?;
        validate_positive("--subscriber-fanout", self.subscriber_fanout)?;
        validate_positive("--max-outstanding", self.max_outstanding)?;
        if self.loadtest_duration.is_zero() {
            return Err(LoadtestError::invalid(
                "Parameter --loadtest-seconds should be an int greater than 0 (found 0)",
            ));
        }
        if self.report_interval.is_zero() {
            return Err(LoadtestError::invalid("the report interval must be positive"));
        }
        self.lane_interval()?;
        if self.percentiles.is_empty() {
            return Err(LoadtestError::invalid("at least one percentile must be requested"));
        }

        if self.total_requested_units() == 0 {
            return Err(LoadtestError::inconsistent(
                "at least one publisher or subscriber count must be greater than 0",
            ));
        }
        match (self.requires_broker(), self.broker.is_some()) {
            (true, false) => Err(LoadtestError::inconsistent(
                "Kafka publishers or subscribers were requested but no --broker was given",
            )),
            (false, true) => Err(LoadtestError::inconsistent(
                "--broker was given but no Kafka publishers or subscribers were requested",
            )),
            _ => Ok(()),
        }
    }

    /// True when any broker-backed unit is requested.
    pub fn requires_broker(&self) -> bool {
        self.client_plan()
            .iter()
            .any(|entry| entry.params.client_type.is_broker_backed())
    }

    fn total_requested_units(&self) -> usize {
        self.cps_publisher_count
            + self.cps_subscriber_count
            + self.kafka_publisher_count
            + self.kafka_subscriber_count
    }

    /// The units to start, one entry per distinct [`ClientParams`].
    ///
    /// CPS subscribers are divided over `subscriber_fanout` subscriptions named
    /// `gcloud-subscription{i}`; when the count does not divide evenly the
    /// lower-numbered subscriptions take one extra unit each. Entries with a
    /// zero count are left out.
    pub fn client_plan(&self) -> Vec<PlanEntry> {
        let mut plan = Vec::new();
        let mut push = |client_type, subscription, count| {
            if count > 0 {
                plan.push(PlanEntry {
                    params: ClientParams::new(client_type, subscription),
                    count,
                });
            }
        };

        push(ClientType::CpsGcloudPublisher, None, self.cps_publisher_count);

        let fanout = self.subscriber_fanout.max(1);
        let per_subscription = self.cps_subscriber_count / fanout;
        let remainder = self.cps_subscriber_count % fanout;
        for i in 0..fanout {
            let count = per_subscription + usize::from(i < remainder);
            push(
                ClientType::CpsGcloudSubscriber,
                Some(format!("gcloud-subscription{}", i)),
                count,
            );
        }

        push(ClientType::KafkaPublisher, None, self.kafka_publisher_count);
        push(ClientType::KafkaSubscriber, None, self.kafka_subscriber_count);
        plan
    }

    /// Total units across the plan.
    pub fn total_units(&self) -> usize {
        self.client_plan().iter().map(|entry| entry.count).sum()
    }

    /// Pause between two operations of one lane, derived from the request rate.
    pub fn operation_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.request_rate.max(1) as f64)
    }

    /// Pause between two operations of one lane when `max_outstanding` lanes
    /// share the request rate of a unit.
    pub fn lane_interval(&self) -> Result<Duration> {
        let too_many = || {
            LoadtestError::invalid(format!(
                "Parameter --max-outstanding is too large (found {})",
                self.max_outstanding
            ))
        };
        let lanes = u32::try_from(self.max_outstanding).map_err(|_| too_many())?;
        let interval = self
            .operation_interval()
            .checked_mul(lanes)
            .ok_or_else(too_many)?;
        Ok(interval.max(Duration::from_micros(1)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_args() -> Args {
        Args {
            project: "loadtest-project".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_config_from_default_args() {
        let config = LoadtestConfig::from_args(&base_args()).unwrap();
        assert_eq!(config.message_size, crate::defaults::MESSAGE_SIZE);
        assert_eq!(config.batch_size, crate::defaults::BATCH_SIZE);
        assert_eq!(config.loadtest_duration, Duration::from_secs(120));
        assert_eq!(
            config.percentiles,
            vec![Quantile::P50, Quantile::P99, Quantile::P999]
        );
        assert!(!config.requires_broker());
    }

    #[test]
    fn test_zero_units_rejected() {
        let args = Args {
            cps_publisher_count: 0,
            cps_subscriber_count: 0,
            ..base_args()
        };
        assert!(matches!(
            LoadtestConfig::from_args(&args),
            Err(LoadtestError::ConfigurationInconsistency(_))
        ));
    }

    #[test]
    fn test_lane_interval() {
        let config = LoadtestConfig::from_args(&Args {
            request_rate: 100,
            max_outstanding: 4,
            ..base_args()
        })
        .unwrap();
        assert_eq!(config.lane_interval().unwrap(), Duration::from_millis(40));

        let mut config = LoadtestConfig::from_args(&base_args()).unwrap();
        config.max_outstanding = u32::MAX as usize;
        assert_eq!(
            config.lane_interval().unwrap(),
            Duration::from_secs(u64::from(u32::MAX))
        );
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn test_max_outstanding_beyond_u32_rejected() {
        let mut config = LoadtestConfig::from_args(&base_args()).unwrap();
        config.max_outstanding = u32::MAX as usize + 1;
        assert!(matches!(
            config.validate(),
            Err(LoadtestError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_requires_broker_follows_plan() {
        let mut config = LoadtestConfig::from_args(&base_args()).unwrap();
        assert!(!config.requires_broker());
        config.kafka_subscriber_count = 1;
        assert!(config.requires_broker());
        config.kafka_subscriber_count = 0;
        config.kafka_publisher_count = 3;
        assert!(config.requires_broker());
    }

    #[test]
    fn test_kafka_requires_broker() {
        let args = Args {
            kafka_publisher_count: 2,
            ..base_args()
        };
        assert!(matches!(
            LoadtestConfig::from_args(&args),
            Err(LoadtestError::ConfigurationInconsistency(_))
        ));

        let args = Args {
            kafka_publisher_count: 2,
            broker: Some("10.0.0.2:9092".to_string()),
            ..base_args()
        };
        let config = LoadtestConfig::from_args(&args).unwrap();
        assert_eq!(config.broker.as_deref(), Some("10.0.0.2:9092"));
    }

    #[test]
    fn test_broker_without_kafka_rejected() {
        let args = Args {
            broker: Some("10.0.0.2:9092".to_string()),
            ..base_args()
        };
        assert!(matches!(
            LoadtestConfig::from_args(&args),
            Err(LoadtestError::ConfigurationInconsistency(_))
        ));

        // A blank broker counts as absent.
        let args = Args {
            broker: Some("  ".to_string()),
            ..base_args()
        };
        assert!(LoadtestConfig::from_args(&args).unwrap().broker.is_none());
    }

    #[test]
    fn test_non_positive_values_rejected() {
        for args in [
            Args {
                message_size: 0,
                ..base_args()
            },
            Args {
                batch_size: 0,
                ..base_args()
            },
            Args {
                loadtest_seconds: 0,
                ..base_args()
            },
            Args {
                subscriber_fanout: 0,
                ..base_args()
            },
            Args {
                project: String::new(),
                ..base_args()
            },
        ] {
            assert!(matches!(
                LoadtestConfig::from_args(&args),
                Err(LoadtestError::InvalidArgument(_))
            ));
        }
    }

    #[test]
    fn test_client_plan_spreads_subscribers() {
        let args = Args {
            cps_publisher_count: 3,
            cps_subscriber_count: 5,
            subscriber_fanout: 2,
            kafka_subscriber_count: 1,
            broker: Some("broker:9092".to_string()),
            ..base_args()
        };
        let config = LoadtestConfig::from_args(&args).unwrap();
        let plan = config.client_plan();

        assert_eq!(
            plan,
            vec![
                PlanEntry {
                    params: ClientParams::new(ClientType::CpsGcloudPublisher, None),
                    count: 3,
                },
                PlanEntry {
                    params: ClientParams::new(
                        ClientType::CpsGcloudSubscriber,
                        Some("gcloud-subscription0".to_string())
                    ),
                    count: 3,
                },
                PlanEntry {
                    params: ClientParams::new(
                        ClientType::CpsGcloudSubscriber,
                        Some("gcloud-subscription1".to_string())
                    ),
                    count: 2,
                },
                PlanEntry {
                    params: ClientParams::new(ClientType::KafkaSubscriber, None),
                    count: 1,
                },
            ]
        );
        assert_eq!(config.total_units(), 9);
    }

    #[test]
    fn test_fanout_larger_than_subscribers() {
        let args = Args {
            cps_publisher_count: 0,
            cps_subscriber_count: 2,
            subscriber_fanout: 4,
            ..base_args()
        };
        let config = LoadtestConfig::from_args(&args).unwrap();
        let subscriptions: Vec<_> = config
            .client_plan()
            .into_iter()
            .map(|entry| (entry.params.subscription.unwrap(), entry.count))
            .collect();
        assert_eq!(
            subscriptions,
            vec![
                ("gcloud-subscription0".to_string(), 1),
                ("gcloud-subscription1".to_string(), 1),
            ]
        );
    }

    #[test]
    fn test_client_type_properties() {
        assert!(ClientType::CpsGcloudPublisher.is_publisher());
        assert!(!ClientType::KafkaSubscriber.is_publisher());
        assert!(ClientType::KafkaPublisher.is_broker_backed());
        assert!(!ClientType::CpsGcloudSubscriber.is_broker_backed());
        assert_eq!(ClientType::KafkaPublisher.to_string(), "Kafka Publisher");
        assert_eq!(
            serde_json::to_string(&ClientType::CpsGcloudSubscriber).unwrap(),
            "\"cps-gcloud-subscriber\""
        );
    }

    #[test]
    fn test_operation_interval() {
        let config = LoadtestConfig::from_args(&Args {
            request_rate: 200,
            ..base_args()
        })
        .unwrap();
        assert_eq!(config.operation_interval(), Duration::from_millis(5));
    }
}
