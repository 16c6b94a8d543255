use crate::percentile::Quantile;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

/// Pub/Sub Load Test Driver - drives publisher and subscriber units and reports
/// latency percentiles per client type
#[derive(Parser, Debug, Clone, PartialEq)]
#[clap(version, about, long_about = None)]
pub struct Args {
    /// Number of CPS publishers to start
    #[clap(long, default_value_t = crate::defaults::CPS_PUBLISHER_COUNT, help_heading = "Units")]
    pub cps_publisher_count: usize,

    /// Number of CPS subscribers to start
    #[clap(long, default_value_t = crate::defaults::CPS_SUBSCRIBER_COUNT, help_heading = "Units")]
    pub cps_subscriber_count: usize,

    /// Number of Kafka publishers to start (requires --broker)
    #[clap(long, default_value_t = crate::defaults::KAFKA_PUBLISHER_COUNT, help_heading = "Units")]
    pub kafka_publisher_count: usize,

    /// Number of Kafka subscribers to start (requires --broker)
    #[clap(long, default_value_t = crate::defaults::KAFKA_SUBSCRIBER_COUNT, help_heading = "Units")]
    pub kafka_subscriber_count: usize,

    /// Message size in bytes (only applies to publishing)
    #[clap(short = 'm', long, default_value_t = crate::defaults::MESSAGE_SIZE, value_parser = parse_positive)]
    pub message_size: usize,

    /// Duration of the load test, in seconds
    #[clap(long, default_value_t = crate::defaults::LOADTEST_SECONDS, value_parser = parse_positive)]
    pub loadtest_seconds: usize,

    /// Project to use for the load test
    #[clap(long)]
    pub project: String,

    /// Number of messages to batch per publish request
    #[clap(short = 'b', long, default_value_t = crate::defaults::BATCH_SIZE, value_parser = parse_positive)]
    pub batch_size: usize,

    /// Number of subscription ids to spread subscribers over
    #[clap(long, default_value_t = crate::defaults::SUBSCRIBER_FANOUT, value_parser = parse_positive)]
    pub subscriber_fanout: usize,

    /// The network address of the Kafka broker
    #[clap(long)]
    pub broker: Option<String>,

    /// Operations per second issued by each unit
    #[clap(long, default_value_t = crate::defaults::REQUEST_RATE, value_parser = parse_positive)]
    pub request_rate: usize,

    /// Operations each unit keeps in flight at once
    #[clap(long, default_value_t = crate::defaults::MAX_OUTSTANDING, value_parser = parse_positive)]
    pub max_outstanding: usize,

    /// How often units report their histograms (e.g., "1s", "500ms")
    #[clap(long, default_value = "1s", value_parser = parse_duration)]
    pub report_interval: Duration,

    /// Percentiles to report for each client type
    #[clap(long, default_values = ["50", "99", "99.9"], value_parser = parse_percentile, num_args = 1..)]
    pub percentiles: Vec<Quantile>,

    /// Write the final results as JSON to this file
    #[clap(short = 'o', long, help_heading = "Output")]
    pub output_file: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[clap(short = 'v', long, action = clap::ArgAction::Count, help_heading = "Output")]
    pub verbose: u8,

    /// Only log warnings and errors
    #[clap(short = 'q', long, default_value_t = false, help_heading = "Output")]
    pub quiet: bool,

    /// Also write logs to this file
    #[clap(long, help_heading = "Output")]
    pub log_file: Option<PathBuf>,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            cps_publisher_count: crate::defaults::CPS_PUBLISHER_COUNT,
            cps_subscriber_count: crate::defaults::CPS_SUBSCRIBER_COUNT,
            kafka_publisher_count: crate::defaults::KAFKA_PUBLISHER_COUNT,
            kafka_subscriber_count: crate::defaults::KAFKA_SUBSCRIBER_COUNT,
            message_size: crate::defaults::MESSAGE_SIZE,
            loadtest_seconds: crate::defaults::LOADTEST_SECONDS,
            project: String::new(),
            batch_size: crate::defaults::BATCH_SIZE,
            subscriber_fanout: crate::defaults::SUBSCRIBER_FANOUT,
            broker: None,
            request_rate: crate::defaults::REQUEST_RATE,
            max_outstanding: crate::defaults::MAX_OUTSTANDING,
            report_interval: crate::defaults::REPORT_INTERVAL,
            percentiles: crate::defaults::PERCENTILES.to_vec(),
            output_file: None,
            verbose: 0,
            quiet: false,
            log_file: None,
        }
    }
}

/// Parse an integer that must be greater than zero
fn parse_positive(s: &str) -> Result<usize, String> {
    match s.trim().parse::<i64>() {
        Ok(value) if value > 0 => usize::try_from(value)
            .map_err(|_| format!("should be an int greater than 0 (found {})", s)),
        Ok(_) => Err(format!("should be an int greater than 0 (found {})", s)),
        Err(_) => Err(format!("should be an int greater than 0 (found {})", s)),
    }
}

/// Parse a percentile such as "99.9" into an exact quantile
fn parse_percentile(s: &str) -> Result<Quantile, String> {
    s.parse::<Quantile>().map_err(|e| e.to_string())
}

/// Parse duration from string (e.g., "10s", "1.5s", "500ms", "5m", "1h")
fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();

    if s.is_empty() {
        return Err("Duration cannot be empty".to_string());
    }

    let (num_str, unit) = if let Some(stripped) = s.strip_suffix("ms") {
        (stripped, "ms")
    } else if let Some(stripped) = s.strip_suffix('s') {
        (stripped, "s")
    } else if let Some(stripped) = s.strip_suffix('m') {
        (stripped, "m")
    } else if let Some(stripped) = s.strip_suffix('h') {
        (stripped, "h")
    } else {
        (s, "s") // Default to seconds
    };

    let num: f64 = num_str
        .trim()
        .parse()
        .map_err(|_| format!("Invalid number in duration: {}", num_str))?;

    if !num.is_finite() || num <= 0.0 {
        return Err(format!("Duration must be greater than zero: {}", s));
    }

    let seconds = match unit {
        "ms" => num / 1_000.0,
        "s" => num,
        "m" => num * 60.0,
        "h" => num * 3_600.0,
        _ => return Err(format!("Invalid duration unit: {}", unit)),
    };

    Duration::try_from_secs_f64(seconds).map_err(|e| format!("Invalid duration {}: {}", s, e))
}
