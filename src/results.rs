use crate::aggregator::AggregatedHistogram;
use crate::buckets::BucketScheme;
use crate::config::{ClientType, LoadtestConfig};
use crate::percentile::{PercentileValue, Quantile};
use crate::utils::{format_count, format_latency_ms, generate_run_id, table_row, table_separator};
use anyhow::{Context, Result};
use colored::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Merged latency results for one client type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupResult {
    pub client_type: ClientType,
    /// Units whose snapshots were merged into this group
    pub units: usize,
    pub sample_count: u64,
    pub bucket_counts: Vec<u64>,
    pub percentiles: Vec<PercentileValue>,
}

impl GroupResult {
    /// Evaluate `quantiles` over a merged histogram
    pub fn from_aggregate(
        client_type: ClientType,
        aggregate: &AggregatedHistogram,
        quantiles: &[Quantile],
    ) -> Result<Self> {
        let percentiles = aggregate
            .percentiles(quantiles)
            .with_context(|| format!("failed to compute percentiles for {}", client_type))?;
        Ok(Self {
            client_type,
            units: aggregate.units(),
            sample_count: aggregate.total(),
            bucket_counts: aggregate.bucket_counts().to_vec(),
            percentiles,
        })
    }
}

/// System information for reproducibility
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemInfo {
    pub os: String,
    pub architecture: String,
    pub cpu_cores: usize,
    pub rust_version: String,
    pub loadtest_version: String,
}

impl Default for SystemInfo {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            architecture: std::env::consts::ARCH.to_string(),
            cpu_cores: num_cpus::get(),
            rust_version: env!("CARGO_PKG_RUST_VERSION").to_string(),
            loadtest_version: crate::VERSION.to_string(),
        }
    }
}

/// Run metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMetadata {
    pub run_id: String,
    pub version: String,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub finished_at: chrono::DateTime<chrono::Utc>,
    pub system_info: SystemInfo,
}

/// Everything written to the results file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadtestResults {
    pub metadata: RunMetadata,
    pub configuration: LoadtestConfig,
    pub bucket_boundaries_ms: Vec<f64>,
    pub groups: Vec<GroupResult>,
}

impl LoadtestResults {
    pub fn group(&self, client_type: ClientType) -> Option<&GroupResult> {
        self.groups.iter().find(|group| group.client_type == client_type)
    }
}

/// Turns merged histograms into logged, printed and saved results
pub struct ResultsManager {
    output_file: Option<PathBuf>,
    run_id: String,
    scheme: BucketScheme,
    groups: Vec<GroupResult>,
}

impl ResultsManager {
    /// Create a new results manager; `output_file` receives JSON on finalize
    pub fn new(output_file: Option<&Path>) -> Self {
        Self {
            output_file: output_file.map(Path::to_path_buf),
            run_id: generate_run_id(),
            scheme: BucketScheme::standard(),
            groups: Vec::new(),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn groups(&self) -> &[GroupResult] {
        &self.groups
    }

    /// Add the merged histogram of every client type
    pub fn add_results(
        &mut self,
        aggregates: &BTreeMap<ClientType, AggregatedHistogram>,
        quantiles: &[Quantile],
    ) -> Result<()> {
        for (&client_type, aggregate) in aggregates {
            debug!(
                "Adding results for {} ({} units, {} samples)",
                client_type,
                aggregate.units(),
                aggregate.total()
            );
            self.groups
                .push(GroupResult::from_aggregate(client_type, aggregate, quantiles)?);
        }
        Ok(())
    }

    /// Log one block per client type, e.g. "Results for Kafka Publisher:" then "99%: 175.00ms"
    pub fn log_results(&self) {
        for group in &self.groups {
            info!("Results for {}:", group.client_type);
            for value in &group.percentiles {
                info!("{}%: {}", value.quantile, format_latency_ms(value.value_ms));
            }
        }
    }

    /// Render the results as a plain-text table
    pub fn summary_table(&self) -> Vec<String> {
        let quantiles: Vec<String> = self
            .groups
            .first()
            .map(|group| {
                group
                    .percentiles
                    .iter()
                    .map(|value| format!("p{}", value.quantile))
                    .collect()
            })
            .unwrap_or_default();

        let mut widths = vec![24, 6, 12];
        widths.extend(quantiles.iter().map(|_| 10));

        let mut header = vec!["Client type".to_string(), "Units".to_string(), "Samples".to_string()];
        header.extend(quantiles);

        let mut lines = vec![table_separator(&widths)];
        lines.push(table_row(&as_strs(&header), &widths));
        lines.push(table_separator(&widths));
        for group in &self.groups {
            let mut row = vec![
                group.client_type.to_string(),
                group.units.to_string(),
                format_count(group.sample_count),
            ];
            row.extend(
                group
                    .percentiles
                    .iter()
                    .map(|value| format_latency_ms(value.value_ms)),
            );
            lines.push(table_row(&as_strs(&row), &widths));
        }
        lines.push(table_separator(&widths));
        lines
    }

    /// Print the summary table to stdout
    pub fn print_summary(&self) {
        println!("{}", "Latency percentiles by client type".bold());
        for line in self.summary_table() {
            println!("{}", line);
        }
    }

    /// Build the final results and write them to the output file, if any
    pub fn finalize(&self, config: &LoadtestConfig) -> Result<LoadtestResults> {
        let results = LoadtestResults {
            metadata: RunMetadata {
                run_id: self.run_id.clone(),
                version: crate::VERSION.to_string(),
                started_at: config.start_time,
                finished_at: chrono::Utc::now(),
                system_info: SystemInfo::default(),
            },
            configuration: config.clone(),
            bucket_boundaries_ms: self.scheme.boundaries().to_vec(),
            groups: self.groups.clone(),
        };

        if let Some(ref output_file) = self.output_file {
            let json = serde_json::to_string_pretty(&results)?;
            std::fs::write(output_file, json)
                .with_context(|| format!("failed to write results to {:?}", output_file))?;
            info!("Results written to: {:?}", output_file);
        }
        Ok(results)
    }
}

fn as_strs(cells: &[String]) -> Vec<&str> {
    cells.iter().map(String::as_str).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::merge_all;
    use crate::cli::Args;
    use crate::histogram::LatencyHistogram;
    use tempfile::NamedTempFile;

    fn config() -> LoadtestConfig {
        LoadtestConfig::from_args(&Args {
            project: "results-test".to_string(),
            ..Default::default()
        })
        .unwrap()
    }

    fn aggregates() -> BTreeMap<ClientType, AggregatedHistogram> {
        let publisher = LatencyHistogram::new();
        for _ in 0..5 {
            publisher.record(0.0).unwrap();
            publisher.record(1.0).unwrap();
        }
        let subscriber = LatencyHistogram::new();
        for _ in 0..99 {
            subscriber.record(160.0).unwrap();
        }
        subscriber.record(2_500.0).unwrap();

        let scheme = BucketScheme::standard();
        BTreeMap::from([
            (
                ClientType::CpsGcloudPublisher,
                merge_all(scheme, [&publisher.snapshot()]).unwrap(),
            ),
            (
                ClientType::CpsGcloudSubscriber,
                merge_all(scheme, [&subscriber.snapshot()]).unwrap(),
            ),
        ])
    }

    #[test]
    fn test_group_results() {
        let mut manager = ResultsManager::new(None);
        manager
            .add_results(&aggregates(), &[Quantile::P50, Quantile::P99])
            .unwrap();

        let groups = manager.groups();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].client_type, ClientType::CpsGcloudPublisher);
        assert_eq!(groups[0].sample_count, 10);
        assert_eq!(groups[0].percentiles[0].value_ms, 0.5);

        assert_eq!(groups[1].units, 1);
        assert_eq!(groups[1].percentiles[0].value_ms, 150.0);
        // The 99th rank falls exactly on the lower edge of the 2000ms bucket.
        assert_eq!(groups[1].percentiles[1].value_ms, 1_500.0);
    }

    #[test]
    fn test_summary_table() {
        let mut manager = ResultsManager::new(None);
        manager.add_results(&aggregates(), &[Quantile::P50]).unwrap();

        let lines = manager.summary_table();
        assert_eq!(lines.len(), 6);
        assert!(lines[1].contains("Client type"));
        assert!(lines[1].contains("p50"));
        assert!(lines[3].contains("CPS Publisher (gcloud)"));
        assert!(lines[3].contains("500μs"));
        assert!(lines[4].contains("150.00ms"));
    }

    #[test]
    fn test_finalize_writes_json() {
        let temp_file = NamedTempFile::new().unwrap();
        let mut manager = ResultsManager::new(Some(temp_file.path()));
        manager
            .add_results(&aggregates(), &[Quantile::P50, Quantile::P999])
            .unwrap();

        let results = manager.finalize(&config()).unwrap();
        assert_eq!(results.metadata.run_id, manager.run_id());
        assert_eq!(results.bucket_boundaries_ms.len(), 24);

        let written: LoadtestResults =
            serde_json::from_str(&std::fs::read_to_string(temp_file.path()).unwrap()).unwrap();
        assert_eq!(written.groups, results.groups);
        assert_eq!(written.configuration.project, "results-test");
        let subscriber = written.group(ClientType::CpsGcloudSubscriber).unwrap();
        assert_eq!(subscriber.percentiles[1].quantile, Quantile::P999);
        assert!(written.group(ClientType::KafkaPublisher).is_none());
    }

    #[test]
    fn test_system_info_default() {
        let info = SystemInfo::default();

        assert!(!info.os.is_empty());
        assert!(!info.architecture.is_empty());
        assert!(info.cpu_cores > 0);
        assert_eq!(info.loadtest_version, crate::VERSION);
    }
}
