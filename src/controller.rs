//! # Load Test Controller
//!
//! The [`Controller`] trait is the seam between the driver and whatever
//! actually provisions and runs load-generating units. The driver only ever
//! calls the four lifecycle operations in order:
//!
//! 1. `initialize()` validate the configuration and prepare the unit roster
//! 2. `start_clients()` start issuing operations on every unit
//! 3. `await_results()` wait for the run to end and collect merged histograms
//! 4. `shutdown(reason)` tear everything down, with the error that caused an
//!    early stop if there was one
//!
//! ## Local Controller
//!
//! [`LocalController`] runs every unit in-process as a tokio task. A unit owns
//! one [`LatencyHistogram`] shared through `Arc` by `max_outstanding`
//! operation lanes; each lane issues operations at its share of the request
//! rate and records how long every operation took. Operations are simulated
//! by a [`LatencyModel`]: a base cost proportional to the bytes moved plus
//! exponentially distributed jitter.
//!
//! Units report cumulative snapshots every `report_interval` and a final one
//! when their run ends, over the channel described in [`crate::collector`].

use crate::aggregator::AggregatedHistogram;
use crate::buckets::BucketScheme;
use crate::collector::{report_channel, ReportSender, ResultCollector, UnitReport};
use crate::config::{ClientParams, ClientType, LoadtestConfig};
use crate::histogram::LatencyHistogram;
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Extra time granted after the run for final reports to arrive.
const COLLECTION_GRACE: Duration = Duration::from_secs(5);

/// Lifecycle of a load test run as driven by the orchestrator.
#[async_trait]
pub trait Controller: Send {
    /// Validate the configuration and prepare the units to run.
    async fn initialize(&mut self) -> Result<()>;

    /// Begin issuing operations on every unit.
    async fn start_clients(&mut self) -> Result<()>;

    /// Wait for the run to finish and return one merged histogram per client type.
    async fn await_results(&mut self) -> Result<BTreeMap<ClientType, AggregatedHistogram>>;

    /// Stop all units and release resources; `reason` is the error that ended
    /// the run early, if any.
    async fn shutdown(&mut self, reason: Option<&anyhow::Error>) -> Result<()>;
}

/// Drive `controller` through a whole run and hand the merged results to `report`.
///
/// `shutdown` is always called, with the first error from the run or from
/// `report` as its reason. That error is returned; a shutdown failure after
/// it is only logged.
pub async fn run_to_completion<C, F>(controller: &mut C, report: F) -> Result<()>
where
    C: Controller,
    F: FnOnce(&BTreeMap<ClientType, AggregatedHistogram>) -> Result<()>,
{
    let outcome = match drive(controller).await {
        Ok(groups) => report(&groups),
        Err(e) => Err(e),
    };

    let shutdown = controller.shutdown(outcome.as_ref().err()).await;
    match outcome {
        Ok(()) => shutdown,
        Err(e) => {
            if let Err(shutdown_error) = shutdown {
                error!("Shutdown failed: {:#}", shutdown_error);
            }
            Err(e)
        }
    }
}

async fn drive<C: Controller>(controller: &mut C) -> Result<BTreeMap<ClientType, AggregatedHistogram>> {
    controller
        .initialize()
        .await
        .context("failed to initialize the load test")?;
    controller
        .start_clients()
        .await
        .context("failed to start clients")?;
    controller
        .await_results()
        .await
        .context("failed to collect results")
}

/// Synthetic cost of one operation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatencyModel {
    /// Fixed per-operation overhead
    pub fixed_ms: f64,
    /// Payload throughput; the bytes moved add `bytes / bytes_per_ms`
    pub bytes_per_ms: f64,
    /// Mean of the exponential jitter added to every operation
    pub mean_jitter_ms: f64,
}

impl Default for LatencyModel {
    fn default() -> Self {
        Self {
            fixed_ms: 1.0,
            bytes_per_ms: 125_000.0,
            mean_jitter_ms: 2.0,
        }
    }
}

impl LatencyModel {
    /// Bytes one operation of `client_type` moves: a whole batch for
    /// publishers, a single message for subscribers.
    pub fn payload_bytes(client_type: ClientType, config: &LoadtestConfig) -> usize {
        if client_type.is_publisher() {
            config.message_size.saturating_mul(config.batch_size)
        } else {
            config.message_size
        }
    }

    /// Jitter-free cost of one operation, in milliseconds.
    pub fn base_ms(&self, client_type: ClientType, config: &LoadtestConfig) -> f64 {
        let bytes = Self::payload_bytes(client_type, config) as f64;
        self.fixed_ms + bytes / self.bytes_per_ms
    }

    /// Draw one operation duration.
    pub fn sample<R: Rng>(&self, base_ms: f64, rng: &mut R) -> Duration {
        let uniform: f64 = rng.gen();
        // Tail capped so one draw cannot stall a lane.
        let jitter = (-(1.0 - uniform).ln() * self.mean_jitter_ms).min(self.mean_jitter_ms * 50.0);
        Duration::from_secs_f64((base_ms + jitter).max(0.0) / 1_000.0)
    }
}

/// One unit of the roster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitSpec {
    pub unit_id: Uuid,
    pub params: ClientParams,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ControllerState {
    Created,
    Initialized,
    Running,
    Finished,
    ShutDown,
}

/// Runs every unit as a task in this process.
pub struct LocalController {
    config: Arc<LoadtestConfig>,
    scheme: BucketScheme,
    latency_model: LatencyModel,
    units: Vec<UnitSpec>,
    roster: BTreeMap<Uuid, ClientType>,
    state: ControllerState,
    stop: watch::Sender<bool>,
    tasks: Vec<JoinHandle<Result<()>>>,
    sender: Option<ReportSender>,
    collector: Option<ResultCollector>,
    started_at: Option<Instant>,
}

impl LocalController {
    pub fn new(config: LoadtestConfig) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            config: Arc::new(config),
            scheme: BucketScheme::standard(),
            latency_model: LatencyModel::default(),
            units: Vec::new(),
            roster: BTreeMap::new(),
            state: ControllerState::Created,
            stop,
            tasks: Vec::new(),
            sender: None,
            collector: None,
            started_at: None,
        }
    }

    /// Replace the default synthetic latency model.
    pub fn with_latency_model(mut self, latency_model: LatencyModel) -> Self {
        self.latency_model = latency_model;
        self
    }

    pub fn config(&self) -> &LoadtestConfig {
        &self.config
    }

    pub fn units(&self) -> &[UnitSpec] {
        &self.units
    }

    /// Unit id to client type for every unit of the run.
    pub fn roster(&self) -> &BTreeMap<Uuid, ClientType> {
        &self.roster
    }

    fn expect_state(&self, expected: ControllerState, operation: &str) -> Result<()> {
        if self.state != expected {
            bail!(
                "cannot {} while the controller is {:?} (expected {:?})",
                operation,
                self.state,
                expected
            );
        }
        Ok(())
    }
}

#[async_trait]
impl Controller for LocalController {
    async fn initialize(&mut self) -> Result<()> {
        self.expect_state(ControllerState::Created, "initialize")?;
        self.config.validate().context("invalid load test configuration")?;

        for entry in self.config.client_plan() {
            info!(
                "Planning {} x {}{}",
                entry.count,
                entry.params.client_type,
                entry
                    .params
                    .subscription
                    .as_deref()
                    .map(|s| format!(" on {}", s))
                    .unwrap_or_default()
            );
            for _ in 0..entry.count {
                let unit = UnitSpec {
                    unit_id: Uuid::new_v4(),
                    params: entry.params.clone(),
                };
                self.roster.insert(unit.unit_id, unit.params.client_type);
                self.units.push(unit);
            }
        }

        let (sender, collector) = report_channel(self.scheme);
        self.sender = Some(sender);
        self.collector = Some(collector);
        self.state = ControllerState::Initialized;
        debug!("Initialized {} units", self.units.len());
        Ok(())
    }

    async fn start_clients(&mut self) -> Result<()> {
        self.expect_state(ControllerState::Initialized, "start clients")?;
        let sender = self
            .sender
            .take()
            .ok_or_else(|| anyhow!("report channel was not created"))?;

        let run_until = Instant::now() + self.config.loadtest_duration;
        for unit in &self.units {
            let task = tokio::spawn(run_unit(
                unit.clone(),
                Arc::clone(&self.config),
                self.scheme,
                self.latency_model,
                sender.clone(),
                self.stop.subscribe(),
                run_until,
            ));
            self.tasks.push(task);
        }
        // Units hold the remaining senders; the channel closes when the last one ends.
        drop(sender);

        self.started_at = Some(Instant::now());
        self.state = ControllerState::Running;
        info!(
            "Started {} units for {}",
            self.units.len(),
            crate::utils::format_duration(self.config.loadtest_duration)
        );
        Ok(())
    }

    async fn await_results(&mut self) -> Result<BTreeMap<ClientType, AggregatedHistogram>> {
        self.expect_state(ControllerState::Running, "await results")?;
        let collector = self
            .collector
            .take()
            .ok_or_else(|| anyhow!("result collector was already consumed"))?;
        let started_at = self.started_at.unwrap_or_else(Instant::now);
        let deadline = (started_at
            + self.config.loadtest_duration
            + self.config.report_interval
            + COLLECTION_GRACE)
            .into_std();

        let roster = self.roster.clone();
        let groups = tokio::task::spawn_blocking(move || collector.collect(&roster, deadline))
            .await
            .context("result collector task failed")??;

        for task in self.tasks.drain(..) {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Unit ended with an error: {:#}", e),
                Err(e) => warn!("Unit task failed: {}", e),
            }
        }

        self.state = ControllerState::Finished;
        Ok(groups)
    }

    async fn shutdown(&mut self, reason: Option<&anyhow::Error>) -> Result<()> {
        if self.state == ControllerState::ShutDown {
            return Ok(());
        }
        match reason {
            Some(e) => warn!("Shutting down load test: {:#}", e),
            None => debug!("Shutting down load test"),
        }

        self.stop.send_replace(true);
        for task in self.tasks.drain(..) {
            task.abort();
            let _ = task.await;
        }
        self.sender = None;
        self.collector = None;
        self.state = ControllerState::ShutDown;
        info!("Loadtest completed.");
        Ok(())
    }
}

/// Drive one unit: start its lanes, report periodically, send a final report.
async fn run_unit(
    unit: UnitSpec,
    config: Arc<LoadtestConfig>,
    scheme: BucketScheme,
    model: LatencyModel,
    sender: ReportSender,
    mut stop: watch::Receiver<bool>,
    run_until: Instant,
) -> Result<()> {
    let client_type = unit.params.client_type;
    let histogram = Arc::new(LatencyHistogram::with_scheme(scheme));
    let base_ms = model.base_ms(client_type, &config);
    let lane_interval = config.lane_interval()?;

    let lanes: Vec<_> = (0..config.max_outstanding)
        .map(|_| {
            tokio::spawn(run_lane(
                Arc::clone(&histogram),
                model,
                base_ms,
                lane_interval,
                stop.clone(),
                run_until,
            ))
        })
        .collect();

    let mut sequence = 0;
    let mut ticker = tokio::time::interval_at(
        Instant::now() + config.report_interval,
        config.report_interval,
    );
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                sequence += 1;
                sender.send(&UnitReport {
                    unit_id: unit.unit_id,
                    client_type,
                    sequence,
                    is_final: false,
                    snapshot: histogram.snapshot(),
                })?;
            }
            _ = tokio::time::sleep_until(run_until) => break,
            _ = stop.changed() => break,
        }
    }

    for lane in lanes {
        if let Err(e) = lane.await {
            warn!("Lane of unit {} failed: {}", unit.unit_id, e);
        }
    }

    let snapshot = histogram.snapshot();
    debug!(
        "Unit {} ({}) finished with {} operations",
        unit.unit_id, client_type, snapshot.count
    );
    sender.send(&UnitReport {
        unit_id: unit.unit_id,
        client_type,
        sequence: sequence + 1,
        is_final: true,
        snapshot,
    })
}

/// Issue operations at a fixed pace until the run ends, recording each one.
async fn run_lane(
    histogram: Arc<LatencyHistogram>,
    model: LatencyModel,
    base_ms: f64,
    interval: Duration,
    mut stop: watch::Receiver<bool>,
    run_until: Instant,
) {
    let mut rng = StdRng::from_entropy();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::time::sleep_until(run_until) => return,
            _ = stop.changed() => return,
        }
        if *stop.borrow() || Instant::now() >= run_until {
            return;
        }

        let cost = model.sample(base_ms, &mut rng);
        let issued = Instant::now();
        tokio::time::sleep(cost).await;
        histogram.record_duration(issued.elapsed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::Args;

    fn quick_config() -> LoadtestConfig {
        let mut config = LoadtestConfig::from_args(&Args {
            project: "unit-test".to_string(),
            cps_publisher_count: 2,
            cps_subscriber_count: 3,
            subscriber_fanout: 2,
            request_rate: 200,
            max_outstanding: 2,
            message_size: 100,
            batch_size: 10,
            ..Default::default()
        })
        .unwrap();
        config.loadtest_duration = Duration::from_millis(300);
        config.report_interval = Duration::from_millis(50);
        config
    }

    fn fast_model() -> LatencyModel {
        LatencyModel {
            fixed_ms: 0.2,
            bytes_per_ms: 1_000_000.0,
            mean_jitter_ms: 0.3,
        }
    }

    #[test]
    fn test_latency_model_base_cost() {
        let config = quick_config();
        let model = LatencyModel::default();
        assert_eq!(LatencyModel::payload_bytes(ClientType::CpsGcloudPublisher, &config), 1_000);
        assert_eq!(LatencyModel::payload_bytes(ClientType::CpsGcloudSubscriber, &config), 100);
        assert!((model.base_ms(ClientType::CpsGcloudPublisher, &config) - 1.008).abs() < 1e-9);

        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..1_000 {
            let sample = model.sample(1.0, &mut rng);
            assert!(sample >= Duration::from_micros(999));
            assert!(sample <= Duration::from_millis(101));
        }
    }

    #[tokio::test]
    async fn test_initialize_builds_roster() {
        let mut controller = LocalController::new(quick_config());
        controller.initialize().await.unwrap();

        assert_eq!(controller.units().len(), 5);
        let subscribers = controller
            .units()
            .iter()
            .filter(|unit| unit.params.client_type == ClientType::CpsGcloudSubscriber)
            .count();
        assert_eq!(subscribers, 3);
        assert!(controller.initialize().await.is_err());
    }

    #[tokio::test]
    async fn test_lifecycle_order_is_enforced() {
        let mut controller = LocalController::new(quick_config());
        assert!(controller.start_clients().await.is_err());
        assert!(controller.await_results().await.is_err());
        controller.shutdown(None).await.unwrap();
    }

    #[tokio::test]
    async fn test_short_run_reports_every_client_type() {
        let mut controller = LocalController::new(quick_config()).with_latency_model(fast_model());
        controller.initialize().await.unwrap();
        controller.start_clients().await.unwrap();
        let groups = controller.await_results().await.unwrap();
        controller.shutdown(None).await.unwrap();

        assert_eq!(groups.len(), 2);
        let publishers = &groups[&ClientType::CpsGcloudPublisher];
        assert_eq!(publishers.units(), 2);
        assert!(publishers.count() > 0);
        assert_eq!(publishers.total(), publishers.count());

        let subscribers = &groups[&ClientType::CpsGcloudSubscriber];
        assert_eq!(subscribers.units(), 3);
        assert!(subscribers.count() > 0);
    }

    /// Records the lifecycle calls it receives and can fail any of them.
    #[derive(Default)]
    struct ScriptedController {
        fail_initialize: bool,
        calls: Vec<&'static str>,
        shutdown_reason: Option<String>,
    }

    #[async_trait]
    impl Controller for ScriptedController {
        async fn initialize(&mut self) -> Result<()> {
            self.calls.push("initialize");
            if self.fail_initialize {
                bail!("no units");
            }
            Ok(())
        }

        async fn start_clients(&mut self) -> Result<()> {
            self.calls.push("start_clients");
            Ok(())
        }

        async fn await_results(&mut self) -> Result<BTreeMap<ClientType, AggregatedHistogram>> {
            self.calls.push("await_results");
            Ok(BTreeMap::new())
        }

        async fn shutdown(&mut self, reason: Option<&anyhow::Error>) -> Result<()> {
            self.calls.push("shutdown");
            self.shutdown_reason = reason.map(|e| format!("{:#}", e));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_run_to_completion_shuts_down_after_success() {
        let mut controller = ScriptedController::default();
        run_to_completion(&mut controller, |_| Ok(())).await.unwrap();
        assert_eq!(
            controller.calls,
            ["initialize", "start_clients", "await_results", "shutdown"]
        );
        assert_eq!(controller.shutdown_reason, None);
    }

    #[tokio::test]
    async fn test_run_to_completion_shuts_down_when_reporting_fails() {
        let mut controller = ScriptedController::default();
        let error = run_to_completion(&mut controller, |_| bail!("disk full"))
            .await
            .unwrap_err();
        assert_eq!(error.to_string(), "disk full");
        assert_eq!(controller.calls.last(), Some(&"shutdown"));
        assert_eq!(controller.shutdown_reason.as_deref(), Some("disk full"));
    }

    #[tokio::test]
    async fn test_run_to_completion_passes_run_error_to_shutdown() {
        let mut controller = ScriptedController {
            fail_initialize: true,
            ..Default::default()
        };
        let mut reported = false;
        let result = run_to_completion(&mut controller, |_| {
            reported = true;
            Ok(())
        })
        .await;
        assert!(result.is_err());
        assert!(!reported);
        assert_eq!(controller.calls, ["initialize", "shutdown"]);
        assert_eq!(
            controller.shutdown_reason.as_deref(),
            Some("failed to initialize the load test: no units")
        );
    }

    #[tokio::test]
    async fn test_shutdown_stops_running_units() {
        let mut config = quick_config();
        config.loadtest_duration = Duration::from_secs(60);
        let mut controller = LocalController::new(config).with_latency_model(fast_model());
        controller.initialize().await.unwrap();
        controller.start_clients().await.unwrap();

        let reason = anyhow!("interrupted");
        tokio::time::timeout(Duration::from_secs(5), controller.shutdown(Some(&reason)))
            .await
            .unwrap()
            .unwrap();
        assert!(controller.await_results().await.is_err());
    }
}
