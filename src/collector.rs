//! # Result Collection
//!
//! Units never share histograms with the collector. Each unit periodically
//! takes a cumulative snapshot of its own histogram, wraps it in a
//! [`UnitReport`], encodes it with bincode and sends the bytes over a
//! crossbeam channel. The [`ResultCollector`] on the other end keeps only the
//! newest report per unit and, once collection ends, merges the retained
//! snapshots by client type.
//!
//! ## Ordering Rules
//!
//! - a report with a higher `sequence` replaces an older one
//! - a final report is never replaced
//! - once the roster is known, reports from units outside it are dropped
//!   with a warning
//!
//! Because snapshots are cumulative, keeping the newest one per unit is enough;
//! periodic reports that arrive late or out of order can never roll a unit's
//! distribution backwards.

use crate::aggregator::{self, AggregatedHistogram};
use crate::buckets::BucketScheme;
use crate::config::ClientType;
use crate::histogram::HistogramSnapshot;
use anyhow::{Context, Result};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

/// One snapshot sent by a unit to the collector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitReport {
    pub unit_id: Uuid,
    pub client_type: ClientType,
    /// Increases by one with every report a unit sends
    pub sequence: u64,
    /// Set on the last report a unit sends
    pub is_final: bool,
    pub snapshot: HistogramSnapshot,
}

impl UnitReport {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).context("failed to encode unit report")
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).context("failed to decode unit report")
    }
}

/// Sending half of the report channel; cheap to clone, one per unit.
#[derive(Debug, Clone)]
pub struct ReportSender {
    sender: Sender<Vec<u8>>,
}

impl ReportSender {
    pub fn send(&self, report: &UnitReport) -> Result<()> {
        let bytes = report.to_bytes()?;
        self.sender
            .send(bytes)
            .context("result collector is no longer receiving reports")
    }
}

/// Create a connected sender and collector.
pub fn report_channel(scheme: BucketScheme) -> (ReportSender, ResultCollector) {
    let (sender, receiver) = channel::unbounded();
    (
        ReportSender { sender },
        ResultCollector {
            scheme,
            receiver,
            roster: None,
            latest: HashMap::new(),
        },
    )
}

/// Keeps the newest report of every unit and merges them on completion.
#[derive(Debug)]
pub struct ResultCollector {
    scheme: BucketScheme,
    receiver: Receiver<Vec<u8>>,
    roster: Option<HashSet<Uuid>>,
    latest: HashMap<Uuid, UnitReport>,
}

impl ResultCollector {
    /// Retain `report` if it is newer than what is held for its unit.
    ///
    /// Returns whether the report was kept.
    pub fn accept(&mut self, report: UnitReport) -> bool {
        if let Some(roster) = &self.roster {
            if !roster.contains(&report.unit_id) {
                warn!(
                    "Dropping report {} from unknown unit {} ({})",
                    report.sequence, report.unit_id, report.client_type
                );
                return false;
            }
        }
        match self.latest.get(&report.unit_id) {
            Some(held) if held.is_final || held.sequence >= report.sequence => {
                debug!(
                    "Ignoring stale report {} from unit {} (holding {})",
                    report.sequence, report.unit_id, held.sequence
                );
                false
            }
            _ => {
                self.latest.insert(report.unit_id, report);
                true
            }
        }
    }

    /// Decode and accept every report already waiting in the channel.
    pub fn receive_pending(&mut self) -> usize {
        let mut received = 0;
        while let Ok(bytes) = self.receiver.try_recv() {
            self.accept_bytes(&bytes);
            received += 1;
        }
        received
    }

    fn accept_bytes(&mut self, bytes: &[u8]) {
        match UnitReport::from_bytes(bytes) {
            Ok(report) => {
                self.accept(report);
            }
            Err(e) => warn!("Dropping undecodable report: {:#}", e),
        }
    }

    /// Restrict accepted reports to the units of `roster`.
    ///
    /// Reports already held for other units are discarded.
    pub fn expect_units(&mut self, roster: &BTreeMap<Uuid, ClientType>) {
        let known: HashSet<Uuid> = roster.keys().copied().collect();
        self.latest.retain(|id, _| known.contains(id));
        self.roster = Some(known);
    }

    /// The newest report held for `unit_id`.
    pub fn latest(&self, unit_id: &Uuid) -> Option<&UnitReport> {
        self.latest.get(unit_id)
    }

    fn is_complete(&self, roster: &BTreeMap<Uuid, ClientType>) -> bool {
        roster
            .keys()
            .all(|id| self.latest.get(id).map_or(false, |report| report.is_final))
    }

    /// Receive reports until every unit in `roster` has sent its final report,
    /// the deadline passes, or all senders are gone, then merge by client type.
    ///
    /// Every client type in the roster appears in the result, empty if none of
    /// its units reported.
    pub fn collect(
        mut self,
        roster: &BTreeMap<Uuid, ClientType>,
        deadline: Instant,
    ) -> Result<BTreeMap<ClientType, AggregatedHistogram>> {
        self.expect_units(roster);
        while !self.is_complete(roster) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!("Result collection deadline passed before all units finished");
                break;
            }
            match self.receiver.recv_timeout(remaining) {
                Ok(bytes) => self.accept_bytes(&bytes),
                Err(RecvTimeoutError::Timeout) => {
                    warn!("Result collection deadline passed before all units finished");
                    break;
                }
                Err(RecvTimeoutError::Disconnected) => {
                    debug!("All report senders closed");
                    break;
                }
            }
        }
        self.receive_pending();
        self.finish(roster)
    }

    /// Merge the retained reports of the roster's units by client type.
    pub fn finish(
        self,
        roster: &BTreeMap<Uuid, ClientType>,
    ) -> Result<BTreeMap<ClientType, AggregatedHistogram>> {
        let mut snapshots = Vec::with_capacity(roster.len());
        for (unit_id, &client_type) in roster {
            match self.latest.get(unit_id) {
                None => warn!("Unit {} ({}) never reported", unit_id, client_type),
                Some(report) if report.client_type != client_type => warn!(
                    "Unit {} reported as {} but was started as {}; ignoring",
                    unit_id, report.client_type, client_type
                ),
                Some(report) => {
                    if !report.is_final {
                        warn!(
                            "Unit {} ({}) missed its final report; using report {}",
                            unit_id, client_type, report.sequence
                        );
                    }
                    snapshots.push((client_type, &report.snapshot));
                }
            }
        }

        let stray = self.latest.keys().filter(|id| !roster.contains_key(id)).count();
        if stray > 0 {
            warn!("Ignoring reports from {} unknown units", stray);
        }

        let mut groups = aggregator::merge(self.scheme, snapshots)
            .context("failed to merge unit reports")?;
        for &client_type in roster.values() {
            groups
                .entry(client_type)
                .or_insert_with(|| AggregatedHistogram::new(self.scheme));
        }
        Ok(groups)
    }
}
