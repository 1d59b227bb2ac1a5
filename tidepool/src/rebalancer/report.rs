//! Reports and load snapshots exchanged by rebalancer workers.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::SiloAddress;

/// Whether a worker is running sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RebalancerStatus {
    /// Sessions may run.
    Executing,
    /// No session runs until the suspension ends or a resume arrives.
    Suspended,
}

impl std::fmt::Display for RebalancerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Executing => write!(f, "Executing"),
            Self::Suspended => write!(f, "Suspended"),
        }
    }
}

/// Migration counters of one silo. Diagnostic only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RebalancingStatistics {
    /// When the counters were last updated, per the reporting silo's clock.
    pub timestamp: Duration,
    /// The silo the counters describe.
    pub silo: SiloAddress,
    /// Activations this silo deactivated to shed load.
    pub dispersed_activations: u64,
    /// Activations this silo gained while at or under the cluster mean.
    pub acquired_activations: u64,
}

impl RebalancingStatistics {
    /// Zeroed counters for `silo`.
    pub fn new(silo: SiloAddress) -> Self {
        Self {
            timestamp: Duration::ZERO,
            silo,
            dispersed_activations: 0,
            acquired_activations: 0,
        }
    }
}

/// Snapshot of a worker's state, pushed to monitors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RebalancingReport {
    /// The silo that produced the report.
    pub host: SiloAddress,
    /// Current status.
    pub status: RebalancerStatus,
    /// Remaining suspension; `Duration::MAX` for an indefinite one, `None`
    /// while executing.
    pub suspension_duration: Option<Duration>,
    /// Last computed cluster imbalance, in `[0, 1]`.
    pub cluster_imbalance: f64,
    /// Counters for every silo the worker has heard from, itself included.
    pub statistics: Vec<RebalancingStatistics>,
}

impl RebalancingReport {
    /// Whether the report says the host was suspended.
    pub fn is_suspended(&self) -> bool {
        self.status == RebalancerStatus::Suspended
    }
}

/// Load snapshot one worker shares with its peers each cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiloLoad {
    /// The silo the snapshot describes.
    pub silo: SiloAddress,
    /// Activations hosted.
    pub activation_count: u64,
    /// Recent messages per second.
    pub message_rate: f64,
    /// Weighted load used for the imbalance computation.
    pub load: f64,
    /// The silo's migration counters.
    pub statistics: RebalancingStatistics,
}
