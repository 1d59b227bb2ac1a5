//! Activation rebalancer.
//!
//! Each silo runs a [`RebalancerWorker`] that periodically compares its load
//! with its peers' and sheds activations when the cluster is skewed, and a
//! [`RebalancerMonitor`] that collects reports and fans out operator
//! control. Load is the activation count, optionally weighted with message
//! rate; imbalance math lives in [`cluster_imbalance`].
//!
//! # Orleans Reference
//!
//! Corresponds to Orleans' `Orleans.Runtime.Placement.Rebalancing`
//! namespace.

mod backoff;
mod catalog;
mod error;
mod imbalance;
mod monitor;
mod options;
mod report;
mod worker;

pub use backoff::{ExponentialBackoff, FailedSessionBackoff, FixedBackoff};
pub use catalog::{ActivationCatalog, CountingCatalog, LoadStatistics, NoopLoadStatistics};
pub use error::{ListenerError, RebalancerError};
pub use imbalance::{cluster_imbalance, dispersal_count, mean_load};
pub use monitor::{ActivationRebalancerReportListener, RebalancerMonitor, RemoteRebalancerMonitor};
pub use options::{RebalancerConfig, RebalancerConfigBuilder};
pub use report::{RebalancerStatus, RebalancingReport, RebalancingStatistics, SiloLoad};
pub use worker::{CycleOutcome, RebalancerWorker, RemoteRebalancerWorker, StopReason};
