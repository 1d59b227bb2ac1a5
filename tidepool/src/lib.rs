//! # Tidepool
//!
//! Distributed grain directory and activation rebalancer for an
//! Orleans-style virtual actor runtime.
//!
//! ## Crate Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      tidepool (this crate)                   │
//! │  directory                       rebalancer                  │
//! │  • PartitionRing (vnodes)        • RebalancerWorker sessions │
//! │  • DirectoryPartition            • imbalance math, backoff   │
//! │  • DhtDirectoryService routing   • RebalancerMonitor         │
//! │  • GrainLocator cache                                        │
//! ├──────────────────────────────────────────────────────────────┤
//! │  membership • transport seam • silo wiring                   │
//! ├──────────────────────────────────────────────────────────────┤
//! │                      tidepool-core                           │
//! │  TimeProvider • NetworkAddress • SiloAddress                 │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! All state is single-threaded (`Rc`/`RefCell`) and every async trait is
//! `?Send`; run silos on a current-thread runtime or a `LocalSet`.
//!
//! ## Documentation
//!
//! - [`directory`] - Grain directory: ring, partition, routing, locator
//! - [`rebalancer`] - Activation rebalancer: worker, monitor, reports
//! - [`membership`] - Cluster membership views
//! - [`transport`] - How silos reach each other
//! - [`silo`] - Wiring one silo together

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

pub mod directory;
pub mod error;
pub mod membership;
pub mod rebalancer;
pub mod silo;
pub mod transport;
pub mod types;

pub use tidepool_core::{
    NetworkAddress, NetworkAddressParseError, SiloAddress, TimeError, TimeProvider,
    TokioTimeProvider,
};
