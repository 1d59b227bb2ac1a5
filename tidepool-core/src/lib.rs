//! # tidepool-core
//!
//! Core abstractions shared by the tidepool crates.
//!
//! - **Provider traits**: [`TimeProvider`] abstracts sleeping, timeouts and
//!   the current time so directory and rebalancer code can run against a
//!   paused clock in tests.
//! - **Addressing types**: [`NetworkAddress`] and [`SiloAddress`] identify
//!   the hosts of a cluster.

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

mod time;
mod types;

pub use time::{TimeError, TimeProvider, TokioTimeProvider};
pub use types::{NetworkAddress, NetworkAddressParseError, SiloAddress};
