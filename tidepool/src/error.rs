//! Error types shared across tidepool modules.
//!
//! Subsystem errors live next to their subsystem
//! ([`DirectoryError`](crate::directory::DirectoryError),
//! [`RebalancerError`](crate::rebalancer::RebalancerError),
//! [`TransportError`](crate::transport::TransportError)). This module holds
//! the ones every configuration builder returns.

use thiserror::Error;

/// Invalid configuration rejected by a builder.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    /// A count that must be positive was zero.
    #[error("{field} must be greater than zero")]
    Zero {
        /// Name of the offending field.
        field: &'static str,
    },

    /// A ratio fell outside its allowed range.
    #[error("{field} must be within [{min}, {max}], got {value}")]
    OutOfRange {
        /// Name of the offending field.
        field: &'static str,
        /// Rejected value.
        value: f64,
        /// Inclusive lower bound.
        min: f64,
        /// Inclusive upper bound.
        max: f64,
    },

    /// Two fields are inconsistent with each other.
    #[error("{0}")]
    Inconsistent(String),
}
