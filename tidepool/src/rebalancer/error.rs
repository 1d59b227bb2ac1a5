use thiserror::Error;

use crate::transport::TransportError;

/// Errors from rebalancer operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RebalancerError {
    /// A peer could not be reached.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// The activation catalog refused or failed a request.
    #[error("activation catalog error: {0}")]
    Catalog(String),
}

/// Returned by a report listener that can no longer accept reports.
///
/// The monitor unsubscribes a listener the first time it fails.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("report listener failed: {0}")]
pub struct ListenerError(pub String);
