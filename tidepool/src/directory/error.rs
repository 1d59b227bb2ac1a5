use thiserror::Error;

use crate::transport::TransportError;
use crate::types::GrainId;
use crate::SiloAddress;

/// Errors from directory operations.
///
/// Cloneable so a batch failure can be reported against every address of
/// the batch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DirectoryError {
    /// The request was forwarded too many times without reaching the owner.
    #[error("hop limit exceeded for {grain}: {hop_count} hops (limit {limit})")]
    HopLimitExceeded {
        /// The grain being routed.
        grain: GrainId,
        /// Hops taken so far.
        hop_count: u32,
        /// Effective limit.
        limit: u32,
    },

    /// The operation deadline passed.
    #[error("directory request deadline exceeded")]
    DeadlineExceeded,

    /// This silo does not own the grain under its current view.
    #[error("not the owner of {grain}; current owner is {owner:?}")]
    NotOwner {
        /// The grain being written.
        grain: GrainId,
        /// The owner under the current view, if any.
        owner: Option<SiloAddress>,
    },

    /// The activation's silo is not active in the current view.
    #[error("silo is not active: {0}")]
    InvalidSilo(SiloAddress),

    /// The membership view has no active silo.
    #[error("no active silos")]
    NoActiveSilos,

    /// The owner could not be reached.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// The directory service has been stopped.
    #[error("directory stopped")]
    Stopped,
}

impl DirectoryError {
    /// Whether retrying the operation later may succeed.
    ///
    /// Routing, ownership and transport failures clear up once membership
    /// settles.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::HopLimitExceeded { .. }
                | Self::NotOwner { .. }
                | Self::Transport(_)
                | Self::NoActiveSilos
                | Self::DeadlineExceeded
        )
    }
}
