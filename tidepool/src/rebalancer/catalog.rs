//! What the rebalancer needs from the activation runtime.
//!
//! The worker never touches activations directly. It reads counts from an
//! [`ActivationCatalog`] and asks it to deactivate some; the runtime picks
//! which ones and re-places them on their next call. Message rates come
//! from a [`LoadStatistics`] sink fed by the invocation path.
//!
//! The directory uses the same catalog, reached through the transport, to
//! destroy duplicate activations that lost a handoff merge.

use std::cell::Cell;

use async_trait::async_trait;

use super::RebalancerError;
use crate::SiloAddress;
use crate::types::{GrainAddress, GrainId};

/// The activations hosted by one silo.
#[async_trait(?Send)]
pub trait ActivationCatalog {
    /// Number of activations currently hosted.
    fn activation_count(&self) -> u64;

    /// Deactivate up to `count` migratable activations.
    ///
    /// Returns how many were actually deactivated.
    async fn deactivate_activations(&self, count: u64) -> Result<u64, RebalancerError>;

    /// Deactivate exactly these activations.
    ///
    /// Addresses hosted elsewhere are ignored. Returns how many were
    /// deactivated here.
    async fn deactivate_addresses(
        &self,
        addresses: Vec<GrainAddress>,
    ) -> Result<u64, RebalancerError>;
}

/// Message-rate sink fed by the invocation path.
pub trait LoadStatistics {
    /// One message was delivered to `grain` on this silo.
    fn record_message(&self, grain: &GrainId);

    /// Recent messages per second.
    fn message_rate(&self) -> f64;
}

/// Statistics sink that records nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopLoadStatistics;

impl LoadStatistics for NoopLoadStatistics {
    fn record_message(&self, _grain: &GrainId) {}

    fn message_rate(&self) -> f64 {
        0.0
    }
}

/// Catalog tracking a bare activation count.
///
/// Suitable for silos whose runtime reports activations by count only;
/// deactivation just decrements.
#[derive(Debug, Default)]
pub struct CountingCatalog {
    silo: Option<SiloAddress>,
    count: Cell<u64>,
}

impl CountingCatalog {
    /// Create a catalog holding `count` activations.
    ///
    /// Without a silo, every address passed to
    /// [`deactivate_addresses`](ActivationCatalog::deactivate_addresses)
    /// counts as hosted here.
    pub fn new(count: u64) -> Self {
        Self {
            silo: None,
            count: Cell::new(count),
        }
    }

    /// Create a catalog for the activations of `silo`.
    pub fn for_silo(silo: SiloAddress, count: u64) -> Self {
        Self {
            silo: Some(silo),
            count: Cell::new(count),
        }
    }

    /// An activation was created.
    pub fn activated(&self) {
        self.count.set(self.count.get() + 1);
    }

    /// Add `n` activations at once.
    pub fn add(&self, n: u64) {
        self.count.set(self.count.get() + n);
    }

    /// An activation went away on its own.
    pub fn deactivated(&self) {
        self.count.set(self.count.get().saturating_sub(1));
    }
}

#[async_trait(?Send)]
impl ActivationCatalog for CountingCatalog {
    fn activation_count(&self) -> u64 {
        self.count.get()
    }

    async fn deactivate_activations(&self, count: u64) -> Result<u64, RebalancerError> {
        let removed = count.min(self.count.get());
        self.count.set(self.count.get() - removed);
        Ok(removed)
    }

    async fn deactivate_addresses(
        &self,
        addresses: Vec<GrainAddress>,
    ) -> Result<u64, RebalancerError> {
        let hosted = addresses
            .iter()
            .filter(|address| {
                self.silo
                    .as_ref()
                    .map_or(true, |silo| *silo == address.silo)
            })
            .count() as u64;
        self.deactivate_activations(hosted).await
    }
}
