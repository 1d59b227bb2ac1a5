//! Cluster transport seam.
//!
//! The directory and the rebalancer never talk to sockets. They ask a
//! [`ClusterTransport`] for the remote surface of another silo and call it
//! like a local object. A networked transport would hand out RPC proxies;
//! [`InProcessTransport`] hands out the real objects of other silos living
//! in the same process, which is what tests and single-process clusters use.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::rc::{Rc, Weak};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::directory::RemoteGrainDirectory;
use crate::rebalancer::{ActivationCatalog, RemoteRebalancerMonitor, RemoteRebalancerWorker};
use crate::SiloAddress;

/// Failure to reach a remote silo.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum TransportError {
    /// The silo is known but cannot be reached right now.
    #[error("silo unreachable: {0}")]
    Unreachable(SiloAddress),

    /// No endpoint is registered for the silo.
    #[error("unknown silo: {0}")]
    UnknownSilo(SiloAddress),
}

/// Resolves silo addresses to their remotely callable surfaces.
pub trait ClusterTransport: fmt::Debug {
    /// The directory partition service of `silo`.
    fn directory(&self, silo: &SiloAddress) -> Result<Rc<dyn RemoteGrainDirectory>, TransportError>;

    /// The rebalancer worker of `silo`.
    fn rebalancer(
        &self,
        silo: &SiloAddress,
    ) -> Result<Rc<dyn RemoteRebalancerWorker>, TransportError>;

    /// The rebalancer monitor of `silo`.
    fn monitor(&self, silo: &SiloAddress) -> Result<Rc<dyn RemoteRebalancerMonitor>, TransportError>;

    /// The activation catalog of `silo`.
    fn catalog(&self, silo: &SiloAddress) -> Result<Rc<dyn ActivationCatalog>, TransportError>;
}

/// Remote surfaces one silo exposes to the rest of the cluster.
#[derive(Default)]
pub struct SiloEndpoints {
    /// Directory partition service.
    pub directory: Option<Weak<dyn RemoteGrainDirectory>>,
    /// Rebalancer worker.
    pub rebalancer: Option<Weak<dyn RemoteRebalancerWorker>>,
    /// Rebalancer monitor.
    pub monitor: Option<Weak<dyn RemoteRebalancerMonitor>>,
    /// Activation catalog.
    pub catalog: Option<Weak<dyn ActivationCatalog>>,
}

/// In-memory transport connecting silos that live in one process.
///
/// Holds weak references so a dropped silo becomes
/// [`TransportError::Unreachable`] instead of being kept alive.
/// [`set_unreachable`](Self::set_unreachable) injects network partitions.
#[derive(Default)]
pub struct InProcessTransport {
    silos: RefCell<BTreeMap<SiloAddress, SiloEndpoints>>,
    unreachable: RefCell<BTreeSet<SiloAddress>>,
}

impl fmt::Debug for InProcessTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InProcessTransport")
            .field("silos", &self.silos.borrow().keys().collect::<Vec<_>>())
            .field("unreachable", &self.unreachable.borrow())
            .finish()
    }
}

impl InProcessTransport {
    /// Create an empty transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the endpoints of `silo`.
    pub fn bind(&self, silo: SiloAddress, endpoints: SiloEndpoints) {
        tracing::debug!(%silo, "binding silo endpoints");
        self.silos.borrow_mut().insert(silo, endpoints);
    }

    /// Forget `silo` entirely.
    pub fn unbind(&self, silo: &SiloAddress) {
        self.silos.borrow_mut().remove(silo);
    }

    /// Simulate a partition: calls to `silo` fail with
    /// [`TransportError::Unreachable`] while set.
    pub fn set_unreachable(&self, silo: &SiloAddress, unreachable: bool) {
        let mut set = self.unreachable.borrow_mut();
        if unreachable {
            set.insert(silo.clone());
        } else {
            set.remove(silo);
        }
    }

    fn resolve<R: ?Sized>(
        &self,
        silo: &SiloAddress,
        pick: impl FnOnce(&SiloEndpoints) -> Option<&Weak<R>>,
    ) -> Result<Rc<R>, TransportError> {
        if self.unreachable.borrow().contains(silo) {
            return Err(TransportError::Unreachable(silo.clone()));
        }
        let silos = self.silos.borrow();
        let endpoints = silos
            .get(silo)
            .ok_or_else(|| TransportError::UnknownSilo(silo.clone()))?;
        pick(endpoints)
            .ok_or_else(|| TransportError::UnknownSilo(silo.clone()))?
            .upgrade()
            .ok_or_else(|| TransportError::Unreachable(silo.clone()))
    }
}

impl ClusterTransport for InProcessTransport {
    fn directory(&self, silo: &SiloAddress) -> Result<Rc<dyn RemoteGrainDirectory>, TransportError> {
        self.resolve(silo, |e| e.directory.as_ref())
    }

    fn rebalancer(
        &self,
        silo: &SiloAddress,
    ) -> Result<Rc<dyn RemoteRebalancerWorker>, TransportError> {
        self.resolve(silo, |e| e.rebalancer.as_ref())
    }

    fn monitor(&self, silo: &SiloAddress) -> Result<Rc<dyn RemoteRebalancerMonitor>, TransportError> {
        self.resolve(silo, |e| e.monitor.as_ref())
    }

    fn catalog(&self, silo: &SiloAddress) -> Result<Rc<dyn ActivationCatalog>, TransportError> {
        self.resolve(silo, |e| e.catalog.as_ref())
    }
}
