//! A silo: one host of the cluster with its directory and rebalancer wired
//! together.
//!
//! [`SiloBuilder`] creates the directory service, the client-side locator,
//! the rebalancer worker and monitor, and binds their remote surfaces into
//! an [`InProcessTransport`] so other silos in the process can reach them.

use std::rc::{Rc, Weak};

use tokio::sync::watch;
use tracing::info;

use crate::directory::{DhtDirectoryService, DirectoryConfig, GrainLocator, RemoteGrainDirectory};
use crate::membership::MembershipOracle;
use crate::rebalancer::{
    ActivationCatalog, CountingCatalog, FailedSessionBackoff, LoadStatistics, RebalancerConfig,
    RebalancerMonitor, RebalancerWorker, RemoteRebalancerMonitor, RemoteRebalancerWorker,
};
use crate::transport::{ClusterTransport, InProcessTransport, SiloEndpoints};
use crate::{SiloAddress, TimeProvider};

/// One running silo.
pub struct Silo<T: TimeProvider> {
    address: SiloAddress,
    directory: Rc<DhtDirectoryService<T>>,
    locator: Rc<GrainLocator<T>>,
    worker: Rc<RebalancerWorker<T>>,
    monitor: Rc<RebalancerMonitor>,
    transport: Rc<InProcessTransport>,
}

impl<T: TimeProvider + 'static> Silo<T> {
    /// Start building a silo.
    pub fn builder() -> SiloBuilder<T> {
        SiloBuilder::default()
    }

    /// The silo's address.
    pub fn address(&self) -> &SiloAddress {
        &self.address
    }

    /// The directory partition service.
    pub fn directory(&self) -> &Rc<DhtDirectoryService<T>> {
        &self.directory
    }

    /// The client-side locator.
    pub fn locator(&self) -> &Rc<GrainLocator<T>> {
        &self.locator
    }

    /// The rebalancer worker.
    pub fn worker(&self) -> &Rc<RebalancerWorker<T>> {
        &self.worker
    }

    /// The rebalancer monitor.
    pub fn monitor(&self) -> &Rc<RebalancerMonitor> {
        &self.monitor
    }

    /// Run the background loops until `shutdown` flips to `true`.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) {
        tokio::join!(
            self.directory.run_handoffs(shutdown.clone()),
            self.worker.run(shutdown),
        );
    }

    /// Stop serving directory requests and unbind from the transport.
    pub fn stop(&self) {
        self.directory.stop();
        self.transport.unbind(&self.address);
        info!(silo = %self.address, "silo stopped");
    }
}

/// Builder for [`Silo`].
///
/// # Example
///
/// ```rust,ignore
/// let silo = Silo::builder()
///     .address(address)
///     .time(TokioTimeProvider::new())
///     .transport(transport.clone())
///     .membership(membership.clone())
///     .build()?;
/// ```
pub struct SiloBuilder<T: TimeProvider> {
    address: Option<SiloAddress>,
    directory_config: DirectoryConfig,
    rebalancer_config: RebalancerConfig,
    time: Option<T>,
    transport: Option<Rc<InProcessTransport>>,
    membership: Option<Rc<dyn MembershipOracle>>,
    catalog: Option<Rc<dyn ActivationCatalog>>,
    load_statistics: Option<Rc<dyn LoadStatistics>>,
    backoff: Option<Box<dyn FailedSessionBackoff>>,
}

impl<T: TimeProvider> Default for SiloBuilder<T> {
    fn default() -> Self {
        Self {
            address: None,
            directory_config: DirectoryConfig::default(),
            rebalancer_config: RebalancerConfig::default(),
            time: None,
            transport: None,
            membership: None,
            catalog: None,
            load_statistics: None,
            backoff: None,
        }
    }
}

impl<T: TimeProvider + 'static> SiloBuilder<T> {
    /// Set the silo's address (required).
    pub fn address(mut self, address: SiloAddress) -> Self {
        self.address = Some(address);
        self
    }

    /// Set the directory configuration.
    pub fn directory_config(mut self, config: DirectoryConfig) -> Self {
        self.directory_config = config;
        self
    }

    /// Set the rebalancer configuration.
    pub fn rebalancer_config(mut self, config: RebalancerConfig) -> Self {
        self.rebalancer_config = config;
        self
    }

    /// Set the time provider (required).
    pub fn time(mut self, time: T) -> Self {
        self.time = Some(time);
        self
    }

    /// Set the transport shared by the cluster (required).
    pub fn transport(mut self, transport: Rc<InProcessTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Set the membership view this silo follows (required).
    pub fn membership(mut self, membership: Rc<dyn MembershipOracle>) -> Self {
        self.membership = Some(membership);
        self
    }

    /// Set the activation catalog. Defaults to an empty [`CountingCatalog`].
    pub fn catalog(mut self, catalog: Rc<dyn ActivationCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Set the message-rate source.
    pub fn load_statistics(mut self, load_statistics: Rc<dyn LoadStatistics>) -> Self {
        self.load_statistics = Some(load_statistics);
        self
    }

    /// Set the failed-session backoff.
    pub fn backoff(mut self, backoff: Box<dyn FailedSessionBackoff>) -> Self {
        self.backoff = Some(backoff);
        self
    }

    /// Create the silo and bind its endpoints into the transport.
    ///
    /// # Errors
    ///
    /// Returns an error if a required field is missing.
    pub fn build(self) -> Result<Silo<T>, SiloBuildError> {
        let address = self.address.ok_or(SiloBuildError::MissingAddress)?;
        let time = self.time.ok_or(SiloBuildError::MissingTime)?;
        let transport = self.transport.ok_or(SiloBuildError::MissingTransport)?;
        let membership = self.membership.ok_or(SiloBuildError::MissingMembership)?;
        let catalog = self
            .catalog
            .unwrap_or_else(|| {
                Rc::new(CountingCatalog::for_silo(address.clone(), 0)) as Rc<dyn ActivationCatalog>
            });
        let catalog_endpoint: Weak<dyn ActivationCatalog> = Rc::downgrade(&catalog);
        let cluster: Rc<dyn ClusterTransport> = transport.clone();

        let directory = DhtDirectoryService::new(
            address.clone(),
            self.directory_config.clone(),
            time.clone(),
            Rc::clone(&cluster),
            membership.as_ref(),
        );
        let locator = GrainLocator::new(
            Rc::clone(&directory) as Rc<dyn RemoteGrainDirectory>,
            time.clone(),
            self.directory_config.request_timeout(),
            membership.as_ref(),
        );

        let mut worker = RebalancerWorker::new(
            address.clone(),
            self.rebalancer_config,
            time,
            Rc::clone(&cluster),
            Rc::clone(&membership),
            catalog,
        );
        if let Some(backoff) = self.backoff {
            worker = worker.with_backoff(backoff);
        }
        if let Some(load_statistics) = self.load_statistics {
            worker = worker.with_load_statistics(load_statistics);
        }
        let worker = Rc::new(worker);
        let monitor = Rc::new(RebalancerMonitor::new(
            address.clone(),
            cluster,
            membership,
            Rc::clone(&worker) as Rc<dyn RemoteRebalancerWorker>,
        ));

        let directory_endpoint: Weak<dyn RemoteGrainDirectory> =
            Rc::downgrade(&directory) as Weak<dyn RemoteGrainDirectory>;
        let worker_endpoint: Weak<dyn RemoteRebalancerWorker> =
            Rc::downgrade(&worker) as Weak<dyn RemoteRebalancerWorker>;
        let monitor_endpoint: Weak<dyn RemoteRebalancerMonitor> =
            Rc::downgrade(&monitor) as Weak<dyn RemoteRebalancerMonitor>;
        transport.bind(
            address.clone(),
            SiloEndpoints {
                directory: Some(directory_endpoint),
                rebalancer: Some(worker_endpoint),
                monitor: Some(monitor_endpoint),
                catalog: Some(catalog_endpoint),
            },
        );
        info!(silo = %address, "silo started");

        Ok(Silo {
            address,
            directory,
            locator,
            worker,
            monitor,
            transport,
        })
    }
}

/// Errors from [`SiloBuilder::build`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SiloBuildError {
    /// No address was set.
    #[error("silo requires an address (call address())")]
    MissingAddress,

    /// No time provider was set.
    #[error("silo requires a time provider (call time())")]
    MissingTime,

    /// No transport was set.
    #[error("silo requires a transport (call transport())")]
    MissingTransport,

    /// No membership view was set.
    #[error("silo requires a membership view (call membership())")]
    MissingMembership,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::SharedMembership;
    use crate::{NetworkAddress, TokioTimeProvider};
    use std::net::{IpAddr, Ipv4Addr};

    fn silo(port: u16) -> SiloAddress {
        SiloAddress::new(NetworkAddress::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port), 1)
    }

    #[test]
    fn test_missing_fields() {
        let result = Silo::<TokioTimeProvider>::builder().build();
        assert!(matches!(result, Err(SiloBuildError::MissingAddress)));

        let result = Silo::builder()
            .address(silo(1))
            .time(TokioTimeProvider::new())
            .build();
        assert!(matches!(result, Err(SiloBuildError::MissingTransport)));
    }

    #[tokio::test]
    async fn test_build_binds_endpoints() {
        let transport = Rc::new(InProcessTransport::new());
        let membership: Rc<dyn MembershipOracle> =
            Rc::new(SharedMembership::with_active_silos([silo(1)]));
        let built = Silo::builder()
            .address(silo(1))
            .time(TokioTimeProvider::new())
            .transport(transport.clone())
            .membership(membership)
            .build()
            .expect("build");

        assert!(transport.directory(&silo(1)).is_ok());
        assert!(transport.rebalancer(&silo(1)).is_ok());
        assert!(transport.monitor(&silo(1)).is_ok());
        assert!(transport.catalog(&silo(1)).is_ok());

        built.stop();
        assert!(transport.directory(&silo(1)).is_err());
    }
}
