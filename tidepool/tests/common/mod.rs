//! Shared harness for multi-silo tests.

#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};
use std::rc::Rc;
use std::time::Duration;

use async_trait::async_trait;
use tidepool::directory::{Deadline, DirectoryConfig, RequestContext};
use tidepool::membership::{MembershipOracle, SharedMembership};
use tidepool::rebalancer::{ActivationCatalog, RebalancerConfig, RebalancerError};
use tidepool::silo::Silo;
use tidepool::transport::InProcessTransport;
use tidepool::types::{ActivationId, GrainAddress, GrainId, GrainType};
use tidepool::{NetworkAddress, SiloAddress, TimeProvider, TokioTimeProvider};

pub const TEST_GRAIN_TYPE: GrainType = GrainType(0x6772_6169_6e);

/// Install a test subscriber once; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

pub fn silo(port: u16) -> SiloAddress {
    SiloAddress::new(NetworkAddress::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port), 1)
}

pub fn grain(key: &str) -> GrainId {
    GrainId::new(TEST_GRAIN_TYPE, key)
}

pub fn activation(grain: &GrainId, host: &SiloAddress) -> GrainAddress {
    GrainAddress::new(grain.clone(), host.clone(), ActivationId::random())
}

/// Context for a fresh request from outside the directory.
pub fn ctx(time: &TokioTimeProvider, timeout: Duration) -> RequestContext {
    RequestContext::new(Deadline::after(time.now(), timeout))
}

/// Directory settings with a short retry delay so paused-clock tests stay
/// quick to reason about.
pub fn directory_config() -> DirectoryConfig {
    DirectoryConfig::builder()
        .forward_retry_delay(Duration::from_millis(100))
        .forward_retries(2)
        .request_timeout(Duration::from_secs(5))
        .build()
        .expect("valid directory config")
}

/// Activation counts of every silo, shared by their catalogs.
///
/// Deactivating on one silo re-places the activations on the least loaded
/// other silo, the way a runtime would on the grains' next call. Addresses
/// deactivated by name are recorded in `destroyed` and not re-placed.
#[derive(Clone, Default)]
pub struct Placement {
    pub counts: Rc<RefCell<BTreeMap<SiloAddress, u64>>>,
    pub batches: Rc<RefCell<Vec<u64>>>,
    pub destroyed: Rc<RefCell<Vec<GrainAddress>>>,
}

impl Placement {
    pub fn catalog(&self, silo: SiloAddress, count: u64) -> Rc<PlacedCatalog> {
        self.counts.borrow_mut().insert(silo.clone(), count);
        Rc::new(PlacedCatalog {
            silo,
            placement: self.clone(),
        })
    }

    pub fn loads(&self) -> Vec<f64> {
        self.counts.borrow().values().map(|c| *c as f64).collect()
    }

    pub fn total(&self) -> u64 {
        self.counts.borrow().values().sum()
    }
}

pub struct PlacedCatalog {
    silo: SiloAddress,
    placement: Placement,
}

#[async_trait(?Send)]
impl ActivationCatalog for PlacedCatalog {
    fn activation_count(&self) -> u64 {
        self.placement
            .counts
            .borrow()
            .get(&self.silo)
            .copied()
            .unwrap_or(0)
    }

    async fn deactivate_activations(&self, count: u64) -> Result<u64, RebalancerError> {
        let mut counts = self.placement.counts.borrow_mut();
        let local = counts.get(&self.silo).copied().unwrap_or(0);
        let moved = count.min(local);
        let target = counts
            .iter()
            .filter(|(silo, _)| **silo != self.silo)
            .min_by_key(|(_, count)| **count)
            .map(|(silo, _)| silo.clone());
        let Some(target) = target else {
            return Ok(0);
        };
        counts.insert(self.silo.clone(), local - moved);
        *counts.entry(target).or_insert(0) += moved;
        self.placement.batches.borrow_mut().push(moved);
        Ok(moved)
    }

    async fn deactivate_addresses(
        &self,
        addresses: Vec<GrainAddress>,
    ) -> Result<u64, RebalancerError> {
        let hosted: Vec<_> = addresses
            .into_iter()
            .filter(|address| address.silo == self.silo)
            .collect();
        let mut counts = self.placement.counts.borrow_mut();
        let count = counts.entry(self.silo.clone()).or_insert(0);
        *count = count.saturating_sub(hosted.len() as u64);
        let destroyed = hosted.len() as u64;
        self.placement.destroyed.borrow_mut().extend(hosted);
        Ok(destroyed)
    }
}

/// Silos sharing one transport and one membership view.
pub struct TestCluster {
    pub time: TokioTimeProvider,
    pub transport: Rc<InProcessTransport>,
    pub membership: Rc<SharedMembership>,
    pub placement: Placement,
    pub silos: Vec<Silo<TokioTimeProvider>>,
}

impl TestCluster {
    /// One active silo per port, each hosting no activations.
    pub fn new(ports: &[u16]) -> Self {
        let counts: Vec<(u16, u64)> = ports.iter().map(|p| (*p, 0)).collect();
        Self::with_rebalancer(&counts, RebalancerConfig::default())
    }

    /// One active silo per `(port, activations)` pair.
    pub fn with_rebalancer(silos: &[(u16, u64)], config: RebalancerConfig) -> Self {
        init_tracing();
        let time = TokioTimeProvider::new();
        let transport = Rc::new(InProcessTransport::new());
        let membership = Rc::new(SharedMembership::with_active_silos(
            silos.iter().map(|(port, _)| silo(*port)),
        ));
        let placement = Placement::default();

        let mut cluster = Self {
            time,
            transport,
            membership,
            placement,
            silos: Vec::new(),
        };
        for (port, count) in silos {
            let built = cluster.build_silo(silo(*port), *count, config.clone());
            cluster.silos.push(built);
        }
        cluster
    }

    /// Build a silo on the shared transport and membership without
    /// changing membership.
    pub fn build_silo(
        &self,
        address: SiloAddress,
        activations: u64,
        config: RebalancerConfig,
    ) -> Silo<TokioTimeProvider> {
        let membership: Rc<dyn MembershipOracle> = self.membership.clone();
        Silo::builder()
            .address(address.clone())
            .time(self.time.clone())
            .transport(self.transport.clone())
            .membership(membership)
            .directory_config(directory_config())
            .rebalancer_config(config)
            .catalog(self.placement.catalog(address, activations))
            .build()
            .expect("build silo")
    }

    pub fn silo(&self, address: &SiloAddress) -> &Silo<TokioTimeProvider> {
        self.silos
            .iter()
            .find(|s| s.address() == address)
            .expect("silo in cluster")
    }

    pub fn owner_of(&self, grain: &GrainId) -> SiloAddress {
        self.silos[0]
            .directory()
            .ring()
            .owner(grain)
            .expect("cluster has active silos")
    }

    /// First `grain-{i}` key owned by a silo other than `not_owner`.
    pub fn grain_not_owned_by(&self, not_owner: &SiloAddress) -> GrainId {
        (0..)
            .map(|i| grain(&format!("grain-{i}")))
            .find(|g| &self.owner_of(g) != not_owner)
            .expect("some grain is owned elsewhere")
    }

    pub fn ctx(&self) -> RequestContext {
        ctx(&self.time, Duration::from_secs(5))
    }
}
