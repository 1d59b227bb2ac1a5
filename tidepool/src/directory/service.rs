//! Distributed directory service.
//!
//! Each silo runs one [`DhtDirectoryService`]. It owns the partition the
//! ring assigns to the silo and answers for it; requests for grains owned
//! elsewhere are forwarded to the owner through the [`ClusterTransport`].
//!
//! # Routing
//!
//! - The owner of a grain is `ring.owner(grain)` under the silo's current
//!   membership view.
//! - A forwarded request arriving at a silo that is not the owner waits
//!   `forward_retry_delay` and re-resolves, giving membership a chance to
//!   settle before the request travels further.
//! - Hops are bounded by `min(max_hops, active silos)`; the deadline is
//!   shared by every hop.
//! - The owner re-checks ownership inside the same critical section that
//!   writes the partition, so a write never commits under a view that no
//!   longer assigns the grain here.
//!
//! # Membership changes
//!
//! On every new view the service drops entries pointing at silos that are
//! no longer active and splits off entries now owned by another silo. The
//! split entries are queued and handed off by
//! [`flush_handoffs`](DhtDirectoryService::flush_handoffs), which
//! [`run_handoffs`](DhtDirectoryService::run_handoffs) drives in the
//! background. When a handed-off entry conflicts with one the new owner
//! already holds, one activation survives and the loser's silo is asked,
//! through its activation catalog, to deactivate the loser.
//!
//! # Orleans Reference
//!
//! Combines Orleans' `LocalGrainDirectory` (routing, `CheckIfShouldForward`,
//! hop-limited retries), `RemoteGrainDirectory` (the remotely callable
//! surface) and `GrainDirectoryHandoffManager` (split and merge on
//! membership change, `DestroyDuplicateActivations`).

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::future::Future;
use std::rc::{Rc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};

use super::config::DirectoryConfig;
use super::context::RequestContext;
use super::error::DirectoryError;
use super::partition::{DirectoryEntry, DirectoryPartition, MergeOutcome};
use super::ring::PartitionRing;
use crate::membership::{MembershipListener, MembershipOracle, MembershipSnapshot, MembershipVersion};
use crate::transport::ClusterTransport;
use crate::types::{AddressAndTag, GrainAddress, GrainId, UnregistrationCause};
use crate::{SiloAddress, TimeProvider};

/// Per-address result of [`RemoteGrainDirectory::unregister_many`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnregisterOutcome {
    /// The address the result applies to.
    pub address: GrainAddress,
    /// Whether the owner processed the request.
    pub result: Result<(), DirectoryError>,
}

/// The remotely callable surface of a directory partition.
///
/// Every call carries a [`RequestContext`]. Callers outside the directory
/// start with `hop_count = 0`; the service increments it when forwarding.
///
/// # Register Semantics (Orleans-style)
///
/// `register()` never overwrites a live activation: the first registration
/// wins and every caller gets the surviving address back. The caller
/// compares the returned address with what it tried to register; if they
/// differ, its own activation lost and must be deactivated.
#[async_trait(?Send)]
pub trait RemoteGrainDirectory {
    /// Register `address`, returning the surviving entry.
    async fn register(
        &self,
        address: GrainAddress,
        ctx: RequestContext,
    ) -> Result<AddressAndTag, DirectoryError>;

    /// Remove `address` if it is still the registered activation.
    async fn unregister(
        &self,
        address: GrainAddress,
        cause: UnregistrationCause,
        ctx: RequestContext,
    ) -> Result<(), DirectoryError>;

    /// Apply [`unregister`](Self::unregister) to every address, batching
    /// per owner.
    async fn unregister_many(
        &self,
        addresses: Vec<GrainAddress>,
        cause: UnregistrationCause,
        ctx: RequestContext,
    ) -> Vec<UnregisterOutcome>;

    /// Remove the entry for `grain` regardless of activation.
    async fn delete_grain(&self, grain: GrainId, ctx: RequestContext) -> Result<(), DirectoryError>;

    /// Read the entry for `grain`.
    async fn lookup(&self, grain: GrainId, ctx: RequestContext)
        -> Result<AddressAndTag, DirectoryError>;

    /// Take over entries whose ownership moved to this silo.
    ///
    /// Returns the addresses that lost a merge conflict. Their hosts have
    /// already been asked to deactivate them.
    async fn accept_handoff(
        &self,
        entries: Vec<DirectoryEntry>,
    ) -> Result<Vec<GrainAddress>, DirectoryError>;
}

/// Where a request is served.
#[derive(Debug, Clone, PartialEq, Eq)]
enum RequestRoute {
    /// This silo owns the grain.
    LocalOwner,
    /// Another silo owns the grain.
    Forward { owner: SiloAddress },
}

struct DirectoryState {
    snapshot: Rc<MembershipSnapshot>,
    ring: Rc<PartitionRing>,
    partition: DirectoryPartition,
    pending_handoffs: Vec<DirectoryEntry>,
}

/// One silo's share of the distributed grain directory.
pub struct DhtDirectoryService<T: TimeProvider> {
    local: SiloAddress,
    config: DirectoryConfig,
    time: T,
    transport: Rc<dyn ClusterTransport>,
    state: RefCell<DirectoryState>,
    handoff_ready: Notify,
    stopped: Cell<bool>,
}

impl<T: TimeProvider + 'static> DhtDirectoryService<T> {
    /// Create the service and subscribe it to membership changes.
    pub fn new(
        local: SiloAddress,
        config: DirectoryConfig,
        time: T,
        transport: Rc<dyn ClusterTransport>,
        membership: &dyn MembershipOracle,
    ) -> Rc<Self> {
        let snapshot = membership.current();
        let ring = Rc::new(PartitionRing::from_snapshot(
            &snapshot,
            config.vnodes_per_silo(),
        ));
        info!(silo = %local, version = %snapshot.version, "directory service started");

        let service = Rc::new(Self {
            local,
            config,
            time,
            transport,
            state: RefCell::new(DirectoryState {
                snapshot,
                ring,
                partition: DirectoryPartition::new(),
                pending_handoffs: Vec::new(),
            }),
            handoff_ready: Notify::new(),
            stopped: Cell::new(false),
        });
        let listener: Weak<dyn MembershipListener> =
            Rc::downgrade(&service) as Weak<dyn MembershipListener>;
        membership.subscribe(listener);
        service
    }

    /// This silo's address.
    pub fn local(&self) -> &SiloAddress {
        &self.local
    }

    /// The ring for the current view.
    pub fn ring(&self) -> Rc<PartitionRing> {
        Rc::clone(&self.state.borrow().ring)
    }

    /// Version of the membership view the service currently routes with.
    pub fn membership_version(&self) -> MembershipVersion {
        self.state.borrow().snapshot.version
    }

    /// Number of entries in the local partition.
    pub fn partition_len(&self) -> usize {
        self.state.borrow().partition.len()
    }

    /// Copy of the local partition's entries.
    pub fn entries(&self) -> Vec<DirectoryEntry> {
        self.state.borrow().partition.entries()
    }

    /// Number of entries waiting to be handed off.
    pub fn pending_handoffs(&self) -> usize {
        self.state.borrow().pending_handoffs.len()
    }

    /// Read `grain` from the local partition without routing.
    ///
    /// `None` when this silo does not own the grain.
    pub fn local_lookup(&self, grain: &GrainId) -> Option<AddressAndTag> {
        let state = self.state.borrow();
        if !state.ring.is_owner(grain, &self.local) {
            return None;
        }
        let snapshot = &state.snapshot;
        Some(state.partition.lookup(grain, |s| snapshot.is_active(s)))
    }

    /// Refuse new requests.
    pub fn stop(&self) {
        info!(silo = %self.local, "directory service stopped");
        self.stopped.set(true);
    }

    /// Send queued handoff entries to their owners under the current view.
    ///
    /// Returns how many entries were delivered. Batches that fail stay
    /// queued for the next flush.
    pub async fn flush_handoffs(&self) -> usize {
        let (batches, local_losers) = self.take_handoff_batches();
        self.deactivate_duplicates(local_losers).await;
        let mut delivered = 0;

        for (owner, batch) in batches {
            let result = match self.transport.directory(&owner) {
                Ok(remote) => remote.accept_handoff(batch.clone()).await,
                Err(error) => Err(error.into()),
            };
            match result {
                Ok(losers) => {
                    delivered += batch.len();
                    info!(
                        silo = %self.local,
                        %owner,
                        entries = batch.len(),
                        duplicates = losers.len(),
                        "handed off directory entries"
                    );
                }
                Err(error) => {
                    warn!(silo = %self.local, %owner, %error, "handoff failed, requeueing");
                    self.state.borrow_mut().pending_handoffs.extend(batch);
                }
            }
        }
        delivered
    }

    /// Background loop flushing handoffs whenever membership moves entries.
    ///
    /// Retries failed handoffs every `forward_retry_delay` until they are
    /// delivered or the shutdown signal flips to `true`.
    pub async fn run_handoffs(&self, mut shutdown: watch::Receiver<bool>) {
        while !*shutdown.borrow() {
            tokio::select! {
                _ = self.handoff_ready.notified() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            }

            self.flush_handoffs().await;
            if self.pending_handoffs() > 0 {
                if self
                    .time
                    .sleep(self.config.forward_retry_delay())
                    .await
                    .is_err()
                {
                    break;
                }
                self.handoff_ready.notify_one();
            }
        }
        debug!(silo = %self.local, "handoff loop stopped");
    }

    fn hop_limit(&self, snapshot: &MembershipSnapshot) -> u32 {
        let active = u32::try_from(snapshot.active_count()).unwrap_or(u32::MAX);
        self.config.max_hops().min(active.max(1))
    }

    fn route(&self, grain: &GrainId, ctx: &RequestContext) -> Result<RequestRoute, DirectoryError> {
        if self.stopped.get() {
            return Err(DirectoryError::Stopped);
        }
        let state = self.state.borrow();
        let owner = state.ring.owner(grain).ok_or(DirectoryError::NoActiveSilos)?;
        if owner == self.local {
            return Ok(RequestRoute::LocalOwner);
        }

        let limit = self.hop_limit(&state.snapshot);
        if ctx.hop_count >= limit {
            warn!(
                silo = %self.local,
                %grain,
                hop_count = ctx.hop_count,
                limit,
                "hop limit exceeded"
            );
            return Err(DirectoryError::HopLimitExceeded {
                grain: grain.clone(),
                hop_count: ctx.hop_count,
                limit,
            });
        }
        Ok(RequestRoute::Forward { owner })
    }

    async fn resolve(
        &self,
        grain: &GrainId,
        ctx: &RequestContext,
    ) -> Result<RequestRoute, DirectoryError> {
        match self.route(grain, ctx)? {
            RequestRoute::Forward { owner } if ctx.hop_count > 0 => {
                debug!(
                    silo = %self.local,
                    %grain,
                    %owner,
                    hop_count = ctx.hop_count,
                    "forwarded request reached a non-owner, rechecking"
                );
                self.pause(ctx, self.config.forward_retry_delay()).await?;
                self.route(grain, ctx)
            }
            route => Ok(route),
        }
    }

    async fn pause(&self, ctx: &RequestContext, delay: Duration) -> Result<(), DirectoryError> {
        match ctx.deadline.remaining(self.time.now()) {
            Some(left) if left > delay => self
                .time
                .sleep(delay)
                .await
                .map_err(|_| DirectoryError::Stopped),
            _ => Err(DirectoryError::DeadlineExceeded),
        }
    }

    async fn forward<R, F, Fut>(
        &self,
        owner: &SiloAddress,
        ctx: &RequestContext,
        call: F,
    ) -> Result<R, DirectoryError>
    where
        F: Fn(Rc<dyn RemoteGrainDirectory>, RequestContext) -> Fut,
        Fut: Future<Output = Result<R, DirectoryError>>,
    {
        let next = ctx.forwarded();
        let mut attempt = 0;
        loop {
            let remaining = ctx
                .deadline
                .remaining(self.time.now())
                .ok_or(DirectoryError::DeadlineExceeded)?;
            let result = match self.transport.directory(owner) {
                Ok(remote) => self
                    .time
                    .timeout(remaining, call(remote, next))
                    .await
                    .unwrap_or_else(|_| Err(DirectoryError::DeadlineExceeded)),
                Err(error) => Err(error.into()),
            };

            match result {
                Err(DirectoryError::Transport(error)) if attempt < self.config.forward_retries() => {
                    attempt += 1;
                    debug!(silo = %self.local, %owner, %error, attempt, "forward failed, retrying");
                    self.pause(ctx, self.config.forward_retry_delay()).await?;
                }
                other => return other,
            }
        }
    }

    /// Run `op` against the partition if this silo still owns `grain`.
    fn commit<R>(
        &self,
        grain: &GrainId,
        op: impl FnOnce(&mut DirectoryState, Duration) -> Result<R, DirectoryError>,
    ) -> Result<R, DirectoryError> {
        let now = self.time.now();
        let mut state = self.state.borrow_mut();
        let owner = state.ring.owner(grain);
        if owner.as_ref() != Some(&self.local) {
            debug!(silo = %self.local, %grain, ?owner, "rejecting write under stale ownership");
            return Err(DirectoryError::NotOwner {
                grain: grain.clone(),
                owner,
            });
        }
        op(&mut *state, now)
    }

    fn unregister_local(
        &self,
        address: &GrainAddress,
        cause: UnregistrationCause,
    ) -> Result<(), DirectoryError> {
        let grace = self.config.lazy_deregistration_delay();
        self.commit(&address.grain_id, |state, now| {
            let removed = state.partition.unregister(address, cause, now, grace);
            debug!(%address, ?cause, removed, "unregister");
            Ok(())
        })
    }

    /// Ask the hosts of `losers` to deactivate them, one call per host.
    ///
    /// Failures are logged; the duplicate then lives until its host
    /// notices on its own.
    async fn deactivate_duplicates(&self, losers: Vec<GrainAddress>) {
        let mut by_host: BTreeMap<SiloAddress, Vec<GrainAddress>> = BTreeMap::new();
        for loser in losers {
            warn!(silo = %self.local, %loser, "duplicate activation lost directory merge");
            by_host.entry(loser.silo.clone()).or_default().push(loser);
        }

        for (host, addresses) in by_host {
            let count = addresses.len();
            let result = match self.transport.catalog(&host) {
                Ok(catalog) => catalog.deactivate_addresses(addresses).await,
                Err(error) => Err(error.into()),
            };
            match result {
                Ok(deactivated) => info!(
                    silo = %self.local,
                    %host,
                    count,
                    deactivated,
                    "destroyed duplicate activations"
                ),
                Err(error) => warn!(
                    silo = %self.local,
                    %host,
                    count,
                    %error,
                    "failed to destroy duplicate activations"
                ),
            }
        }
    }

    /// Split queued entries into per-owner batches, merging the ones this
    /// silo owns again. Also returns the local merge losers.
    fn take_handoff_batches(
        &self,
    ) -> (BTreeMap<SiloAddress, Vec<DirectoryEntry>>, Vec<GrainAddress>) {
        let mut state = self.state.borrow_mut();
        let pending = std::mem::take(&mut state.pending_handoffs);
        let snapshot = Rc::clone(&state.snapshot);
        let ring = Rc::clone(&state.ring);

        let mut batches: BTreeMap<SiloAddress, Vec<DirectoryEntry>> = BTreeMap::new();
        let mut losers = Vec::new();
        for entry in pending {
            if !snapshot.is_active(&entry.address.silo) {
                continue;
            }
            match ring.owner(&entry.address.grain_id) {
                Some(owner) if owner == self.local => {
                    if let MergeOutcome::Rejected(loser) =
                        state.partition.merge(entry, |s| snapshot.is_active(s))
                    {
                        losers.push(loser);
                    }
                }
                Some(owner) => batches.entry(owner).or_default().push(entry),
                None => state.pending_handoffs.push(entry),
            }
        }
        (batches, losers)
    }
}

#[async_trait(?Send)]
impl<T: TimeProvider + 'static> RemoteGrainDirectory for DhtDirectoryService<T> {
    async fn register(
        &self,
        address: GrainAddress,
        ctx: RequestContext,
    ) -> Result<AddressAndTag, DirectoryError> {
        match self.resolve(&address.grain_id, &ctx).await? {
            RequestRoute::LocalOwner => self.commit(&address.grain_id, |state, now| {
                if !state.snapshot.is_active(&address.silo) {
                    return Err(DirectoryError::InvalidSilo(address.silo.clone()));
                }
                let snapshot = Rc::clone(&state.snapshot);
                let result = state
                    .partition
                    .register(address.clone(), now, |s| snapshot.is_active(s));
                debug!(
                    silo = %self.local,
                    %address,
                    version_tag = %result.version_tag,
                    won = result.address.as_ref() == Some(&address),
                    hop_count = ctx.hop_count,
                    "register"
                );
                Ok(result)
            }),
            RequestRoute::Forward { owner } => {
                debug!(silo = %self.local, %address, %owner, "forwarding register");
                self.forward(&owner, &ctx, |remote, next| {
                    let address = address.clone();
                    async move { remote.register(address, next).await }
                })
                .await
            }
        }
    }

    async fn unregister(
        &self,
        address: GrainAddress,
        cause: UnregistrationCause,
        ctx: RequestContext,
    ) -> Result<(), DirectoryError> {
        match self.resolve(&address.grain_id, &ctx).await? {
            RequestRoute::LocalOwner => self.unregister_local(&address, cause),
            RequestRoute::Forward { owner } => {
                self.forward(&owner, &ctx, |remote, next| {
                    let address = address.clone();
                    async move { remote.unregister(address, cause, next).await }
                })
                .await
            }
        }
    }

    async fn unregister_many(
        &self,
        addresses: Vec<GrainAddress>,
        cause: UnregistrationCause,
        ctx: RequestContext,
    ) -> Vec<UnregisterOutcome> {
        let mut outcomes = Vec::with_capacity(addresses.len());
        let mut batches: BTreeMap<SiloAddress, Vec<GrainAddress>> = BTreeMap::new();

        for address in addresses {
            match self.route(&address.grain_id, &ctx) {
                Ok(RequestRoute::LocalOwner) => {
                    let result = self.unregister_local(&address, cause);
                    outcomes.push(UnregisterOutcome { address, result });
                }
                Ok(RequestRoute::Forward { owner }) => {
                    batches.entry(owner).or_default().push(address);
                }
                Err(error) => outcomes.push(UnregisterOutcome {
                    address,
                    result: Err(error),
                }),
            }
        }

        for (owner, batch) in batches {
            debug!(silo = %self.local, %owner, count = batch.len(), "forwarding unregister batch");
            let forwarded = self
                .forward(&owner, &ctx, |remote, next| {
                    let batch = batch.clone();
                    async move { Ok(remote.unregister_many(batch, cause, next).await) }
                })
                .await;
            match forwarded {
                Ok(remote_outcomes) => outcomes.extend(remote_outcomes),
                Err(error) => outcomes.extend(batch.into_iter().map(|address| UnregisterOutcome {
                    address,
                    result: Err(error.clone()),
                })),
            }
        }
        outcomes
    }

    async fn delete_grain(&self, grain: GrainId, ctx: RequestContext) -> Result<(), DirectoryError> {
        match self.resolve(&grain, &ctx).await? {
            RequestRoute::LocalOwner => self.commit(&grain, |state, _now| {
                let removed = state.partition.delete_grain(&grain);
                debug!(%grain, removed = removed.is_some(), "delete grain");
                Ok(())
            }),
            RequestRoute::Forward { owner } => {
                self.forward(&owner, &ctx, |remote, next| {
                    let grain = grain.clone();
                    async move { remote.delete_grain(grain, next).await }
                })
                .await
            }
        }
    }

    async fn lookup(
        &self,
        grain: GrainId,
        ctx: RequestContext,
    ) -> Result<AddressAndTag, DirectoryError> {
        match self.resolve(&grain, &ctx).await? {
            RequestRoute::LocalOwner => self.commit(&grain, |state, _now| {
                let snapshot = &state.snapshot;
                Ok(state.partition.lookup(&grain, |s| snapshot.is_active(s)))
            }),
            RequestRoute::Forward { owner } => {
                self.forward(&owner, &ctx, |remote, next| {
                    let grain = grain.clone();
                    async move { remote.lookup(grain, next).await }
                })
                .await
            }
        }
    }

    async fn accept_handoff(
        &self,
        entries: Vec<DirectoryEntry>,
    ) -> Result<Vec<GrainAddress>, DirectoryError> {
        if self.stopped.get() {
            return Err(DirectoryError::Stopped);
        }

        let mut losers = Vec::new();
        let mut misrouted = 0;
        {
            let mut state = self.state.borrow_mut();
            let snapshot = Rc::clone(&state.snapshot);
            let ring = Rc::clone(&state.ring);
            for entry in entries {
                if !snapshot.is_active(&entry.address.silo) {
                    continue;
                }
                if !ring.is_owner(&entry.address.grain_id, &self.local) {
                    // Views disagree; pass it on once ours settles.
                    misrouted += 1;
                    state.pending_handoffs.push(entry);
                    continue;
                }
                if let MergeOutcome::Rejected(loser) =
                    state.partition.merge(entry, |s| snapshot.is_active(s))
                {
                    losers.push(loser);
                }
            }
        }

        if misrouted > 0 {
            debug!(silo = %self.local, misrouted, "requeued handoff entries owned elsewhere");
            self.handoff_ready.notify_one();
        }
        self.deactivate_duplicates(losers.clone()).await;
        Ok(losers)
    }
}

impl<T: TimeProvider + 'static> MembershipListener for DhtDirectoryService<T> {
    fn on_membership_changed(&self, snapshot: Rc<MembershipSnapshot>) {
        let (purged, moved) = {
            let mut state = self.state.borrow_mut();
            if snapshot.version <= state.snapshot.version {
                return;
            }

            let ring = Rc::new(PartitionRing::from_snapshot(
                &snapshot,
                self.config.vnodes_per_silo(),
            ));
            let purged = state.partition.remove_dead(|s| snapshot.is_active(s)).len();
            state
                .pending_handoffs
                .retain(|entry| snapshot.is_active(&entry.address.silo));
            let moved = state
                .partition
                .split(|grain| ring.is_owner(grain, &self.local));
            let moved_count = moved.len();
            state.pending_handoffs.extend(moved);
            state.ring = ring;
            state.snapshot = Rc::clone(&snapshot);
            (purged, moved_count)
        };

        info!(
            silo = %self.local,
            version = %snapshot.version,
            purged,
            moved,
            "directory adjusted to membership change"
        );
        if moved > 0 {
            self.handoff_ready.notify_one();
        }
    }
}
