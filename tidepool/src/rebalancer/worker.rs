//! Per-silo rebalancer worker.
//!
//! # State machine
//!
//! ```text
//!            suspend(d) / session completed / session stagnated
//!  Executing ────────────────────────────────────────────────▶ Suspended
//!      ▲                                                          │
//!      └──────────────── resume() / suspension elapsed ───────────┘
//! ```
//!
//! Suspension is stored as an absolute `suspended_until` time, so a timed
//! suspension ends by itself without a timer. While executing, the worker
//! runs sessions: each cycle it exchanges load with every active peer,
//! computes the cluster imbalance, and, when above the threshold and above
//! the mean, deactivates a bounded batch of its activations so the runtime
//! re-places them elsewhere.
//!
//! A session ends when imbalance drops to the threshold (completed, pause
//! one cycle period) or after `max_stagnant_cycles` cycles without enough
//! improvement (stagnated, pause per the failed-session backoff).
//!
//! # Orleans Reference
//!
//! Corresponds to Orleans' `ActivationRebalancerWorker`: `StartSession`,
//! `RunSession`, `StopSession` with `StopReason`, `SuspendRebalancing`,
//! `ResumeRebalancing` and `GetReport`.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::Rc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::backoff::{ExponentialBackoff, FailedSessionBackoff};
use super::catalog::{ActivationCatalog, LoadStatistics, NoopLoadStatistics};
use super::imbalance::{cluster_imbalance, dispersal_count, mean_load};
use super::options::RebalancerConfig;
use super::report::{
    RebalancerStatus, RebalancingReport, RebalancingStatistics, SiloLoad,
};
use super::RebalancerError;
use crate::membership::MembershipOracle;
use crate::transport::ClusterTransport;
use crate::{SiloAddress, TimeProvider};

/// The remotely callable surface of a rebalancer worker.
#[async_trait(?Send)]
pub trait RemoteRebalancerWorker {
    /// Current report; `force` rebuilds it and wakes a dormant worker.
    async fn get_report(&self, force: bool) -> Result<RebalancingReport, RebalancerError>;

    /// Leave suspension and start a session.
    async fn resume_rebalancing(&self) -> Result<(), RebalancerError>;

    /// Suspend for `duration`, or indefinitely with `None`.
    async fn suspend_rebalancing(&self, duration: Option<Duration>) -> Result<(), RebalancerError>;

    /// Record a peer's load and answer with this silo's.
    async fn exchange_load(&self, peer: SiloLoad) -> Result<SiloLoad, RebalancerError>;
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Imbalance fell to the threshold.
    SessionCompleted,
    /// Too many cycles without improvement.
    SessionStagnated,
    /// An operator suspended the rebalancer.
    RebalancerSuspended,
}

/// What one cycle observed and did.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleOutcome {
    /// Imbalance computed at the start of the cycle.
    pub imbalance: f64,
    /// Mean load across the silos that answered.
    pub mean_load: f64,
    /// Activations deactivated by this silo.
    pub dispersed: u64,
    /// Activations gained since the previous cycle while not above the mean.
    pub acquired: u64,
    /// Set when the cycle ended the session.
    pub stopped: Option<StopReason>,
}

#[derive(Debug)]
struct Session {
    started_at: Duration,
    cycles: u32,
    stagnant_cycles: u32,
    previous_imbalance: Option<f64>,
}

struct WorkerState {
    suspended_until: Option<Duration>,
    session: Option<Session>,
    failed_sessions: u32,
    statistics: RebalancingStatistics,
    peers: BTreeMap<SiloAddress, RebalancingStatistics>,
    cluster_imbalance: f64,
    last_activation_count: u64,
    report: RebalancingReport,
}

impl WorkerState {
    fn suspension_remaining(&self, now: Duration) -> Option<Duration> {
        match self.suspended_until {
            Some(Duration::MAX) => Some(Duration::MAX),
            Some(until) if until > now => Some(until - now),
            _ => None,
        }
    }

    fn build_report(&self, host: &SiloAddress, now: Duration) -> RebalancingReport {
        let suspension_duration = self.suspension_remaining(now);
        let mut statistics = vec![self.statistics.clone()];
        statistics.extend(self.peers.values().cloned());
        RebalancingReport {
            host: host.clone(),
            status: if suspension_duration.is_some() {
                RebalancerStatus::Suspended
            } else {
                RebalancerStatus::Executing
            },
            suspension_duration,
            cluster_imbalance: self.cluster_imbalance,
            statistics,
        }
    }
}

/// Resets the single-flight flag when a cycle ends, however it ends.
struct CycleGuard<'a>(&'a Cell<bool>);

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

/// Background load balancer of one silo.
pub struct RebalancerWorker<T: TimeProvider> {
    local: SiloAddress,
    config: RebalancerConfig,
    time: T,
    transport: Rc<dyn ClusterTransport>,
    membership: Rc<dyn MembershipOracle>,
    catalog: Rc<dyn ActivationCatalog>,
    load_statistics: Rc<dyn LoadStatistics>,
    backoff: Box<dyn FailedSessionBackoff>,
    state: RefCell<WorkerState>,
    cycle_in_flight: Cell<bool>,
}

impl<T: TimeProvider + 'static> RebalancerWorker<T> {
    /// Create an executing worker with no session.
    ///
    /// Uses [`ExponentialBackoff`] and [`NoopLoadStatistics`] unless
    /// replaced with [`with_backoff`](Self::with_backoff) and
    /// [`with_load_statistics`](Self::with_load_statistics).
    pub fn new(
        local: SiloAddress,
        config: RebalancerConfig,
        time: T,
        transport: Rc<dyn ClusterTransport>,
        membership: Rc<dyn MembershipOracle>,
        catalog: Rc<dyn ActivationCatalog>,
    ) -> Self {
        let now = time.now();
        let mut statistics = RebalancingStatistics::new(local.clone());
        statistics.timestamp = now;
        let mut state = WorkerState {
            suspended_until: None,
            session: None,
            failed_sessions: 0,
            statistics,
            peers: BTreeMap::new(),
            cluster_imbalance: 0.0,
            last_activation_count: catalog.activation_count(),
            report: RebalancingReport {
                host: local.clone(),
                status: RebalancerStatus::Executing,
                suspension_duration: None,
                cluster_imbalance: 0.0,
                statistics: Vec::new(),
            },
        };
        state.report = state.build_report(&local, now);

        Self {
            local,
            config,
            time,
            transport,
            membership,
            catalog,
            load_statistics: Rc::new(NoopLoadStatistics),
            backoff: Box::new(ExponentialBackoff::default()),
            state: RefCell::new(state),
            cycle_in_flight: Cell::new(false),
        }
    }

    /// Replace the failed-session backoff.
    pub fn with_backoff(mut self, backoff: Box<dyn FailedSessionBackoff>) -> Self {
        self.backoff = backoff;
        self
    }

    /// Replace the message-rate source.
    pub fn with_load_statistics(mut self, load_statistics: Rc<dyn LoadStatistics>) -> Self {
        self.load_statistics = load_statistics;
        self
    }

    /// This silo's address.
    pub fn local(&self) -> &SiloAddress {
        &self.local
    }

    /// Current status.
    pub fn status(&self) -> RebalancerStatus {
        let state = self.state.borrow();
        if state.suspension_remaining(self.time.now()).is_some() {
            RebalancerStatus::Suspended
        } else {
            RebalancerStatus::Executing
        }
    }

    /// Whether a session is running.
    pub fn is_session_active(&self) -> bool {
        self.state.borrow().session.is_some()
    }

    /// Consecutive failed sessions since the last completed one.
    pub fn failed_sessions(&self) -> u32 {
        self.state.borrow().failed_sessions
    }

    /// This silo's migration counters.
    pub fn statistics(&self) -> RebalancingStatistics {
        self.state.borrow().statistics.clone()
    }

    /// This silo's current load snapshot.
    pub fn local_load(&self) -> SiloLoad {
        let activation_count = self.catalog.activation_count();
        let message_rate = self.load_statistics.message_rate();
        SiloLoad {
            silo: self.local.clone(),
            activation_count,
            message_rate,
            load: activation_count as f64 + self.config.message_rate_weight() * message_rate,
            statistics: self.state.borrow().statistics.clone(),
        }
    }

    /// Start a session unless one is running or the worker is suspended.
    ///
    /// Returns whether a session was started.
    pub fn start_session(&self) -> bool {
        let now = self.time.now();
        let mut state = self.state.borrow_mut();
        if state.session.is_some() || state.suspension_remaining(now).is_some() {
            return false;
        }
        state.suspended_until = None;
        state.session = Some(Session {
            started_at: now,
            cycles: 0,
            stagnant_cycles: 0,
            previous_imbalance: None,
        });
        info!(silo = %self.local, "rebalancing session started");
        true
    }

    /// Suspend for `duration`, or indefinitely with `None`.
    ///
    /// A running session stops; a cycle already in flight finishes without
    /// touching session state. A timed suspension never shortens one that
    /// already runs longer. The failed-session count starts over.
    pub fn suspend(&self, duration: Option<Duration>) {
        let now = self.time.now();
        let mut state = self.state.borrow_mut();
        let until = match duration {
            Some(d) => now.saturating_add(d),
            None => Duration::MAX,
        };
        state.suspended_until = Some(
            state
                .suspended_until
                .map_or(until, |current| current.max(until)),
        );
        state.failed_sessions = 0;
        if let Some(session) = state.session.take() {
            info!(
                silo = %self.local,
                reason = ?StopReason::RebalancerSuspended,
                cycles = session.cycles,
                "rebalancing session stopped"
            );
        }
        self.refresh_report(&mut state, now);
        info!(silo = %self.local, ?duration, "rebalancer suspended");
    }

    /// Leave suspension and start a session. No-op while executing.
    pub fn resume(&self) {
        let now = self.time.now();
        {
            let mut state = self.state.borrow_mut();
            if state.suspension_remaining(now).is_none() {
                return;
            }
            state.suspended_until = None;
        }
        info!(silo = %self.local, "rebalancer resumed");
        self.start_session();
        let mut state = self.state.borrow_mut();
        self.refresh_report(&mut state, now);
    }

    /// Cached report, or a fresh one with `force`.
    ///
    /// A forced report also starts a session on an executing worker that
    /// has none.
    pub fn report(&self, force: bool) -> RebalancingReport {
        if !force {
            return self.state.borrow().report.clone();
        }
        self.start_session();
        let now = self.time.now();
        let mut state = self.state.borrow_mut();
        self.refresh_report(&mut state, now);
        state.report.clone()
    }

    /// Run one session cycle.
    ///
    /// Returns `Ok(None)` when no cycle ran: no session, suspended, or a
    /// cycle already in flight.
    pub async fn run_cycle(&self) -> Result<Option<CycleOutcome>, RebalancerError> {
        if self.cycle_in_flight.replace(true) {
            return Ok(None);
        }
        let _guard = CycleGuard(&self.cycle_in_flight);

        {
            let state = self.state.borrow();
            if state.session.is_none() || state.suspension_remaining(self.time.now()).is_some() {
                return Ok(None);
            }
        }

        let local = self.local_load();
        let mut loads = vec![local.load];
        let peers = self.membership.current().active_silos();
        for peer in peers.iter().filter(|silo| **silo != self.local) {
            match self.exchange_with(peer, local.clone()).await {
                Ok(remote) => {
                    loads.push(remote.load);
                    self.state
                        .borrow_mut()
                        .peers
                        .insert(remote.silo.clone(), remote.statistics);
                }
                Err(error) => debug!(silo = %self.local, %peer, %error, "load exchange failed"),
            }
        }

        let imbalance = cluster_imbalance(&loads);
        let mean = mean_load(&loads);

        let acquired = {
            let state = self.state.borrow();
            if local.load <= mean {
                local.activation_count.saturating_sub(state.last_activation_count)
            } else {
                0
            }
        };

        let mut dispersed = 0;
        if imbalance > self.config.imbalance_threshold() && local.load > mean {
            let batch = dispersal_count(local.load, mean, self.config.max_dispersal_per_cycle());
            if batch > 0 {
                dispersed = self.catalog.deactivate_activations(batch).await?;
                info!(
                    silo = %self.local,
                    batch,
                    dispersed,
                    imbalance,
                    mean,
                    "dispersed activations"
                );
            }
        }

        let now = self.time.now();
        let (stopped, report) = {
            let mut state = self.state.borrow_mut();
            state.cluster_imbalance = imbalance;
            state.statistics.dispersed_activations += dispersed;
            state.statistics.acquired_activations += acquired;
            state.statistics.timestamp = now;
            state.last_activation_count = self.catalog.activation_count();
            let stopped = self.advance_session(&mut state, imbalance, now);
            self.refresh_report(&mut state, now);
            (stopped, state.report.clone())
        };

        debug!(
            silo = %self.local,
            imbalance,
            mean,
            dispersed,
            acquired,
            ?stopped,
            "rebalancing cycle finished"
        );
        self.push_report(report).await;

        Ok(Some(CycleOutcome {
            imbalance,
            mean_load: mean,
            dispersed,
            acquired,
            stopped,
        }))
    }

    /// Push the current report to every active silo's monitor.
    pub async fn publish_report(&self) {
        let report = {
            let now = self.time.now();
            let mut state = self.state.borrow_mut();
            self.refresh_report(&mut state, now);
            state.report.clone()
        };
        self.push_report(report).await;
    }

    /// Background loop.
    ///
    /// Waits `rebalancer_due_time`, then every `session_cycle_period` starts
    /// a session when possible and runs a cycle, pushing reports every
    /// `report_period`. Returns when the shutdown signal flips to `true`.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        if !self
            .wait(self.config.rebalancer_due_time(), &mut shutdown)
            .await
        {
            return;
        }

        let mut last_report = self.time.now();
        loop {
            self.start_session();
            if let Err(error) = self.run_cycle().await {
                warn!(silo = %self.local, %error, "rebalancing cycle failed");
            }

            let now = self.time.now();
            if now.saturating_sub(last_report) >= self.config.report_period() {
                self.publish_report().await;
                last_report = now;
            }

            if !self
                .wait(self.config.session_cycle_period(), &mut shutdown)
                .await
            {
                break;
            }
        }
        debug!(silo = %self.local, "rebalancer loop stopped");
    }

    async fn wait(&self, period: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
        if *shutdown.borrow() {
            return false;
        }
        let woke = tokio::select! {
            slept = self.time.sleep(period) => slept.is_ok(),
            changed = shutdown.changed() => changed.is_ok(),
        };
        woke && !*shutdown.borrow()
    }

    async fn exchange_with(
        &self,
        peer: &SiloAddress,
        local: SiloLoad,
    ) -> Result<SiloLoad, RebalancerError> {
        let remote = self.transport.rebalancer(peer)?;
        remote.exchange_load(local).await
    }

    async fn push_report(&self, report: RebalancingReport) {
        for silo in self.membership.current().active_silos() {
            let monitor = match self.transport.monitor(&silo) {
                Ok(monitor) => monitor,
                Err(error) => {
                    debug!(%silo, %error, "monitor unreachable");
                    continue;
                }
            };
            if let Err(error) = monitor.report(report.clone()).await {
                debug!(%silo, %error, "report push failed");
            }
        }
    }

    /// Drop counters of silos that left the active set, then rebuild the
    /// cached report.
    fn refresh_report(&self, state: &mut WorkerState, now: Duration) {
        let snapshot = self.membership.current();
        let before = state.peers.len();
        state.peers.retain(|silo, _| snapshot.is_active(silo));
        let pruned = before - state.peers.len();
        if pruned > 0 {
            debug!(silo = %self.local, pruned, "dropped statistics of inactive silos");
        }
        state.report = state.build_report(&self.local, now);
    }

    fn advance_session(
        &self,
        state: &mut WorkerState,
        imbalance: f64,
        now: Duration,
    ) -> Option<StopReason> {
        let session = state.session.as_mut()?;
        session.cycles += 1;

        if imbalance <= self.config.imbalance_threshold() {
            info!(
                silo = %self.local,
                reason = ?StopReason::SessionCompleted,
                cycles = session.cycles,
                elapsed = ?now.saturating_sub(session.started_at),
                imbalance,
                "rebalancing session stopped"
            );
            state.session = None;
            state.failed_sessions = 0;
            state.suspended_until = Some(now.saturating_add(self.config.session_cycle_period()));
            return Some(StopReason::SessionCompleted);
        }

        let improved = session
            .previous_imbalance
            .map_or(true, |previous| previous - imbalance >= self.config.improvement_quantum());
        session.stagnant_cycles = if improved {
            0
        } else {
            session.stagnant_cycles + 1
        };
        session.previous_imbalance = Some(imbalance);

        if session.stagnant_cycles >= self.config.max_stagnant_cycles() {
            let cycles = session.cycles;
            state.session = None;
            state.failed_sessions += 1;
            let backoff = self.backoff.next(state.failed_sessions);
            state.suspended_until = Some(now.saturating_add(backoff));
            warn!(
                silo = %self.local,
                reason = ?StopReason::SessionStagnated,
                cycles,
                failed_sessions = state.failed_sessions,
                ?backoff,
                imbalance,
                "rebalancing session stopped"
            );
            return Some(StopReason::SessionStagnated);
        }
        None
    }
}

#[async_trait(?Send)]
impl<T: TimeProvider + 'static> RemoteRebalancerWorker for RebalancerWorker<T> {
    async fn get_report(&self, force: bool) -> Result<RebalancingReport, RebalancerError> {
        Ok(self.report(force))
    }

    async fn resume_rebalancing(&self) -> Result<(), RebalancerError> {
        self.resume();
        self.publish_report().await;
        Ok(())
    }

    async fn suspend_rebalancing(&self, duration: Option<Duration>) -> Result<(), RebalancerError> {
        self.suspend(duration);
        self.publish_report().await;
        Ok(())
    }

    async fn exchange_load(&self, peer: SiloLoad) -> Result<SiloLoad, RebalancerError> {
        if self.membership.current().is_active(&peer.silo) {
            self.state
                .borrow_mut()
                .peers
                .insert(peer.silo.clone(), peer.statistics);
        }
        Ok(self.local_load())
    }
}
