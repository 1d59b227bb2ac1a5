//! Per-silo monitor: the operator-facing side of the rebalancer.
//!
//! Every worker pushes its report to the monitor of every active silo, so
//! each monitor holds the latest report from each host. Local listeners
//! subscribe to that stream; control calls (suspend/resume) fan out to the
//! workers of all active silos.
//!
//! # Orleans Reference
//!
//! Corresponds to Orleans' `ActivationRebalancerMonitor` and
//! `IActivationRebalancerReportListener`.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::future::Future;
use std::rc::Rc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::report::RebalancingReport;
use super::worker::RemoteRebalancerWorker;
use super::{ListenerError, RebalancerError};
use crate::membership::MembershipOracle;
use crate::transport::ClusterTransport;
use crate::SiloAddress;

/// Receives every report delivered to the local monitor.
///
/// Returning an error unsubscribes the listener.
pub trait ActivationRebalancerReportListener {
    /// A report arrived.
    fn on_report(&self, report: &RebalancingReport) -> Result<(), ListenerError>;
}

/// The remotely callable surface of a monitor.
#[async_trait(?Send)]
pub trait RemoteRebalancerMonitor {
    /// Accept a report pushed by a worker.
    async fn report(&self, report: RebalancingReport) -> Result<(), RebalancerError>;
}

/// Report sink and control fan-out of one silo.
pub struct RebalancerMonitor {
    local: SiloAddress,
    transport: Rc<dyn ClusterTransport>,
    membership: Rc<dyn MembershipOracle>,
    worker: Rc<dyn RemoteRebalancerWorker>,
    reports: RefCell<BTreeMap<SiloAddress, RebalancingReport>>,
    listeners: RefCell<Vec<Rc<dyn ActivationRebalancerReportListener>>>,
}

impl RebalancerMonitor {
    /// Create a monitor fronting the local `worker`.
    pub fn new(
        local: SiloAddress,
        transport: Rc<dyn ClusterTransport>,
        membership: Rc<dyn MembershipOracle>,
        worker: Rc<dyn RemoteRebalancerWorker>,
    ) -> Self {
        Self {
            local,
            transport,
            membership,
            worker,
            reports: RefCell::new(BTreeMap::new()),
            listeners: RefCell::new(Vec::new()),
        }
    }

    /// Report of the local worker; `force` rebuilds it.
    ///
    /// A forced report is also delivered to local listeners.
    pub async fn get_rebalancing_report(
        &self,
        force: bool,
    ) -> Result<RebalancingReport, RebalancerError> {
        let report = self.worker.get_report(force).await?;
        if force {
            self.deliver(report.clone());
        }
        Ok(report)
    }

    /// Resume every active silo's worker.
    ///
    /// All silos are attempted; the first failure is returned.
    pub async fn resume_rebalancing(&self) -> Result<(), RebalancerError> {
        self.fan_out(|worker| async move { worker.resume_rebalancing().await })
            .await
    }

    /// Suspend every active silo's worker, for `duration` or indefinitely.
    ///
    /// All silos are attempted; the first failure is returned.
    pub async fn suspend_rebalancing(
        &self,
        duration: Option<Duration>,
    ) -> Result<(), RebalancerError> {
        self.fan_out(|worker| async move { worker.suspend_rebalancing(duration).await })
            .await
    }

    /// Add a report listener.
    pub fn subscribe_to_reports(&self, listener: Rc<dyn ActivationRebalancerReportListener>) {
        self.listeners.borrow_mut().push(listener);
    }

    /// Remove a listener. Returns whether it was subscribed.
    pub fn unsubscribe_from_reports(
        &self,
        listener: &Rc<dyn ActivationRebalancerReportListener>,
    ) -> bool {
        let mut listeners = self.listeners.borrow_mut();
        let before = listeners.len();
        listeners.retain(|l| !same_listener(l, listener));
        listeners.len() != before
    }

    /// Number of subscribed listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners.borrow().len()
    }

    /// Latest report received from each active host.
    pub fn latest_reports(&self) -> Vec<RebalancingReport> {
        self.prune_inactive_hosts();
        self.reports.borrow().values().cloned().collect()
    }

    /// Latest report received from `host`, while it is active.
    pub fn latest_report(&self, host: &SiloAddress) -> Option<RebalancingReport> {
        self.prune_inactive_hosts();
        self.reports.borrow().get(host).cloned()
    }

    fn prune_inactive_hosts(&self) {
        let snapshot = self.membership.current();
        self.reports
            .borrow_mut()
            .retain(|host, _| snapshot.is_active(host));
    }

    async fn fan_out<F, Fut>(&self, call: F) -> Result<(), RebalancerError>
    where
        F: Fn(Rc<dyn RemoteRebalancerWorker>) -> Fut,
        Fut: Future<Output = Result<(), RebalancerError>>,
    {
        let mut first_error = None;
        for silo in self.membership.current().active_silos() {
            let result = if silo == self.local {
                call(Rc::clone(&self.worker)).await
            } else {
                match self.transport.rebalancer(&silo) {
                    Ok(worker) => call(worker).await,
                    Err(error) => Err(error.into()),
                }
            };
            if let Err(error) = result {
                warn!(%silo, %error, "rebalancer control call failed");
                first_error.get_or_insert(error);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn deliver(&self, report: RebalancingReport) {
        self.prune_inactive_hosts();
        if self.membership.current().is_active(&report.host) {
            self.reports
                .borrow_mut()
                .insert(report.host.clone(), report.clone());
        }

        // Listeners may subscribe or unsubscribe from inside the callback.
        let listeners = self.listeners.borrow().clone();
        let mut failed = Vec::new();
        for listener in listeners {
            if let Err(error) = listener.on_report(&report) {
                warn!(host = %report.host, %error, "dropping failing report listener");
                failed.push(listener);
            }
        }
        if !failed.is_empty() {
            self.listeners
                .borrow_mut()
                .retain(|l| !failed.iter().any(|f| same_listener(l, f)));
        }
    }
}

#[async_trait(?Send)]
impl RemoteRebalancerMonitor for RebalancerMonitor {
    async fn report(&self, report: RebalancingReport) -> Result<(), RebalancerError> {
        debug!(
            silo = %self.local,
            host = %report.host,
            status = %report.status,
            imbalance = report.cluster_imbalance,
            "received rebalancing report"
        );
        self.deliver(report);
        Ok(())
    }
}

fn same_listener(
    a: &Rc<dyn ActivationRebalancerReportListener>,
    b: &Rc<dyn ActivationRebalancerReportListener>,
) -> bool {
    std::ptr::addr_eq(Rc::as_ptr(a), Rc::as_ptr(b))
}
