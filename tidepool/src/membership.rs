//! Membership view: which silos are in the cluster and in what state.
//!
//! The directory and the rebalancer consume membership through the
//! [`MembershipOracle`] trait. Detection (gossip, probing, a membership
//! table) lives elsewhere; this module only models the resulting view.
//!
//! # Design
//!
//! - A [`MembershipSnapshot`] is immutable. Changes produce a new snapshot
//!   with a bumped [`MembershipVersion`], swapped in by reference.
//! - Consumers register a [`MembershipListener`] and are called with every
//!   new snapshot. Listeners are held weakly so a dropped component simply
//!   stops receiving updates.
//! - [`SharedMembership`] is an in-memory oracle for tests and
//!   single-process clusters.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::{Rc, Weak};

use serde::{Deserialize, Serialize};

use crate::SiloAddress;

/// Monotonically increasing membership version.
///
/// Every membership change (join, status transition, leave) bumps the version.
/// Used to detect stale snapshots and order membership updates.
///
/// # Orleans Reference
///
/// Corresponds to Orleans' `MembershipVersion`: a simple monotonic counter
/// that increases with every table write.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct MembershipVersion(pub u64);

impl MembershipVersion {
    /// Create version 0 (initial).
    pub fn new() -> Self {
        Self(0)
    }

    /// Return the next version.
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for MembershipVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Status of a silo in the cluster.
///
/// Only [`SiloStatus::Active`] silos own directory partitions and may host
/// registered activations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SiloStatus {
    /// Silo is joining the cluster (announced but not yet ready to serve).
    Joining,
    /// Silo is fully operational and serving requests.
    Active,
    /// Silo is gracefully shutting down (draining work).
    ShuttingDown,
    /// Silo is no longer reachable (crashed or completed shutdown).
    Dead,
}

impl fmt::Display for SiloStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Joining => write!(f, "Joining"),
            Self::Active => write!(f, "Active"),
            Self::ShuttingDown => write!(f, "ShuttingDown"),
            Self::Dead => write!(f, "Dead"),
        }
    }
}

/// A single member of the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterMember {
    /// Address of this member.
    pub silo: SiloAddress,
    /// Current lifecycle status.
    pub status: SiloStatus,
    /// Human-readable name (for logging/debugging).
    pub name: String,
}

impl ClusterMember {
    /// Create a new cluster member.
    pub fn new(silo: SiloAddress, status: SiloStatus, name: impl Into<String>) -> Self {
        Self {
            silo,
            status,
            name: name.into(),
        }
    }

    /// Check if this member is in a status where it can serve requests.
    pub fn is_active(&self) -> bool {
        self.status == SiloStatus::Active
    }
}

/// Immutable snapshot of cluster membership at a specific version.
///
/// Members are kept in a `BTreeMap` so iteration order is the silo order
/// on every host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MembershipSnapshot {
    /// All known members, keyed by silo address.
    pub members: BTreeMap<SiloAddress, ClusterMember>,
    /// Version of this snapshot (monotonically increasing).
    pub version: MembershipVersion,
}

impl MembershipSnapshot {
    /// Create an empty snapshot at version 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Active silo addresses in ascending order.
    pub fn active_silos(&self) -> Vec<SiloAddress> {
        self.members
            .values()
            .filter(|m| m.is_active())
            .map(|m| m.silo.clone())
            .collect()
    }

    /// Number of active silos.
    pub fn active_count(&self) -> usize {
        self.members.values().filter(|m| m.is_active()).count()
    }

    /// Whether `silo` is active in this snapshot.
    pub fn is_active(&self, silo: &SiloAddress) -> bool {
        self.members.get(silo).is_some_and(ClusterMember::is_active)
    }

    /// Get the status of a specific member, or `None` if unknown.
    pub fn get_status(&self, silo: &SiloAddress) -> Option<SiloStatus> {
        self.members.get(silo).map(|m| m.status)
    }
}

/// Errors from membership operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MembershipError {
    /// The silo was not found in the membership.
    #[error("silo not found: {silo}")]
    NotFound {
        /// The silo that was not found.
        silo: SiloAddress,
    },
}

/// Receives every new membership snapshot.
///
/// Called synchronously by the oracle after the snapshot was swapped in.
/// Implementations must not block; async follow-up work (handoffs,
/// notifications) is queued and driven elsewhere.
pub trait MembershipListener {
    /// A new snapshot became current.
    fn on_membership_changed(&self, snapshot: Rc<MembershipSnapshot>);
}

/// Source of the cluster membership view.
///
/// # Orleans Reference
///
/// Plays the role of Orleans' `IClusterMembershipService`: a current
/// snapshot plus a stream of updates.
pub trait MembershipOracle: fmt::Debug {
    /// The current snapshot.
    fn current(&self) -> Rc<MembershipSnapshot>;

    /// Register a listener for future snapshots.
    fn subscribe(&self, listener: Weak<dyn MembershipListener>);
}

struct SharedMembershipInner {
    snapshot: Rc<MembershipSnapshot>,
    listeners: Vec<Weak<dyn MembershipListener>>,
}

/// In-memory membership oracle.
///
/// Every mutation produces a new snapshot and notifies live listeners.
/// Several silos may share one instance (a consistent view), or each may
/// hold its own to model views that disagree.
pub struct SharedMembership {
    inner: RefCell<SharedMembershipInner>,
}

impl fmt::Debug for SharedMembership {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("SharedMembership")
            .field("snapshot", &inner.snapshot)
            .field("listeners", &inner.listeners.len())
            .finish()
    }
}

impl Default for SharedMembership {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedMembership {
    /// Create an empty membership at version 0.
    pub fn new() -> Self {
        Self {
            inner: RefCell::new(SharedMembershipInner {
                snapshot: Rc::new(MembershipSnapshot::new()),
                listeners: Vec::new(),
            }),
        }
    }

    /// Create a membership where every given silo is already active.
    pub fn with_active_silos(silos: impl IntoIterator<Item = SiloAddress>) -> Self {
        let membership = Self::new();
        for silo in silos {
            membership.register_silo(ClusterMember::new(
                silo.clone(),
                SiloStatus::Active,
                silo.to_string(),
            ));
        }
        membership
    }

    /// Add or replace a member.
    pub fn register_silo(&self, member: ClusterMember) -> MembershipVersion {
        self.publish(|members| {
            members.insert(member.silo.clone(), member);
        })
    }

    /// Transition a member to a new status.
    pub fn update_status(
        &self,
        silo: &SiloAddress,
        status: SiloStatus,
    ) -> Result<MembershipVersion, MembershipError> {
        if !self.inner.borrow().snapshot.members.contains_key(silo) {
            return Err(MembershipError::NotFound { silo: silo.clone() });
        }
        Ok(self.publish(|members| {
            if let Some(member) = members.get_mut(silo) {
                member.status = status;
            }
        }))
    }

    /// Remove a member entirely.
    pub fn remove_silo(&self, silo: &SiloAddress) -> Result<MembershipVersion, MembershipError> {
        if !self.inner.borrow().snapshot.members.contains_key(silo) {
            return Err(MembershipError::NotFound { silo: silo.clone() });
        }
        Ok(self.publish(|members| {
            members.remove(silo);
        }))
    }

    fn publish(
        &self,
        mutate: impl FnOnce(&mut BTreeMap<SiloAddress, ClusterMember>),
    ) -> MembershipVersion {
        let (snapshot, listeners) = {
            let mut inner = self.inner.borrow_mut();
            let mut members = inner.snapshot.members.clone();
            mutate(&mut members);
            let snapshot = Rc::new(MembershipSnapshot {
                members,
                version: inner.snapshot.version.next(),
            });
            inner.snapshot = Rc::clone(&snapshot);
            inner.listeners.retain(|l| l.strong_count() > 0);
            let listeners: Vec<_> = inner.listeners.iter().filter_map(Weak::upgrade).collect();
            (snapshot, listeners)
        };

        tracing::debug!(
            version = %snapshot.version,
            active = snapshot.active_count(),
            "membership changed"
        );

        // Borrow released: listeners may read `current()` re-entrantly.
        for listener in listeners {
            listener.on_membership_changed(Rc::clone(&snapshot));
        }
        snapshot.version
    }
}

impl MembershipOracle for SharedMembership {
    fn current(&self) -> Rc<MembershipSnapshot> {
        Rc::clone(&self.inner.borrow().snapshot)
    }

    fn subscribe(&self, listener: Weak<dyn MembershipListener>) {
        self.inner.borrow_mut().listeners.push(listener);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NetworkAddress;
    use std::cell::Cell;
    use std::net::{IpAddr, Ipv4Addr};

    fn silo(port: u16) -> SiloAddress {
        SiloAddress::new(NetworkAddress::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port), 1)
    }

    #[derive(Default)]
    struct RecordingListener {
        seen: RefCell<Vec<MembershipVersion>>,
    }

    impl MembershipListener for RecordingListener {
        fn on_membership_changed(&self, snapshot: Rc<MembershipSnapshot>) {
            self.seen.borrow_mut().push(snapshot.version);
        }
    }

    #[test]
    fn test_version_display_and_next() {
        assert_eq!(MembershipVersion::new().next().to_string(), "v1");
    }

    #[test]
    fn test_register_bumps_version() {
        let membership = SharedMembership::new();
        assert_eq!(membership.current().version, MembershipVersion(0));

        let v1 = membership.register_silo(ClusterMember::new(silo(1), SiloStatus::Joining, "a"));
        assert_eq!(v1, MembershipVersion(1));
        assert_eq!(membership.current().active_count(), 0);

        let v2 = membership
            .update_status(&silo(1), SiloStatus::Active)
            .expect("known silo");
        assert_eq!(v2, MembershipVersion(2));
        assert_eq!(membership.current().active_silos(), vec![silo(1)]);
    }

    #[test]
    fn test_snapshots_are_immutable() {
        let membership = SharedMembership::with_active_silos([silo(1), silo(2)]);
        let before = membership.current();
        membership
            .update_status(&silo(2), SiloStatus::Dead)
            .expect("known silo");

        assert!(before.is_active(&silo(2)));
        assert!(!membership.current().is_active(&silo(2)));
        assert_eq!(membership.current().get_status(&silo(2)), Some(SiloStatus::Dead));
    }

    #[test]
    fn test_unknown_silo() {
        let membership = SharedMembership::new();
        assert_eq!(
            membership.update_status(&silo(9), SiloStatus::Dead),
            Err(MembershipError::NotFound { silo: silo(9) })
        );
        assert!(membership.remove_silo(&silo(9)).is_err());
    }

    #[test]
    fn test_listeners_notified_and_dropped() {
        let membership = SharedMembership::new();
        let listener = Rc::new(RecordingListener::default());
        let weak: Weak<dyn MembershipListener> = Rc::downgrade(&listener) as Weak<dyn MembershipListener>;
        membership.subscribe(weak);

        membership.register_silo(ClusterMember::new(silo(1), SiloStatus::Active, "a"));
        membership.register_silo(ClusterMember::new(silo(2), SiloStatus::Active, "b"));
        assert_eq!(
            *listener.seen.borrow(),
            vec![MembershipVersion(1), MembershipVersion(2)]
        );

        drop(listener);
        membership.remove_silo(&silo(1)).expect("known silo");
        assert_eq!(membership.inner.borrow().listeners.len(), 0);
    }

    #[test]
    fn test_listener_can_read_current() {
        struct Reentrant {
            membership: Rc<SharedMembership>,
            observed: Cell<u64>,
        }
        impl MembershipListener for Reentrant {
            fn on_membership_changed(&self, _snapshot: Rc<MembershipSnapshot>) {
                self.observed.set(self.membership.current().version.0);
            }
        }

        let membership = Rc::new(SharedMembership::new());
        let listener = Rc::new(Reentrant {
            membership: Rc::clone(&membership),
            observed: Cell::new(0),
        });
        let weak: Weak<dyn MembershipListener> = Rc::downgrade(&listener) as Weak<dyn MembershipListener>;
        membership.subscribe(weak);
        membership.register_silo(ClusterMember::new(silo(1), SiloStatus::Active, "a"));
        assert_eq!(listener.observed.get(), 1);
    }
}
