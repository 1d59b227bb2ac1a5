//! Per-request routing context.
//!
//! Every directory call carries a [`RequestContext`]: how many times the
//! request has been forwarded, and the absolute deadline of the whole
//! operation. Forwarding bumps the hop count but keeps the deadline, so a
//! chain of hops shares one timeout budget.

use std::time::Duration;

/// Absolute point in time, on the silo's `TimeProvider` clock, after which
/// a request is abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Deadline(Duration);

impl Deadline {
    /// Deadline at the absolute time `at`.
    pub fn at(at: Duration) -> Self {
        Self(at)
    }

    /// Deadline `timeout` after `now`.
    pub fn after(now: Duration, timeout: Duration) -> Self {
        Self(now.saturating_add(timeout))
    }

    /// The absolute deadline.
    pub fn instant(&self) -> Duration {
        self.0
    }

    /// Time left before the deadline, or `None` once it has passed.
    pub fn remaining(&self, now: Duration) -> Option<Duration> {
        self.0.checked_sub(now).filter(|left| !left.is_zero())
    }

    /// Whether the deadline has passed.
    pub fn is_expired(&self, now: Duration) -> bool {
        self.remaining(now).is_none()
    }
}

/// Routing state attached to a directory request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestContext {
    /// Number of times the request has been forwarded so far.
    pub hop_count: u32,
    /// Deadline shared by every hop.
    pub deadline: Deadline,
}

impl RequestContext {
    /// A fresh request, not yet forwarded.
    pub fn new(deadline: Deadline) -> Self {
        Self {
            hop_count: 0,
            deadline,
        }
    }

    /// The context to send along with a forwarded request.
    pub fn forwarded(&self) -> Self {
        Self {
            hop_count: self.hop_count + 1,
            deadline: self.deadline,
        }
    }
}
