//! Caching façade over the directory.
//!
//! The invocation path asks the [`GrainLocator`] where a grain lives. A
//! cache hit answers without any directory traffic; a miss goes to the
//! directory and caches the answer. Entries are dropped on an explicit
//! invalidation (a caller learned the cached activation is gone) and when
//! membership declares the cached silo inactive.
//!
//! # Orleans Reference
//!
//! Corresponds to Orleans' `DhtGrainLocator` / `CachedGrainLocator`:
//! `TryLookupInCache`, `Lookup`, `Register`, `Unregister`,
//! `InvalidateCache`, and `AdjustLocalCache` on silo status changes.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use std::time::Duration;

use tracing::{debug, trace};

use super::context::{Deadline, RequestContext};
use super::error::DirectoryError;
use super::service::RemoteGrainDirectory;
use crate::membership::{MembershipListener, MembershipOracle, MembershipSnapshot};
use crate::types::{AddressAndTag, GrainAddress, GrainId, UnregistrationCause};
use crate::TimeProvider;

/// Client-side entry point to the directory.
pub struct GrainLocator<T: TimeProvider> {
    directory: Rc<dyn RemoteGrainDirectory>,
    time: T,
    request_timeout: Duration,
    cache: RefCell<HashMap<GrainId, AddressAndTag>>,
    snapshot: RefCell<Rc<MembershipSnapshot>>,
}

impl<T: TimeProvider + 'static> GrainLocator<T> {
    /// Create a locator in front of `directory` and subscribe it to
    /// membership changes.
    pub fn new(
        directory: Rc<dyn RemoteGrainDirectory>,
        time: T,
        request_timeout: Duration,
        membership: &dyn MembershipOracle,
    ) -> Rc<Self> {
        let locator = Rc::new(Self {
            directory,
            time,
            request_timeout,
            cache: RefCell::new(HashMap::new()),
            snapshot: RefCell::new(membership.current()),
        });
        let listener: Weak<dyn MembershipListener> =
            Rc::downgrade(&locator) as Weak<dyn MembershipListener>;
        membership.subscribe(listener);
        locator
    }

    /// Resolve `grain`, from cache when possible.
    pub async fn lookup(&self, grain: &GrainId) -> Result<AddressAndTag, DirectoryError> {
        if let Some(hit) = self.try_local_lookup(grain) {
            trace!(%grain, "locator cache hit");
            return Ok(hit);
        }

        let result = self.directory.lookup(grain.clone(), self.context()).await?;
        self.cache_result(grain, &result);
        Ok(result)
    }

    /// Register `address` and cache whichever activation won.
    pub async fn register(&self, address: GrainAddress) -> Result<AddressAndTag, DirectoryError> {
        let grain = address.grain_id.clone();
        let result = self.directory.register(address, self.context()).await?;
        self.cache_result(&grain, &result);
        Ok(result)
    }

    /// Unregister `address` and drop it from the cache.
    pub async fn unregister(
        &self,
        address: &GrainAddress,
        cause: UnregistrationCause,
    ) -> Result<(), DirectoryError> {
        self.invalidate_address(address);
        self.directory
            .unregister(address.clone(), cause, self.context())
            .await
    }

    /// Cached location of `grain`, without touching the directory.
    pub fn try_local_lookup(&self, grain: &GrainId) -> Option<AddressAndTag> {
        let cache = self.cache.borrow();
        let cached = cache.get(grain)?;
        let silo = &cached.address.as_ref()?.silo;
        if self.snapshot.borrow().is_active(silo) {
            Some(cached.clone())
        } else {
            None
        }
    }

    /// Forget the cached location of `grain`.
    pub fn invalidate(&self, grain: &GrainId) {
        if self.cache.borrow_mut().remove(grain).is_some() {
            debug!(%grain, "locator cache invalidated");
        }
    }

    /// Forget the cached location of `address.grain_id` if it still points
    /// at that activation.
    pub fn invalidate_address(&self, address: &GrainAddress) {
        let mut cache = self.cache.borrow_mut();
        let stale = cache
            .get(&address.grain_id)
            .and_then(|cached| cached.address.as_ref())
            .is_some_and(|cached| cached.matches(address));
        if stale {
            cache.remove(&address.grain_id);
            debug!(%address, "locator cache invalidated");
        }
    }

    /// Number of cached locations.
    pub fn cached_len(&self) -> usize {
        self.cache.borrow().len()
    }

    fn context(&self) -> RequestContext {
        RequestContext::new(Deadline::after(self.time.now(), self.request_timeout))
    }

    fn cache_result(&self, grain: &GrainId, result: &AddressAndTag) {
        let cacheable = result
            .address
            .as_ref()
            .is_some_and(|address| self.snapshot.borrow().is_active(&address.silo));
        let mut cache = self.cache.borrow_mut();
        if cacheable {
            cache.insert(grain.clone(), result.clone());
        } else {
            cache.remove(grain);
        }
    }
}

impl<T: TimeProvider + 'static> MembershipListener for GrainLocator<T> {
    fn on_membership_changed(&self, snapshot: Rc<MembershipSnapshot>) {
        let mut cache = self.cache.borrow_mut();
        let before = cache.len();
        cache.retain(|_, cached| {
            cached
                .address
                .as_ref()
                .is_some_and(|address| snapshot.is_active(&address.silo))
        });
        let dropped = before - cache.len();
        if dropped > 0 {
            debug!(version = %snapshot.version, dropped, "locator cache adjusted");
        }
        *self.snapshot.borrow_mut() = snapshot;
    }
}
