//! The slice of the directory owned by one silo.
//!
//! A `DirectoryPartition` is a plain in-memory table. It knows nothing
//! about routing, membership or time sources: callers pass in the current
//! time and a liveness predicate for silos. Every method is synchronous, so
//! a caller holding the partition in a `RefCell` performs each operation as
//! one uninterrupted critical section.
//!
//! # Orleans Reference
//!
//! Corresponds to Orleans' `GrainDirectoryPartition`: `AddSingleActivation`
//! (first registration wins), `RemoveActivation` with the lazy
//! deregistration delay, `RemoveGrain`, `Split` and `Merge` for handoff.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::{AddressAndTag, GrainAddress, GrainId, UnregistrationCause, VersionTag};
use crate::SiloAddress;

/// One registered activation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryEntry {
    /// The registered activation.
    pub address: GrainAddress,
    /// Version of the entry.
    pub version_tag: VersionTag,
    /// When the entry was written, per the owning silo's clock.
    pub created_at: Duration,
}

impl DirectoryEntry {
    fn as_result(&self) -> AddressAndTag {
        AddressAndTag::new(self.address.clone(), self.version_tag)
    }
}

/// Outcome of merging one handed-off entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The entry was stored.
    Accepted,
    /// The partition already had the same activation.
    Duplicate,
    /// A different live activation won; the address lost.
    Rejected(GrainAddress),
}

/// In-memory table of the entries one silo owns.
#[derive(Debug, Default)]
pub struct DirectoryPartition {
    entries: HashMap<GrainId, DirectoryEntry>,
    last_tag: u64,
}

impl DirectoryPartition {
    /// Create an empty partition.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `address`, or return the entry that already holds the grain.
    ///
    /// - no entry: store `address` with a fresh tag
    /// - same activation already stored: return it unchanged
    /// - a different activation on a live silo: keep it and return it
    /// - a different activation on a silo `is_live` rejects: replace it
    pub fn register(
        &mut self,
        address: GrainAddress,
        now: Duration,
        is_live: impl Fn(&SiloAddress) -> bool,
    ) -> AddressAndTag {
        if let Some(existing) = self.entries.get(&address.grain_id) {
            if existing.address.matches(&address) || is_live(&existing.address.silo) {
                return existing.as_result();
            }
            tracing::debug!(
                grain = %address.grain_id,
                stale = %existing.address,
                "replacing entry on inactive silo"
            );
        }

        let version_tag = self.next_tag();
        let entry = DirectoryEntry {
            address,
            version_tag,
            created_at: now,
        };
        let result = entry.as_result();
        self.entries.insert(entry.address.grain_id.clone(), entry);
        result
    }

    /// Remove the entry for `address` if it is still the registered one.
    ///
    /// Returns whether an entry was removed. A mismatch is a no-op, and so is
    /// [`UnregistrationCause::NonexistentActivation`] while the entry is
    /// younger than `grace`.
    pub fn unregister(
        &mut self,
        address: &GrainAddress,
        cause: UnregistrationCause,
        now: Duration,
        grace: Duration,
    ) -> bool {
        let Some(existing) = self.entries.get(&address.grain_id) else {
            return false;
        };
        if !existing.address.matches(address) {
            return false;
        }
        if cause == UnregistrationCause::NonexistentActivation
            && now.saturating_sub(existing.created_at) < grace
        {
            return false;
        }
        self.entries.remove(&address.grain_id);
        true
    }

    /// Remove the entry for `grain`, whatever it points at.
    pub fn delete_grain(&mut self, grain: &GrainId) -> Option<DirectoryEntry> {
        self.entries.remove(grain)
    }

    /// The live entry for `grain`, or an empty result.
    pub fn lookup(&self, grain: &GrainId, is_live: impl Fn(&SiloAddress) -> bool) -> AddressAndTag {
        match self.entries.get(grain) {
            Some(entry) if is_live(&entry.address.silo) => entry.as_result(),
            _ => AddressAndTag::empty(),
        }
    }

    /// The raw entry for `grain`, live or not.
    pub fn get(&self, grain: &GrainId) -> Option<&DirectoryEntry> {
        self.entries.get(grain)
    }

    /// Remove and return every entry whose activation lives on a silo
    /// `is_live` rejects.
    pub fn remove_dead(&mut self, is_live: impl Fn(&SiloAddress) -> bool) -> Vec<DirectoryEntry> {
        self.extract(|entry| !is_live(&entry.address.silo))
    }

    /// Remove and return every entry for a grain this silo no longer owns.
    pub fn split(&mut self, owns: impl Fn(&GrainId) -> bool) -> Vec<DirectoryEntry> {
        self.extract(|entry| !owns(&entry.address.grain_id))
    }

    /// Merge one entry handed off by another silo.
    ///
    /// When both sides hold a live activation for the grain, the lower
    /// `(version_tag, activation_id)` wins. An incoming entry that replaces
    /// an existing one gets a fresh tag so the grain's tag keeps rising.
    pub fn merge(
        &mut self,
        incoming: DirectoryEntry,
        is_live: impl Fn(&SiloAddress) -> bool,
    ) -> MergeOutcome {
        self.last_tag = self.last_tag.max(incoming.version_tag.0);

        let grain = incoming.address.grain_id.clone();
        let Some(existing) = self.entries.get(&grain) else {
            self.entries.insert(grain, incoming);
            return MergeOutcome::Accepted;
        };

        if existing.address.matches(&incoming.address) {
            return MergeOutcome::Duplicate;
        }

        let existing_wins = is_live(&existing.address.silo)
            && (!is_live(&incoming.address.silo)
                || (existing.version_tag, existing.address.activation_id)
                    <= (incoming.version_tag, incoming.address.activation_id));

        if existing_wins {
            return MergeOutcome::Rejected(incoming.address);
        }

        let loser = existing.address.clone();
        let version_tag = self.next_tag();
        self.entries.insert(
            grain,
            DirectoryEntry {
                version_tag,
                ..incoming
            },
        );
        if is_live(&loser.silo) {
            MergeOutcome::Rejected(loser)
        } else {
            MergeOutcome::Accepted
        }
    }

    /// Snapshot of every entry.
    pub fn entries(&self) -> Vec<DirectoryEntry> {
        self.entries.values().cloned().collect()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the partition holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn next_tag(&mut self) -> VersionTag {
        self.last_tag += 1;
        VersionTag(self.last_tag)
    }

    fn extract(&mut self, remove: impl Fn(&DirectoryEntry) -> bool) -> Vec<DirectoryEntry> {
        let keys: Vec<GrainId> = self
            .entries
            .iter()
            .filter(|(_, entry)| remove(entry))
            .map(|(grain, _)| grain.clone())
            .collect();
        keys.into_iter()
            .filter_map(|grain| self.entries.remove(&grain))
            .collect()
    }
}
