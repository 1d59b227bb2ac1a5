//! Consistent-hash partition ring.
//!
//! Each active silo is placed on a 64-bit ring `vnodes_per_silo` times. A
//! grain belongs to the first virtual node at or after its
//! [`uniform_hash`](crate::types::GrainId::uniform_hash), wrapping around.
//! Virtual nodes keep partitions balanced and bound how many keys move when
//! a silo joins or leaves.
//!
//! A ring is built from one membership snapshot and never mutated: when the
//! view changes, a new ring replaces the old one.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hasher;
use std::net::IpAddr;

use twox_hash::XxHash64;

use crate::membership::{MembershipSnapshot, MembershipVersion};
use crate::types::{GrainId, GrainType};
use crate::SiloAddress;

/// Ring of virtual nodes for one membership version.
#[derive(Debug, Clone)]
pub struct PartitionRing {
    vnodes: BTreeMap<u64, SiloAddress>,
    silos: Vec<SiloAddress>,
    vnodes_per_silo: u32,
    version: MembershipVersion,
}

impl PartitionRing {
    /// Build the ring for the active silos of `snapshot`.
    pub fn from_snapshot(snapshot: &MembershipSnapshot, vnodes_per_silo: u32) -> Self {
        let silos = snapshot.active_silos();
        let mut vnodes = BTreeMap::new();
        for silo in &silos {
            for i in 0..vnodes_per_silo {
                // Hash collisions resolve to the lower silo on every host.
                vnodes
                    .entry(Self::vnode_hash(silo, i))
                    .and_modify(|existing: &mut SiloAddress| {
                        if *silo < *existing {
                            *existing = silo.clone();
                        }
                    })
                    .or_insert_with(|| silo.clone());
            }
        }

        Self {
            vnodes,
            silos,
            vnodes_per_silo,
            version: snapshot.version,
        }
    }

    /// The silo owning `grain`, or `None` if no silo is active.
    pub fn owner(&self, grain: &GrainId) -> Option<SiloAddress> {
        self.owner_at(grain.uniform_hash())
    }

    /// Up to `count` distinct silos in ring order starting at the owner.
    pub fn owners(&self, grain: &GrainId, count: usize) -> Vec<SiloAddress> {
        let hash = grain.uniform_hash();
        let mut owners = Vec::with_capacity(count.min(self.silos.len()));
        for (_, silo) in self.vnodes.range(hash..).chain(self.vnodes.iter()) {
            if owners.len() >= count || owners.len() >= self.silos.len() {
                break;
            }
            if !owners.contains(silo) {
                owners.push(silo.clone());
            }
        }
        owners
    }

    /// Whether `silo` owns `grain`.
    pub fn is_owner(&self, grain: &GrainId, silo: &SiloAddress) -> bool {
        self.owner(grain).as_ref() == Some(silo)
    }

    /// Silos on the ring, in ascending order.
    pub fn silos(&self) -> &[SiloAddress] {
        &self.silos
    }

    /// Number of silos on the ring.
    pub fn len(&self) -> usize {
        self.silos.len()
    }

    /// Whether no silo is on the ring.
    pub fn is_empty(&self) -> bool {
        self.silos.is_empty()
    }

    /// Membership version this ring was built from.
    pub fn version(&self) -> MembershipVersion {
        self.version
    }

    /// Virtual nodes per silo.
    pub fn vnodes_per_silo(&self) -> u32 {
        self.vnodes_per_silo
    }

    /// How `sample_size` synthetic grains spread over the silos.
    ///
    /// Useful for diagnostics and for checking balance in tests.
    pub fn distribution(&self, sample_size: usize) -> HashMap<SiloAddress, usize> {
        let mut distribution = HashMap::new();
        for i in 0..sample_size {
            let grain = GrainId::new(GrainType(0), format!("sample-{i}"));
            if let Some(owner) = self.owner(&grain) {
                *distribution.entry(owner).or_insert(0) += 1;
            }
        }
        distribution
    }

    fn owner_at(&self, hash: u64) -> Option<SiloAddress> {
        self.vnodes
            .range(hash..)
            .next()
            .or_else(|| self.vnodes.iter().next())
            .map(|(_, silo)| silo.clone())
    }

    /// Position of virtual node `index` of `silo`.
    ///
    /// Hashes an explicit encoding (address family, octets, then
    /// little-endian port, generation and index) so the layout does not
    /// depend on the platform.
    fn vnode_hash(silo: &SiloAddress, index: u32) -> u64 {
        let mut hasher = XxHash64::with_seed(0);
        match silo.endpoint.ip {
            IpAddr::V4(ip) => {
                hasher.write_u8(4);
                hasher.write(&ip.octets());
            }
            IpAddr::V6(ip) => {
                hasher.write_u8(6);
                hasher.write(&ip.octets());
            }
        }
        hasher.write(&silo.endpoint.port.to_le_bytes());
        hasher.write(&silo.generation.to_le_bytes());
        hasher.write(&index.to_le_bytes());
        hasher.finish()
    }
}
