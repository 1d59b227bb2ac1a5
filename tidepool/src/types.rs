//! Grain identity and addressing types.
//!
//! These types are the vocabulary shared by the directory, the locator and
//! the rebalancer. All of them derive serde so any RPC transport can carry
//! them.
//!
//! # Design
//!
//! - `GrainType` is a u64 derived from the grain interface name.
//! - `GrainId` is `GrainType` + a string key (e.g., "player-42"). It never
//!   changes for the lifetime of the logical grain.
//! - `GrainAddress` pins a `GrainId` to one activation on one silo.
//! - `VersionTag` is the optimistic version of a directory entry.
//!
//! # Orleans Reference
//!
//! `GrainId`, `GrainAddress`, `ActivationId` and `AddressAndTag` mirror the
//! Orleans types of the same names.

use std::hash::Hasher;

use serde::{Deserialize, Serialize};
use twox_hash::XxHash64;

use crate::SiloAddress;

/// Identifies a grain TYPE.
///
/// Use a hex constant matching the interface ID pattern:
/// ```rust
/// use tidepool::types::GrainType;
/// const PLAYER: GrainType = GrainType(0x504C_4159);
/// ```
#[derive(Clone, Copy, Hash, Eq, PartialEq, PartialOrd, Ord, Serialize, Deserialize, Debug)]
pub struct GrainType(pub u64);

/// Logical grain identity = type + string key.
///
/// # Examples
///
/// ```rust
/// use tidepool::types::{GrainId, GrainType};
///
/// let player = GrainId::new(GrainType(0x504C_4159), "player-42");
/// assert_eq!(player.uniform_hash(), player.clone().uniform_hash());
/// ```
#[derive(Clone, Hash, Eq, PartialEq, PartialOrd, Ord, Serialize, Deserialize, Debug)]
pub struct GrainId {
    /// The type of grain.
    pub grain_type: GrainType,
    /// The instance key within the type.
    pub key: String,
}

impl GrainId {
    /// Create a new grain ID.
    pub fn new(grain_type: GrainType, key: impl Into<String>) -> Self {
        Self {
            grain_type,
            key: key.into(),
        }
    }

    /// Stable hash used to place this grain on the partition ring.
    ///
    /// xxHash64 with a fixed seed over the little-endian grain type
    /// followed by the key bytes, so every platform and process agrees.
    pub fn uniform_hash(&self) -> u64 {
        let mut hasher = XxHash64::with_seed(0);
        hasher.write(&self.grain_type.0.to_le_bytes());
        hasher.write(self.key.as_bytes());
        hasher.finish()
    }
}

impl std::fmt::Display for GrainId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:x}/{}", self.grain_type.0, self.key)
    }
}

/// Unique identifier for a single activation of a grain.
///
/// Each time a grain is activated, it receives a new `ActivationId`.
/// This distinguishes a live activation from a stale directory entry that
/// points at an activation which has since been deactivated.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActivationId(pub u64);

impl ActivationId {
    /// Draw a fresh random activation id.
    pub fn random() -> Self {
        Self(rand::random())
    }
}

impl std::fmt::Display for ActivationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "act-{:016x}", self.0)
    }
}

/// Full location of one grain activation.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GrainAddress {
    /// The grain this activation belongs to.
    pub grain_id: GrainId,
    /// The silo hosting the activation.
    pub silo: SiloAddress,
    /// The activation token.
    pub activation_id: ActivationId,
}

impl GrainAddress {
    /// Create a new grain address.
    pub fn new(grain_id: GrainId, silo: SiloAddress, activation_id: ActivationId) -> Self {
        Self {
            grain_id,
            silo,
            activation_id,
        }
    }

    /// Whether `other` designates the same activation.
    pub fn matches(&self, other: &GrainAddress) -> bool {
        self.activation_id == other.activation_id
            && self.silo == other.silo
            && self.grain_id == other.grain_id
    }
}

impl std::fmt::Display for GrainAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}#{}", self.grain_id, self.silo, self.activation_id)
    }
}

/// Optimistic version of a directory entry.
///
/// Strictly increases on every successful write to an entry.
/// [`VersionTag::NONE`] means "no entry".
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct VersionTag(pub u64);

impl VersionTag {
    /// Tag carried by empty lookup results.
    pub const NONE: VersionTag = VersionTag(0);

    /// Whether this is the "no entry" tag.
    pub fn is_none(self) -> bool {
        self == Self::NONE
    }
}

impl std::fmt::Display for VersionTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Result of a directory register or lookup.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressAndTag {
    /// The registered activation, if any.
    pub address: Option<GrainAddress>,
    /// Version of the entry, [`VersionTag::NONE`] when empty.
    pub version_tag: VersionTag,
}

impl AddressAndTag {
    /// An empty result: no entry for the grain.
    pub fn empty() -> Self {
        Self {
            address: None,
            version_tag: VersionTag::NONE,
        }
    }

    /// A result pointing at `address`.
    pub fn new(address: GrainAddress, version_tag: VersionTag) -> Self {
        Self {
            address: Some(address),
            version_tag,
        }
    }

    /// Whether the result carries no address.
    pub fn is_empty(&self) -> bool {
        self.address.is_none()
    }
}

/// Why an activation is being unregistered.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnregistrationCause {
    /// The activation is gone; remove the entry immediately.
    Force,
    /// A caller reached a silo that does not host the activation.
    ///
    /// Only honoured once the entry is older than the lazy deregistration
    /// delay, so a message racing a fresh activation does not evict it.
    NonexistentActivation,
}
