//! Distributed grain directory.
//!
//! Maps every [`GrainId`](crate::types::GrainId) to the one activation
//! currently allowed to serve it. The table is split across the active
//! silos by a consistent-hash [`PartitionRing`]; each silo stores its share
//! in a [`DirectoryPartition`] served by a [`DhtDirectoryService`]. Callers
//! go through a [`GrainLocator`], which caches answers.
//!
//! The directory is soft state: nothing is persisted, and a lost partition
//! is rebuilt as activations re-register.

mod config;
mod context;
mod error;
mod locator;
mod partition;
mod ring;
mod service;

pub use config::{DirectoryConfig, DirectoryConfigBuilder};
pub use context::{Deadline, RequestContext};
pub use error::DirectoryError;
pub use locator::GrainLocator;
pub use partition::{DirectoryEntry, DirectoryPartition, MergeOutcome};
pub use ring::PartitionRing;
pub use service::{DhtDirectoryService, RemoteGrainDirectory, UnregisterOutcome};
