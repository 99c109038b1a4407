//! Cluster-replicated revocation set for keel.
//!
//! A [`RevocationCache`] answers "has this id been revoked?" in constant time.
//! Local revocations are broadcast to every peer node through a [`Cluster`];
//! incoming broadcasts are merged idempotently, so a message delivered twice
//! (or echoed back) changes nothing.
//!
//! Entries are either permanent or expire at a point in time. Expired
//! temporary entries are dropped by [`RevocationCache::cleanup_expired`],
//! permanent ones only by [`RevocationCache::clear_all`].
//!
//! # Propagation
//!
//! [`LocalCluster`] delivers broadcasts to in-process peers through a tokio
//! broadcast channel. A revocation is visible to a peer after one scheduler
//! hop plus the hub's configured delay. A peer that falls more than the
//! channel capacity behind loses messages and logs a warning.

mod cache;
mod cluster;
mod entry;

pub use cache::{RevocationCache, RevocationStats};
pub use cluster::{Cluster, ClusterMessage, LocalCluster, NodeId};
pub use entry::{RevocationEntry, RevocationExpiry};
