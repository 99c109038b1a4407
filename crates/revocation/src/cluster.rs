use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::RevocationEntry;

const HUB_CAPACITY: usize = 4096;

/// Identity of a node in the revocation cluster.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn random() -> Self {
        Self(format!("node_{}", uuid::Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Messages exchanged between revocation caches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClusterMessage {
    Revoke {
        origin: NodeId,
        entries: Vec<RevocationEntry>,
    },
    ClearAll {
        origin: NodeId,
    },
}

impl ClusterMessage {
    pub fn origin(&self) -> &NodeId {
        match self {
            Self::Revoke { origin, .. } | Self::ClearAll { origin } => origin,
        }
    }
}

/// Fire-and-forget broadcast between nodes.
///
/// Delivery is at-most-once per receiver; receivers must tolerate duplicates
/// and their own messages echoed back.
pub trait Cluster: Send + Sync {
    /// Register a node and return its inbound message stream.
    fn join(&self, node: &NodeId) -> broadcast::Receiver<ClusterMessage>;

    fn leave(&self, node: &NodeId);

    fn broadcast(&self, message: ClusterMessage);

    fn members(&self) -> Vec<NodeId>;
}

/// In-process cluster hub.
///
/// Every node that joined the same hub receives every broadcast. An optional
/// delivery delay simulates network latency.
pub struct LocalCluster {
    tx: broadcast::Sender<ClusterMessage>,
    members: RwLock<BTreeSet<NodeId>>,
    delay: Duration,
}

impl LocalCluster {
    pub fn new() -> Self {
        Self::with_delay(Duration::ZERO)
    }

    pub fn with_delay(delay: Duration) -> Self {
        let (tx, _) = broadcast::channel(HUB_CAPACITY);
        Self {
            tx,
            members: RwLock::new(BTreeSet::new()),
            delay,
        }
    }
}

impl Default for LocalCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl Cluster for LocalCluster {
    fn join(&self, node: &NodeId) -> broadcast::Receiver<ClusterMessage> {
        self.members.write().insert(node.clone());
        debug!(node = %node, "node joined revocation cluster");
        self.tx.subscribe()
    }

    fn leave(&self, node: &NodeId) {
        if self.members.write().remove(node) {
            debug!(node = %node, "node left revocation cluster");
        }
    }

    fn broadcast(&self, message: ClusterMessage) {
        // Sending with no live receivers is not an error for a broadcast.
        if self.delay.is_zero() {
            let _ = self.tx.send(message);
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let tx = self.tx.clone();
                let delay = self.delay;
                handle.spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(message);
                });
            }
            Err(_) => {
                let _ = self.tx.send(message);
            }
        }
    }

    fn members(&self) -> Vec<NodeId> {
        self.members.read().iter().cloned().collect()
    }
}
