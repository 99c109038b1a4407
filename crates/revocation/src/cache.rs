use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::{Cluster, ClusterMessage, LocalCluster, NodeId, RevocationEntry, RevocationExpiry};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevocationStats {
    pub permanent: usize,
    pub temporary: usize,
    pub total: usize,
    pub node_id: NodeId,
    pub cluster_members: usize,
}

/// Revoked ids, replicated to every node of a [`Cluster`].
pub struct RevocationCache {
    node_id: NodeId,
    cluster: Arc<dyn Cluster>,
    entries: RwLock<HashMap<String, RevocationExpiry>>,
    inbound: Mutex<Option<broadcast::Receiver<ClusterMessage>>>,
}

impl RevocationCache {
    /// Join `cluster` as `node_id`.
    ///
    /// Messages are queued from this point on; call
    /// [`spawn_listener`](Self::spawn_listener) to start applying them.
    pub fn new(node_id: NodeId, cluster: Arc<dyn Cluster>) -> Self {
        let inbound = cluster.join(&node_id);
        Self {
            node_id,
            cluster,
            entries: RwLock::new(HashMap::new()),
            inbound: Mutex::new(Some(inbound)),
        }
    }

    /// A single-node cache on a private hub.
    pub fn standalone() -> Self {
        Self::new(NodeId::random(), Arc::new(LocalCluster::new()))
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn revoke(&self, id: impl Into<String>, expiry: RevocationExpiry) {
        self.revoke_batch(vec![RevocationEntry {
            id: id.into(),
            expiry,
        }]);
    }

    /// Revoke several ids at once and broadcast them as one message.
    pub fn revoke_batch(&self, entries: Vec<RevocationEntry>) {
        if entries.is_empty() {
            return;
        }
        let changed = self.merge(&entries);
        debug!(count = entries.len(), changed, "revoked locally");
        self.cluster.broadcast(ClusterMessage::Revoke {
            origin: self.node_id.clone(),
            entries,
        });
    }

    pub fn is_revoked(&self, id: &str) -> bool {
        self.is_revoked_at(id, Utc::now())
    }

    pub fn is_revoked_at(&self, id: &str, now: DateTime<Utc>) -> bool {
        self.entries
            .read()
            .get(id)
            .is_some_and(|expiry| expiry.is_active_at(now))
    }

    /// The first revoked id among `ids`, if any.
    pub fn first_revoked<'a, I>(&self, ids: I) -> Option<&'a str>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let now = Utc::now();
        let entries = self.entries.read();
        ids.into_iter()
            .find(|id| entries.get(*id).is_some_and(|e| e.is_active_at(now)))
    }

    pub fn expiry_of(&self, id: &str) -> Option<RevocationExpiry> {
        self.entries.read().get(id).copied()
    }

    /// Remove every entry on this node and all peers.
    pub fn clear_all(&self) {
        let removed = {
            let mut entries = self.entries.write();
            let n = entries.len();
            entries.clear();
            n
        };
        info!(removed, "cleared revocation cache");
        self.cluster.broadcast(ClusterMessage::ClearAll {
            origin: self.node_id.clone(),
        });
    }

    /// Apply a message received from a peer. Returns `false` for messages
    /// this node sent itself.
    pub fn apply(&self, message: &ClusterMessage) -> bool {
        if message.origin() == &self.node_id {
            return false;
        }
        match message {
            ClusterMessage::Revoke { origin, entries } => {
                let changed = self.merge(entries);
                debug!(origin = %origin, count = entries.len(), changed, "applied peer revocations");
            }
            ClusterMessage::ClearAll { origin } => {
                self.entries.write().clear();
                info!(origin = %origin, "revocation cache cleared by peer");
            }
        }
        true
    }

    fn merge(&self, incoming: &[RevocationEntry]) -> usize {
        let mut entries = self.entries.write();
        let mut changed = 0;
        for entry in incoming {
            let merged = match entries.get(&entry.id) {
                Some(current) => current.merge(entry.expiry),
                None => entry.expiry,
            };
            if entries.insert(entry.id.clone(), merged) != Some(merged) {
                changed += 1;
            }
        }
        changed
    }

    /// Drop temporary entries whose expiry has passed. Idempotent.
    pub fn cleanup_expired(&self) -> usize {
        let now = Utc::now();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, expiry| expiry.is_active_at(now));
        let removed = before - entries.len();
        if removed > 0 {
            debug!(removed, "dropped expired revocations");
        }
        removed
    }

    pub fn get_stats(&self) -> RevocationStats {
        let entries = self.entries.read();
        let permanent = entries.values().filter(|e| e.is_permanent()).count();
        RevocationStats {
            permanent,
            temporary: entries.len() - permanent,
            total: entries.len(),
            node_id: self.node_id.clone(),
            cluster_members: self.cluster.members().len(),
        }
    }

    /// Apply peer broadcasts until the cache is dropped.
    ///
    /// Only the first call starts a listener; later calls return a task that
    /// exits immediately.
    pub fn spawn_listener(self: &Arc<Self>) -> JoinHandle<()> {
        let inbound = self.inbound.lock().take();
        let cache = Arc::downgrade(self);

        tokio::spawn(async move {
            let Some(mut inbound) = inbound else {
                return;
            };
            loop {
                let received = inbound.recv().await;
                let Some(cache) = cache.upgrade() else {
                    break;
                };
                match received {
                    Ok(message) => {
                        cache.apply(&message);
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!(
                            node = %cache.node_id,
                            missed,
                            "revocation listener lagged, peer messages were lost"
                        );
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    /// Run [`cleanup_expired`](Self::cleanup_expired) every `period` until the
    /// cache is dropped.
    pub fn spawn_cleanup(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let cache = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(cache) = cache.upgrade() else {
                    break;
                };
                cache.cleanup_expired();
            }
        })
    }
}

impl Drop for RevocationCache {
    fn drop(&mut self) {
        self.cluster.leave(&self.node_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    async fn eventually(mut check: impl FnMut() -> bool) -> bool {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while tokio::time::Instant::now() < deadline {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        check()
    }

    fn pair() -> (Arc<LocalCluster>, Arc<RevocationCache>, Arc<RevocationCache>) {
        let hub = Arc::new(LocalCluster::new());
        let a = Arc::new(RevocationCache::new(NodeId::new("a"), hub.clone()));
        let b = Arc::new(RevocationCache::new(NodeId::new("b"), hub.clone()));
        (hub, a, b)
    }

    #[test]
    fn revoke_then_lookup() {
        let cache = RevocationCache::standalone();
        assert!(!cache.is_revoked("cap_1"));

        cache.revoke("cap_1", RevocationExpiry::Permanent);
        assert!(cache.is_revoked("cap_1"));
        assert!(!cache.is_revoked("cap_2"));
    }

    #[test]
    fn revoking_twice_is_idempotent() {
        let cache = RevocationCache::standalone();
        cache.revoke("cap_1", RevocationExpiry::Permanent);
        let before = cache.get_stats();

        cache.revoke("cap_1", RevocationExpiry::Permanent);
        assert_eq!(cache.get_stats(), before);
        assert_eq!(before.total, 1);
    }

    #[test]
    fn temporary_revocation_is_not_downgraded() {
        let cache = RevocationCache::standalone();
        cache.revoke("cap_1", RevocationExpiry::Permanent);
        cache.revoke("cap_1", RevocationExpiry::Until(Utc::now() + ChronoDuration::hours(1)));
        assert_eq!(cache.expiry_of("cap_1"), Some(RevocationExpiry::Permanent));
    }

    #[test]
    fn expired_entries_are_cleaned_up() {
        let cache = RevocationCache::standalone();
        let past = Utc::now() - ChronoDuration::seconds(1);
        let future = Utc::now() + ChronoDuration::hours(1);
        cache.revoke_batch(vec![
            RevocationEntry::until("old", past),
            RevocationEntry::until("live", future),
            RevocationEntry::permanent("forever"),
        ]);

        assert!(!cache.is_revoked("old"));
        assert_eq!(cache.cleanup_expired(), 1);
        assert_eq!(cache.cleanup_expired(), 0);

        let stats = cache.get_stats();
        assert_eq!((stats.permanent, stats.temporary, stats.total), (1, 1, 2));
    }

    #[test]
    fn first_revoked_scans_lineage() {
        let cache = RevocationCache::standalone();
        cache.revoke("cap_root", RevocationExpiry::Permanent);
        assert_eq!(
            cache.first_revoked(["cap_leaf", "cap_mid", "cap_root"]),
            Some("cap_root")
        );
        assert_eq!(cache.first_revoked(["cap_leaf"]), None);
    }

    #[test]
    fn own_messages_are_ignored() {
        let cache = RevocationCache::standalone();
        let echo = ClusterMessage::ClearAll {
            origin: cache.node_id().clone(),
        };
        cache.revoke("cap_1", RevocationExpiry::Permanent);
        assert!(!cache.apply(&echo));
        assert!(cache.is_revoked("cap_1"));
    }

    #[test]
    fn duplicate_broadcast_is_idempotent() {
        let cache = RevocationCache::standalone();
        let message = ClusterMessage::Revoke {
            origin: NodeId::new("peer"),
            entries: vec![RevocationEntry::permanent("cap_1")],
        };
        assert!(cache.apply(&message));
        assert!(cache.apply(&message));
        assert_eq!(cache.get_stats().total, 1);
    }

    #[tokio::test]
    async fn revocation_propagates_to_peer() {
        let (_hub, a, b) = pair();
        let _la = a.spawn_listener();
        let _lb = b.spawn_listener();

        a.revoke("cap_1", RevocationExpiry::Permanent);
        assert!(a.is_revoked("cap_1"));
        assert!(eventually(|| b.is_revoked("cap_1")).await);
    }

    #[tokio::test]
    async fn clear_all_propagates_to_peer() {
        let (_hub, a, b) = pair();
        let _la = a.spawn_listener();
        let _lb = b.spawn_listener();

        b.revoke("cap_1", RevocationExpiry::Permanent);
        assert!(eventually(|| a.is_revoked("cap_1")).await);

        a.clear_all();
        assert!(eventually(|| !b.is_revoked("cap_1")).await);
        assert_eq!(a.get_stats().total, 0);
    }

    #[tokio::test]
    async fn stats_report_cluster_membership() {
        let (hub, a, b) = pair();
        assert_eq!(a.get_stats().cluster_members, 2);

        drop(b);
        assert_eq!(hub.members(), [NodeId::new("a")]);
        assert_eq!(a.get_stats().cluster_members, 1);
    }
}
