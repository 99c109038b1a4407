use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use policy::Operation;
use sha2::{Digest, Sha256};

use crate::Claims;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    /// Digest of the whole token, header and payload included.
    token: [u8; 32],
    operation: Operation,
    resource: String,
}

struct CacheEntry {
    claims: Claims,
    /// Key that verified the signature.
    kid: String,
    inserted: Instant,
}

/// Short-lived memo of successful validations.
///
/// A hit skips signature verification only, and only while the verifying
/// key is still live. Callers still check expiry, revocation and rate limits
/// on every use.
pub(crate) struct ValidationCache {
    ttl: Duration,
    capacity: usize,
    entries: Mutex<HashMap<CacheKey, CacheEntry>>,
}

impl ValidationCache {
    pub(crate) fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            ttl,
            capacity,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn key(token: &str, operation: &Operation, resource: &str) -> CacheKey {
        CacheKey {
            token: Sha256::digest(token.as_bytes()).into(),
            operation: operation.clone(),
            resource: resource.to_string(),
        }
    }

    /// Cached claims, unless the entry is stale or `is_live` rejects the
    /// key that verified it. Rejected entries are evicted.
    pub(crate) fn get(
        &self,
        token: &str,
        operation: &Operation,
        resource: &str,
        is_live: impl Fn(&str) -> bool,
    ) -> Option<Claims> {
        if self.capacity == 0 {
            return None;
        }
        let key = Self::key(token, operation, resource);
        let mut entries = self.entries.lock();
        let entry = entries.get(&key)?;
        if entry.inserted.elapsed() >= self.ttl || !is_live(&entry.kid) {
            entries.remove(&key);
            return None;
        }
        Some(entry.claims.clone())
    }

    pub(crate) fn insert(
        &self,
        token: &str,
        operation: &Operation,
        resource: &str,
        claims: Claims,
        kid: String,
    ) {
        if self.capacity == 0 {
            return;
        }
        let key = Self::key(token, operation, resource);
        let now = Instant::now();
        let mut entries = self.entries.lock();

        if entries.len() >= self.capacity {
            entries.retain(|_, entry| now.duration_since(entry.inserted) < self.ttl);
        }
        if entries.len() >= self.capacity {
            let oldest = entries
                .iter()
                .min_by_key(|(_, entry)| entry.inserted)
                .map(|(key, _)| key.clone());
            if let Some(oldest) = oldest {
                entries.remove(&oldest);
            }
        }
        entries.insert(
            key,
            CacheEntry {
                claims,
                kid,
                inserted: now,
            },
        );
    }

    /// Drop every entry for `id` and its descendants.
    pub(crate) fn purge(&self, id: &str) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| !entry.claims.descends_from(id));
        before - entries.len()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }
}
