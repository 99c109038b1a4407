use std::collections::{BTreeSet, HashMap, VecDeque};

use chrono::{DateTime, Duration, Utc};

use crate::{Capability, CapabilityId, PrincipalId};

/// Capability records plus the indexes over them.
#[derive(Debug, Default)]
pub(crate) struct AuthorityState {
    capabilities: HashMap<CapabilityId, Capability>,
    by_principal: HashMap<PrincipalId, BTreeSet<CapabilityId>>,
    children: HashMap<CapabilityId, BTreeSet<CapabilityId>>,
    revoked_at: HashMap<CapabilityId, DateTime<Utc>>,
}

impl AuthorityState {
    pub(crate) fn get(&self, id: &CapabilityId) -> Option<&Capability> {
        self.capabilities.get(id)
    }

    pub(crate) fn contains(&self, id: &CapabilityId) -> bool {
        self.capabilities.contains_key(id)
    }

    pub(crate) fn insert(&mut self, cap: Capability) {
        self.by_principal
            .entry(cap.principal_id.clone())
            .or_default()
            .insert(cap.id.clone());
        if let Some(parent) = &cap.parent_id {
            self.children
                .entry(parent.clone())
                .or_default()
                .insert(cap.id.clone());
        }
        self.capabilities.insert(cap.id.clone(), cap);
    }

    /// `root` and every capability delegated from it, breadth-first.
    pub(crate) fn subtree(&self, root: &CapabilityId) -> Vec<CapabilityId> {
        let mut order = Vec::new();
        let mut queue = VecDeque::from([root.clone()]);
        while let Some(id) = queue.pop_front() {
            if let Some(children) = self.children.get(&id) {
                queue.extend(children.iter().cloned());
            }
            order.push(id);
        }
        order
    }

    /// Returns `true` only the first time a capability is revoked.
    pub(crate) fn mark_revoked(&mut self, id: &CapabilityId, at: DateTime<Utc>) -> bool {
        match self.capabilities.get_mut(id) {
            Some(cap) if !cap.revoked => {
                cap.revoked = true;
                self.revoked_at.insert(id.clone(), at);
                true
            }
            _ => false,
        }
    }

    pub(crate) fn for_principal<'a>(
        &'a self,
        principal: &PrincipalId,
    ) -> impl Iterator<Item = &'a Capability> + 'a {
        self.by_principal
            .get(principal)
            .into_iter()
            .flatten()
            .filter_map(|id| self.capabilities.get(id))
    }

    /// Ids that are expired, or were revoked more than `retention` ago.
    pub(crate) fn stale(&self, now: DateTime<Utc>, retention: Duration) -> Vec<CapabilityId> {
        self.capabilities
            .values()
            .filter(|cap| {
                cap.is_expired_at(now)
                    || self
                        .revoked_at
                        .get(&cap.id)
                        .and_then(|at| at.checked_add_signed(retention))
                        .is_some_and(|until| until <= now)
            })
            .map(|cap| cap.id.clone())
            .collect()
    }

    pub(crate) fn remove(&mut self, id: &CapabilityId) -> Option<Capability> {
        let cap = self.capabilities.remove(id)?;
        self.revoked_at.remove(id);

        if let Some(ids) = self.by_principal.get_mut(&cap.principal_id) {
            ids.remove(id);
            if ids.is_empty() {
                self.by_principal.remove(&cap.principal_id);
            }
        }
        if let Some(parent) = &cap.parent_id {
            if let Some(siblings) = self.children.get_mut(parent) {
                siblings.remove(id);
                if siblings.is_empty() {
                    self.children.remove(parent);
                }
            }
        }
        // Surviving children keep their parent_id; they can no longer be
        // reached by a cascade from here, but they expire no later than this
        // record did.
        self.children.remove(id);
        Some(cap)
    }

    pub(crate) fn len(&self) -> usize {
        self.capabilities.len()
    }

    pub(crate) fn active(&self, now: DateTime<Utc>) -> usize {
        self.capabilities
            .values()
            .filter(|cap| cap.is_active_at(now))
            .count()
    }

    pub(crate) fn revoked(&self) -> usize {
        self.revoked_at.len()
    }

    pub(crate) fn principals(&self) -> usize {
        self.by_principal.len()
    }

    pub(crate) fn delegation_edges(&self) -> usize {
        self.children.values().map(BTreeSet::len).sum()
    }
}
