use std::fmt;

use chrono::{DateTime, Utc};
use policy::{ConstraintSet, ResourceType};
use serde::{Deserialize, Serialize};

/// Capability identifier, `cap_` followed by a random UUID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilityId(String);

impl CapabilityId {
    pub fn new() -> Self {
        Self(format!("cap_{}", uuid::Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CapabilityId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for CapabilityId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for CapabilityId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for CapabilityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque holder identity: a user session, a sub-agent or a service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PrincipalId(String);

impl PrincipalId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PrincipalId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for PrincipalId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for PrincipalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A signed grant held by one principal.
///
/// Only `revoked` changes after creation, and it is not covered by the
/// signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capability {
    pub id: CapabilityId,
    pub resource_type: ResourceType,
    pub constraints: ConstraintSet,
    pub principal_id: PrincipalId,
    pub parent_id: Option<CapabilityId>,
    /// 0 for a root capability, parent's depth + 1 for a delegation.
    pub delegation_depth: u32,
    /// Inherited unchanged from the root.
    pub max_delegation_depth: u32,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub signature: String,
    #[serde(default)]
    pub revoked: bool,
}

impl Capability {
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }

    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        !self.revoked && !self.is_expired_at(now)
    }
}
