use policy::ResourceType;
use serde::Serialize;

use crate::{CapabilityId, PrincipalId};

/// Capability lifecycle notifications published to subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CapabilityEvent {
    Created {
        id: CapabilityId,
        principal_id: PrincipalId,
        resource_type: ResourceType,
    },
    Delegated {
        id: CapabilityId,
        parent_id: CapabilityId,
        principal_id: PrincipalId,
    },
    Revoked {
        id: CapabilityId,
        reason: String,
    },
    /// Dropped from the live index after expiry or revocation retention.
    Removed {
        id: CapabilityId,
    },
}

impl CapabilityEvent {
    pub fn id(&self) -> &CapabilityId {
        match self {
            Self::Created { id, .. }
            | Self::Delegated { id, .. }
            | Self::Revoked { id, .. }
            | Self::Removed { id } => id,
        }
    }
}
