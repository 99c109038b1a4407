use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use policy::{ConstraintSet, ResourceType};
use rand::RngCore;
use serde::Serialize;
use sha2::Sha256;

use crate::{AuthorityError, Capability, CapabilityId, PrincipalId, Result};

type HmacSha256 = Hmac<Sha256>;

/// The immutable part of a record, in a fixed field order.
#[derive(Serialize)]
struct SignedFields<'a> {
    id: &'a CapabilityId,
    resource_type: ResourceType,
    constraints: &'a ConstraintSet,
    principal_id: &'a PrincipalId,
    parent_id: Option<&'a CapabilityId>,
    delegation_depth: u32,
    max_delegation_depth: u32,
    created_at: &'a DateTime<Utc>,
    expires_at: Option<&'a DateTime<Utc>>,
}

impl<'a> From<&'a Capability> for SignedFields<'a> {
    fn from(cap: &'a Capability) -> Self {
        Self {
            id: &cap.id,
            resource_type: cap.resource_type,
            constraints: &cap.constraints,
            principal_id: &cap.principal_id,
            parent_id: cap.parent_id.as_ref(),
            delegation_depth: cap.delegation_depth,
            max_delegation_depth: cap.max_delegation_depth,
            created_at: &cap.created_at,
            expires_at: cap.expires_at.as_ref(),
        }
    }
}

/// HMAC-SHA256 over capability records with a per-process secret.
pub(crate) struct RecordSigner {
    key: [u8; 32],
}

impl RecordSigner {
    pub(crate) fn generate() -> Self {
        let mut key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        Self { key }
    }

    fn mac(&self, cap: &Capability) -> Result<HmacSha256> {
        let payload = serde_json::to_vec(&SignedFields::from(cap))
            .map_err(|e| AuthorityError::Signing(e.to_string()))?;
        let mut mac = HmacSha256::new_from_slice(&self.key)
            .map_err(|e| AuthorityError::Signing(e.to_string()))?;
        mac.update(&payload);
        Ok(mac)
    }

    pub(crate) fn sign(&self, cap: &Capability) -> Result<String> {
        Ok(STANDARD.encode(self.mac(cap)?.finalize().into_bytes()))
    }

    /// Constant-time check of `cap.signature` against its fields.
    pub(crate) fn verify(&self, cap: &Capability) -> bool {
        let Ok(signature) = STANDARD.decode(&cap.signature) else {
            return false;
        };
        self.mac(cap)
            .is_ok_and(|mac| mac.verify_slice(&signature).is_ok())
    }
}
