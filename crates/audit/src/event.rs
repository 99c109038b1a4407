//! Audit event types.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Error;

/// The kind of security-relevant decision that was recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    CapabilityCreated,
    CapabilityDelegated,
    CapabilityRevoked,
    PolicyViolation,
    ValidationFailed,
    DelegationDenied,
    TokenIssued,
    TokenValidationFailed,
    TokenRevoked,
    KeyRotated,
    RevocationCleared,
    SecurityViolation,
    CoordinatorRestarted,
}

impl AuditEventType {
    pub const ALL: [AuditEventType; 13] = [
        Self::CapabilityCreated,
        Self::CapabilityDelegated,
        Self::CapabilityRevoked,
        Self::PolicyViolation,
        Self::ValidationFailed,
        Self::DelegationDenied,
        Self::TokenIssued,
        Self::TokenValidationFailed,
        Self::TokenRevoked,
        Self::KeyRotated,
        Self::RevocationCleared,
        Self::SecurityViolation,
        Self::CoordinatorRestarted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CapabilityCreated => "capability_created",
            Self::CapabilityDelegated => "capability_delegated",
            Self::CapabilityRevoked => "capability_revoked",
            Self::PolicyViolation => "policy_violation",
            Self::ValidationFailed => "validation_failed",
            Self::DelegationDenied => "delegation_denied",
            Self::TokenIssued => "token_issued",
            Self::TokenValidationFailed => "token_validation_failed",
            Self::TokenRevoked => "token_revoked",
            Self::KeyRotated => "key_rotated",
            Self::RevocationCleared => "revocation_cleared",
            Self::SecurityViolation => "security_violation",
            Self::CoordinatorRestarted => "coordinator_restarted",
        }
    }

    /// Whether the event reports a denial or an attack rather than a grant.
    pub fn is_denial(&self) -> bool {
        matches!(
            self,
            Self::PolicyViolation
                | Self::ValidationFailed
                | Self::DelegationDenied
                | Self::TokenValidationFailed
                | Self::SecurityViolation
        )
    }
}

impl fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditEventType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| Error::InvalidRecord(format!("unknown event type: {s}")))
    }
}

/// A flushed, checksum-chained audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub sequence: u64,
    pub event_type: AuditEventType,
    pub details: serde_json::Value,
    pub principal_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    /// Checksum of the event before this one in the chain.
    pub prev_checksum: String,
    pub checksum: String,
}

/// An event waiting in the buffer; it is numbered and chained at flush time.
#[derive(Debug, Clone)]
pub(crate) struct PendingEvent {
    pub event_type: AuditEventType,
    pub details: serde_json::Value,
    pub principal_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}
