//! Checksum chaining over audit events.
//!
//! Each checksum is `SHA-256(prev_checksum | sequence | type | timestamp |
//! principal | details)` with fields separated by a unit separator byte.
//! The first event of a log chains to [`GENESIS_CHECKSUM`].

use chrono::{DateTime, SecondsFormat, Utc};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::{AuditEvent, AuditEventType};

/// Anchor checksum of the first event in a log.
pub const GENESIS_CHECKSUM: &str = "genesis";

const FIELD_SEPARATOR: &[u8] = &[0x1f];

/// The chain does not match its recomputation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IntegrityError {
    #[error("event {sequence} was altered (checksum mismatch)")]
    ChecksumMismatch { sequence: u64 },

    #[error("event {sequence} does not link to its predecessor")]
    BrokenLink { sequence: u64 },

    #[error("expected event {expected}, found {found}")]
    SequenceGap { expected: u64, found: u64 },
}

impl IntegrityError {
    pub fn reason(&self) -> &'static str {
        match self {
            Self::ChecksumMismatch { .. } => "checksum_mismatch",
            Self::BrokenLink { .. } => "broken_link",
            Self::SequenceGap { .. } => "sequence_gap",
        }
    }
}

/// The last event a sink holds. A logger continues the chain from here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainHead {
    pub sequence: u64,
    pub checksum: String,
}

impl From<&AuditEvent> for ChainHead {
    fn from(event: &AuditEvent) -> Self {
        Self {
            sequence: event.sequence,
            checksum: event.checksum.clone(),
        }
    }
}

pub(crate) fn compute_checksum(
    prev_checksum: &str,
    sequence: u64,
    event_type: AuditEventType,
    timestamp: &DateTime<Utc>,
    principal_id: Option<&str>,
    details: &serde_json::Value,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prev_checksum.as_bytes());
    hasher.update(FIELD_SEPARATOR);
    hasher.update(sequence.to_be_bytes());
    hasher.update(FIELD_SEPARATOR);
    hasher.update(event_type.as_str().as_bytes());
    hasher.update(FIELD_SEPARATOR);
    hasher.update(format_timestamp(timestamp).as_bytes());
    hasher.update(FIELD_SEPARATOR);
    hasher.update(principal_id.unwrap_or_default().as_bytes());
    hasher.update(FIELD_SEPARATOR);
    // serde_json maps are ordered, so the rendering is canonical.
    hasher.update(details.to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Timestamp rendering shared by hashing and storage.
pub(crate) fn format_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

impl AuditEvent {
    /// Recompute this event's checksum from its fields.
    pub fn expected_checksum(&self) -> String {
        compute_checksum(
            &self.prev_checksum,
            self.sequence,
            self.event_type,
            &self.timestamp,
            self.principal_id.as_deref(),
            &self.details,
        )
    }
}

/// Verify a contiguous run of events.
///
/// A run starting at sequence 1 must chain to [`GENESIS_CHECKSUM`]; a run
/// starting later (the older part was trimmed) is anchored at its first
/// event's recorded predecessor.
pub fn verify_chain<'a, I>(events: I) -> Result<(), IntegrityError>
where
    I: IntoIterator<Item = &'a AuditEvent>,
{
    let mut previous: Option<&AuditEvent> = None;

    for event in events {
        match previous {
            None => {
                if event.sequence == 1 && event.prev_checksum != GENESIS_CHECKSUM {
                    return Err(IntegrityError::BrokenLink { sequence: 1 });
                }
            }
            Some(prev) => {
                let expected = prev.sequence + 1;
                if event.sequence != expected {
                    return Err(IntegrityError::SequenceGap {
                        expected,
                        found: event.sequence,
                    });
                }
                if event.prev_checksum != prev.checksum {
                    return Err(IntegrityError::BrokenLink {
                        sequence: event.sequence,
                    });
                }
            }
        }

        if event.expected_checksum() != event.checksum {
            return Err(IntegrityError::ChecksumMismatch {
                sequence: event.sequence,
            });
        }
        previous = Some(event);
    }

    Ok(())
}
