use policy::{Denial, Widening};
use thiserror::Error;

use crate::KeyError;

/// Token issuance and validation failures.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TokenError {
    #[error("token signature is invalid")]
    InvalidSignature,

    #[error("malformed token: {0}")]
    InvalidTokenFormat(String),

    #[error("token was issued by an unknown issuer")]
    InvalidIssuer,

    #[error("token issue time is in the future")]
    InvalidIssuedAt,

    #[error("token has expired")]
    Expired,

    #[error("token '{id}' has been revoked")]
    Revoked { id: String },

    #[error(transparent)]
    Denied(#[from] Denial),

    #[error("delegation depth {depth} would exceed the maximum of {max}")]
    DelegationDepthExceeded { depth: u32, max: u32 },

    #[error("token does not allow further delegation")]
    DelegationNotAllowed,

    #[error(transparent)]
    ConstraintWidening(#[from] Widening),

    #[error(transparent)]
    Key(#[from] KeyError),

    #[error("token signing failed: {0}")]
    Signing(String),
}

impl TokenError {
    /// Stable snake_case code for logs, audit records and callers.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::InvalidSignature => "invalid_signature",
            Self::InvalidTokenFormat(_) => "invalid_token_format",
            Self::InvalidIssuer => "invalid_issuer",
            Self::InvalidIssuedAt => "invalid_issued_at",
            Self::Expired => "token_expired",
            Self::Revoked { .. } => "token_revoked",
            Self::Denied(denial) => denial.reason(),
            Self::DelegationDepthExceeded { .. } => "delegation_depth_exceeded",
            Self::DelegationNotAllowed => "delegation_not_allowed",
            Self::ConstraintWidening(_) => "constraint_widening",
            Self::Key(err) => err.reason(),
            Self::Signing(_) => "token_signing_failed",
        }
    }
}

pub type Result<T> = std::result::Result<T, TokenError>;
