use policy::{Denial, PolicyViolation, Widening};
use thiserror::Error;
use tokens::{KeyError, TokenError};

use crate::CapabilityId;
use crate::config::ConfigError;

/// Why the authority refused a request.
///
/// Every variant maps to a stable code through [`reason`](Self::reason).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AuthorityError {
    #[error(transparent)]
    PolicyViolation(#[from] PolicyViolation),

    #[error("capability not found: {0}")]
    CapabilityNotFound(CapabilityId),

    #[error("capability {0} failed signature verification")]
    SignatureMismatch(CapabilityId),

    #[error("capability {0} has expired")]
    Expired(CapabilityId),

    #[error("capability {0} has been revoked")]
    Revoked(CapabilityId),

    #[error(transparent)]
    Denied(#[from] Denial),

    #[error("delegation depth {depth} would exceed the maximum of {max}")]
    DelegationDepthExceeded { depth: u32, max: u32 },

    #[error("capability does not allow further delegation")]
    DelegationNotAllowed,

    #[error(transparent)]
    ConstraintWidening(#[from] Widening),

    #[error("{principal} may not {operation} {resource}")]
    PermissionDenied {
        principal: String,
        operation: String,
        resource: String,
    },

    #[error("capability coordinator is unavailable")]
    CoordinatorUnavailable,

    #[error("no token service is configured")]
    TokensUnavailable,

    #[error(transparent)]
    Token(#[from] TokenError),

    #[error("failed to sign capability record: {0}")]
    Signing(String),
}

impl AuthorityError {
    pub fn reason(&self) -> &'static str {
        match self {
            Self::PolicyViolation(violation) => violation.reason(),
            Self::CapabilityNotFound(_) => "capability_not_found",
            Self::SignatureMismatch(_) => "capability_signature_mismatch",
            Self::Expired(_) => "capability_expired",
            Self::Revoked(_) => "capability_revoked",
            Self::Denied(denial) => denial.reason(),
            Self::DelegationDepthExceeded { .. } => "delegation_depth_exceeded",
            Self::DelegationNotAllowed => "delegation_not_allowed",
            Self::ConstraintWidening(_) => "constraint_widening",
            Self::PermissionDenied { .. } => "permission_denied",
            Self::CoordinatorUnavailable => "coordinator_unavailable",
            Self::TokensUnavailable => "token_service_unavailable",
            Self::Token(err) => err.reason(),
            Self::Signing(_) => "record_signing_failed",
        }
    }
}

/// Kernel startup and shutdown errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Audit(#[from] audit::Error),

    #[error(transparent)]
    Key(#[from] KeyError),

    #[error(transparent)]
    Authority(#[from] AuthorityError),

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, AuthorityError>;
