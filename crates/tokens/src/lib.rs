//! Portable capability tokens for keel.
//!
//! A token is an RS256-signed JWT carrying a capability: who holds it
//! (`sub`), what kind of resource it covers (`aud`), the resource pattern,
//! the granted operations and the same typed constraints a capability record
//! carries. Any holder of the published [`JwkSet`] can verify one offline.
//!
//! [`KeyManager`] keeps the current signing key and the one before it, so
//! tokens outlive exactly one rotation. [`TokenService`] issues, delegates
//! and validates tokens, consulting a shared [`revocation::RevocationCache`]
//! for every validation.

mod cache;
mod claims;
mod error;
mod keys;
mod service;

pub use claims::{Claims, DelegationClaim};
pub use error::{Result, TokenError};
pub use keys::{ALGORITHM, DEFAULT_RSA_BITS, Jwk, JwkSet, KeyError, KeyManager, SigningKey};
pub use service::{IssuedToken, TokenConfig, TokenRequest, TokenService, TokenStats, peek_claims};
