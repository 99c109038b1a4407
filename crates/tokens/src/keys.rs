//! RSA signing keys and the two-generation key ring.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey};
use parking_lot::RwLock;
use rsa::RsaPrivateKey;
use rsa::pkcs1::EncodeRsaPrivateKey;
use rsa::traits::PublicKeyParts;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::info;

/// Signature algorithm for every token this crate issues.
pub const ALGORITHM: Algorithm = Algorithm::RS256;

pub const DEFAULT_RSA_BITS: usize = 2048;

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("key generation failed: {0}")]
    Generation(String),

    #[error("key encoding failed: {0}")]
    Encoding(String),

    #[error("no live key with id '{0}'")]
    KeyNotFound(String),
}

impl KeyError {
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Generation(_) | Self::Encoding(_) => "key_unavailable",
            Self::KeyNotFound(_) => "key_not_found",
        }
    }
}

/// Public half of a signing key in JWK form (RFC 7517).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jwk {
    pub kty: String,
    pub kid: String,
    #[serde(rename = "use")]
    pub key_use: String,
    pub alg: String,
    /// Modulus, base64url without padding.
    pub n: String,
    /// Public exponent, base64url without padding.
    pub e: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JwkSet {
    pub keys: Vec<Jwk>,
}

/// An RSA key pair ready for RS256 signing and verification.
#[derive(Clone)]
pub struct SigningKey {
    kid: String,
    encoding: EncodingKey,
    decoding: DecodingKey,
    jwk: Jwk,
    created_at: DateTime<Utc>,
}

impl SigningKey {
    /// Generate a fresh key pair. CPU-heavy; run off the async executor.
    pub fn generate(bits: usize) -> Result<Self, KeyError> {
        let private = RsaPrivateKey::new(&mut rand::thread_rng(), bits)
            .map_err(|e| KeyError::Generation(e.to_string()))?;
        Self::from_rsa(&private)
    }

    pub fn from_rsa(private: &RsaPrivateKey) -> Result<Self, KeyError> {
        let der = private
            .to_pkcs1_der()
            .map_err(|e| KeyError::Encoding(e.to_string()))?;
        let encoding = EncodingKey::from_rsa_der(der.as_bytes());

        let n = URL_SAFE_NO_PAD.encode(private.n().to_bytes_be());
        let e = URL_SAFE_NO_PAD.encode(private.e().to_bytes_be());
        let decoding = DecodingKey::from_rsa_components(&n, &e)
            .map_err(|err| KeyError::Encoding(err.to_string()))?;

        let kid = thumbprint(&n, &e);
        let jwk = Jwk {
            kty: "RSA".into(),
            kid: kid.clone(),
            key_use: "sig".into(),
            alg: "RS256".into(),
            n,
            e,
        };

        Ok(Self {
            kid,
            encoding,
            decoding,
            jwk,
            created_at: Utc::now(),
        })
    }

    pub fn kid(&self) -> &str {
        &self.kid
    }

    pub fn encoding_key(&self) -> &EncodingKey {
        &self.encoding
    }

    pub fn decoding_key(&self) -> &DecodingKey {
        &self.decoding
    }

    pub fn jwk(&self) -> &Jwk {
        &self.jwk
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKey")
            .field("kid", &self.kid)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

/// RFC 7638 thumbprint of an RSA public key.
fn thumbprint(n: &str, e: &str) -> String {
    let canonical = format!(r#"{{"e":"{e}","kty":"RSA","n":"{n}"}}"#);
    URL_SAFE_NO_PAD.encode(Sha256::digest(canonical.as_bytes()))
}

struct KeyRing {
    current: SigningKey,
    previous: Option<SigningKey>,
}

impl KeyRing {
    fn live(&self) -> impl Iterator<Item = &SigningKey> {
        std::iter::once(&self.current).chain(self.previous.as_ref())
    }
}

/// Owns the signing key and the verify-only key it replaced.
///
/// Rotation swaps the whole ring at once, so readers see either the old pair
/// or the new pair and never a mix.
pub struct KeyManager {
    bits: usize,
    ring: RwLock<Arc<KeyRing>>,
}

impl KeyManager {
    pub fn new(bits: usize) -> Result<Self, KeyError> {
        Ok(Self::from_key(SigningKey::generate(bits)?, bits))
    }

    /// Start from an existing key; later rotations generate `bits`-bit keys.
    pub fn from_key(key: SigningKey, bits: usize) -> Self {
        Self {
            bits,
            ring: RwLock::new(Arc::new(KeyRing {
                current: key,
                previous: None,
            })),
        }
    }

    fn snapshot(&self) -> Arc<KeyRing> {
        Arc::clone(&self.ring.read())
    }

    pub fn get_signing_key(&self) -> SigningKey {
        self.snapshot().current.clone()
    }

    /// Every live verification key by kid.
    pub fn get_verification_keys(&self) -> BTreeMap<String, DecodingKey> {
        self.snapshot()
            .live()
            .map(|key| (key.kid.clone(), key.decoding.clone()))
            .collect()
    }

    pub fn verification_key(&self, kid: &str) -> Option<DecodingKey> {
        self.snapshot()
            .live()
            .find(|key| key.kid == kid)
            .map(|key| key.decoding.clone())
    }

    pub fn get_public_key(&self, kid: &str) -> Result<Jwk, KeyError> {
        self.snapshot()
            .live()
            .find(|key| key.kid == kid)
            .map(|key| key.jwk.clone())
            .ok_or_else(|| KeyError::KeyNotFound(kid.to_string()))
    }

    /// Generate a new signing key and demote the current one to verify-only.
    /// The key that was previous before the call is discarded.
    ///
    /// Returns the new kid.
    pub fn rotate_keys(&self) -> Result<String, KeyError> {
        // Generate before taking the lock; this can take a while.
        let key = SigningKey::generate(self.bits)?;
        Ok(self.install(key))
    }

    /// Make `key` the signing key, as [`rotate_keys`](Self::rotate_keys) does.
    pub fn install(&self, key: SigningKey) -> String {
        let kid = key.kid.clone();
        let mut ring = self.ring.write();
        let retired = ring.previous.as_ref().map(|k| k.kid.clone());
        *ring = Arc::new(KeyRing {
            current: key,
            previous: Some(ring.current.clone()),
        });
        drop(ring);

        info!(kid = %kid, retired = ?retired, "rotated signing key");
        kid
    }

    pub fn export_key_set(&self) -> JwkSet {
        JwkSet {
            keys: self.snapshot().live().map(|key| key.jwk.clone()).collect(),
        }
    }

    pub fn current_kid(&self) -> String {
        self.snapshot().current.kid.clone()
    }
}


#[cfg(test)]
mod tests {
    use super::testing::key;
    use super::*;

    #[test]
    fn kid_is_stable_thumbprint() {
        let a = key(0);
        assert_eq!(a.kid(), thumbprint(&a.jwk().n, &a.jwk().e));
        assert_ne!(a.kid(), key(1).kid());
    }

    #[test]
    fn rotation_keeps_two_generations() {
        let manager = KeyManager::from_key(key(0), DEFAULT_RSA_BITS);
        let first = manager.current_kid();
        assert_eq!(manager.get_verification_keys().len(), 1);

        let second = manager.install(key(1));
        assert_eq!(manager.get_signing_key().kid(), second);
        let live: Vec<_> = manager.get_verification_keys().into_keys().collect();
        assert_eq!(live.len(), 2);
        assert!(live.contains(&first));

        manager.install(key(2));
        assert!(manager.verification_key(&first).is_none());
        assert!(matches!(
            manager.get_public_key(&first),
            Err(KeyError::KeyNotFound(_))
        ));
        assert!(manager.get_public_key(&second).is_ok());
    }

    #[test]
    fn key_set_serializes_as_jwks() {
        let manager = KeyManager::from_key(key(0), DEFAULT_RSA_BITS);
        let json = serde_json::to_value(manager.export_key_set()).unwrap();

        let jwk = &json["keys"][0];
        assert_eq!(jwk["kty"], "RSA");
        assert_eq!(jwk["use"], "sig");
        assert_eq!(jwk["alg"], "RS256");
        assert_eq!(jwk["e"], "AQAB");
        let n = jwk["n"].as_str().unwrap();
        assert!(!n.contains('=') && !n.contains('+') && !n.contains('/'));
    }

    #[test]
    fn unknown_kid_reports_key_not_found() {
        let manager = KeyManager::from_key(key(0), DEFAULT_RSA_BITS);
        let err = manager.get_public_key("nope").unwrap_err();
        assert_eq!(err.reason(), "key_not_found");
    }
}
