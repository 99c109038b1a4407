//! Issuing and validating portable capability tokens.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use audit::{AuditEventType, AuditLogger};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{DecodingKey, Header, Validation, decode, decode_header, encode};
use policy::{ConstraintKind, ConstraintSet, Operation, RateLimiter, ResourcePattern, ResourceType, Widening};
use revocation::{RevocationCache, RevocationExpiry};
use serde_json::json;
use tracing::{debug, info};

use crate::cache::ValidationCache;
use crate::{ALGORITHM, Claims, DelegationClaim, KeyManager, Result, TokenError};

#[derive(Debug, Clone)]
pub struct TokenConfig {
    /// `iss` of issued tokens; tokens from any other issuer are rejected.
    pub issuer: String,
    pub default_lifetime: Duration,
    pub max_delegation_depth: u32,
    pub cache_ttl: Duration,
    /// Zero disables the validation cache.
    pub cache_capacity: usize,
    /// How far in the future `iat` may be.
    pub clock_skew: Duration,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            issuer: "keel".into(),
            default_lifetime: Duration::from_secs(3600),
            max_delegation_depth: 3,
            cache_ttl: Duration::from_secs(30),
            cache_capacity: 10_000,
            clock_skew: Duration::from_secs(60),
        }
    }
}

/// What a root token should grant.
#[derive(Debug, Clone)]
pub struct TokenRequest {
    pub resource_type: ResourceType,
    pub resource: ResourcePattern,
    pub principal_id: String,
    pub operations: Vec<Operation>,
    pub constraints: ConstraintSet,
    /// Use this `jti` instead of a fresh one.
    pub id: Option<String>,
    pub lifetime: Option<Duration>,
    pub max_delegation_depth: Option<u32>,
}

impl TokenRequest {
    pub fn new(
        resource_type: ResourceType,
        resource: impl Into<ResourcePattern>,
        principal_id: impl Into<String>,
    ) -> Self {
        Self {
            resource_type,
            resource: resource.into(),
            principal_id: principal_id.into(),
            operations: Vec::new(),
            constraints: ConstraintSet::new(),
            id: None,
            lifetime: None,
            max_delegation_depth: None,
        }
    }

    #[must_use]
    pub fn operations<I, O>(mut self, operations: I) -> Self
    where
        I: IntoIterator<Item = O>,
        O: Into<Operation>,
    {
        self.operations = operations.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn constraints(mut self, constraints: ConstraintSet) -> Self {
        self.constraints = constraints;
        self
    }

    #[must_use]
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    #[must_use]
    pub fn lifetime(mut self, lifetime: Duration) -> Self {
        self.lifetime = Some(lifetime);
        self
    }

    #[must_use]
    pub fn max_delegation_depth(mut self, depth: u32) -> Self {
        self.max_delegation_depth = Some(depth);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedToken {
    pub token: String,
    pub id: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenStats {
    pub issued: u64,
    pub delegated: u64,
    pub validated: u64,
    pub validation_failures: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub revoked: u64,
    pub cached_entries: usize,
}

#[derive(Default)]
struct Counters {
    issued: AtomicU64,
    delegated: AtomicU64,
    validated: AtomicU64,
    validation_failures: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    revoked: AtomicU64,
}

/// Issues RS256 capability tokens and validates presented ones.
pub struct TokenService {
    config: TokenConfig,
    keys: Arc<KeyManager>,
    revocations: Arc<RevocationCache>,
    audit: Option<Arc<AuditLogger>>,
    validation: Validation,
    cache: ValidationCache,
    limiter: RateLimiter,
    counters: Counters,
}

impl TokenService {
    pub fn new(
        config: TokenConfig,
        keys: Arc<KeyManager>,
        revocations: Arc<RevocationCache>,
    ) -> Self {
        let mut validation = Validation::new(ALGORITHM);
        validation.leeway = 0;
        validation.validate_aud = false;
        validation.set_issuer(&[config.issuer.as_str()]);
        validation.set_required_spec_claims(&["exp", "iss", "sub"]);

        let cache = ValidationCache::new(config.cache_ttl, config.cache_capacity);
        Self {
            config,
            keys,
            revocations,
            audit: None,
            validation,
            cache,
            limiter: RateLimiter::new(),
            counters: Counters::default(),
        }
    }

    #[must_use]
    pub fn with_audit(mut self, audit: Arc<AuditLogger>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn config(&self) -> &TokenConfig {
        &self.config
    }

    pub fn keys(&self) -> &Arc<KeyManager> {
        &self.keys
    }

    pub fn issue_token(&self, request: TokenRequest) -> Result<IssuedToken> {
        let now = Utc::now();
        let TokenRequest {
            resource_type,
            resource,
            principal_id,
            mut operations,
            constraints,
            id,
            lifetime,
            max_delegation_depth,
        } = request;

        if operations.is_empty() {
            if let Some(ops) = &constraints.operations {
                operations = ops.iter().cloned().collect();
            }
        }
        if operations.is_empty() {
            return Err(TokenError::InvalidTokenFormat(
                "token grants no operations".into(),
            ));
        }
        operations.sort();
        operations.dedup();

        let lifetime = lifetime.unwrap_or(self.config.default_lifetime);
        let lifetime_secs = i64::try_from(lifetime.as_secs()).unwrap_or(i64::MAX);
        let exp = match constraints.expires_at {
            Some(at) => at.timestamp(),
            None => now.timestamp().saturating_add(lifetime_secs),
        };

        let claims = Claims {
            iss: self.config.issuer.clone(),
            sub: principal_id,
            aud: resource_type,
            exp,
            iat: now.timestamp(),
            jti: id.unwrap_or_else(new_token_id),
            resource,
            operations,
            constraints,
            delegation: DelegationClaim::root(
                max_delegation_depth.unwrap_or(self.config.max_delegation_depth),
            ),
        };

        let issued = self.sign(claims, AuditEventType::TokenIssued)?;
        self.counters.issued.fetch_add(1, Ordering::Relaxed);
        Ok(issued)
    }

    /// Issue a narrower token for `child_principal_id` from a valid parent.
    pub fn issue_delegated_token(
        &self,
        parent_token: &str,
        child_principal_id: &str,
        extra: ConstraintSet,
    ) -> Result<IssuedToken> {
        let result = self.delegate(parent_token, child_principal_id, &extra);
        match &result {
            Ok(_) => {
                self.counters.delegated.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                debug!(reason = err.reason(), child = child_principal_id, "token delegation denied");
                self.audit(
                    AuditEventType::DelegationDenied,
                    json!({
                        "reason": err.reason(),
                        "parent_id": self.peek_claims(parent_token).ok().map(|c| c.jti),
                        "child_principal_id": child_principal_id,
                    }),
                    Some(child_principal_id),
                );
            }
        }
        result
    }

    fn delegate(&self, parent_token: &str, child: &str, extra: &ConstraintSet) -> Result<IssuedToken> {
        let parent = self.validate_token_structure(parent_token)?;

        let depth = parent.delegation.depth + 1;
        if depth > parent.delegation.max_depth {
            return Err(TokenError::DelegationDepthExceeded {
                depth,
                max: parent.delegation.max_depth,
            });
        }
        if parent.constraints.max_delegations == Some(0) {
            return Err(TokenError::DelegationNotAllowed);
        }

        if let Some(requested) = &extra.operations {
            if let Some(op) = requested.iter().find(|op| !parent.operations.contains(op)) {
                return Err(TokenError::ConstraintWidening(Widening {
                    kind: ConstraintKind::Operations,
                    detail: format!("'{op}' is not granted by the parent token"),
                }));
            }
        }
        let constraints = parent.constraints.narrow(extra)?;

        let operations = match &constraints.operations {
            Some(allowed) => parent
                .operations
                .iter()
                .filter(|op| allowed.contains(*op))
                .cloned()
                .collect(),
            None => parent.operations.clone(),
        };
        let exp = match constraints.expires_at {
            Some(at) => parent.exp.min(at.timestamp()),
            None => parent.exp,
        };

        let mut lineage = parent.delegation.lineage.clone();
        lineage.push(parent.jti.clone());

        let claims = Claims {
            iss: self.config.issuer.clone(),
            sub: child.to_string(),
            aud: parent.aud,
            exp,
            iat: Utc::now().timestamp(),
            jti: new_token_id(),
            resource: parent.resource.clone(),
            operations,
            constraints,
            delegation: DelegationClaim {
                depth,
                max_depth: parent.delegation.max_depth,
                parent_id: Some(parent.jti),
                lineage,
            },
        };
        self.sign(claims, AuditEventType::TokenIssued)
    }

    fn sign(&self, claims: Claims, event: AuditEventType) -> Result<IssuedToken> {
        let key = self.keys.get_signing_key();
        let mut header = Header::new(ALGORITHM);
        header.kid = Some(key.kid().to_string());

        let token = encode(&header, &claims, key.encoding_key())
            .map_err(|e| TokenError::Signing(e.to_string()))?;

        debug!(
            token_id = %claims.jti,
            principal = %claims.sub,
            depth = claims.delegation.depth,
            "issued token"
        );
        self.audit(
            event,
            json!({
                "token_id": claims.jti,
                "resource_type": claims.aud,
                "resource": claims.resource,
                "operations": claims.operations,
                "parent_id": claims.delegation.parent_id,
                "depth": claims.delegation.depth,
                "expires_at": claims.exp,
            }),
            Some(claims.sub.as_str()),
        );

        Ok(IssuedToken {
            expires_at: claims.expires_at().unwrap_or(DateTime::<Utc>::MAX_UTC),
            id: claims.jti,
            token,
        })
    }

    /// Full validation: signature, time claims, revocation, then the
    /// requested operation on `resource`.
    pub fn validate_token(&self, token: &str, operation: &Operation, resource: &str) -> Result<Claims> {
        match self.check_token(token, operation, resource) {
            Ok(claims) => {
                self.counters.validated.fetch_add(1, Ordering::Relaxed);
                Ok(claims)
            }
            Err(err) => {
                self.record_failure(token, &err, Some((operation, resource)));
                Err(err)
            }
        }
    }

    fn check_token(&self, token: &str, operation: &Operation, resource: &str) -> Result<Claims> {
        let now = Utc::now();
        let live = |kid: &str| self.keys.verification_key(kid).is_some();
        let claims = match self.cache.get(token, operation, resource, live) {
            Some(claims) => {
                self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
                if claims.is_expired_at(now) {
                    return Err(TokenError::Expired);
                }
                self.check_revoked(&claims)?;
                claims.check_permission(operation, resource, now)?;
                claims
            }
            None => {
                self.counters.cache_misses.fetch_add(1, Ordering::Relaxed);
                let (claims, kid) = self.verify(token, now)?;
                claims.check_permission(operation, resource, now)?;
                self.cache.insert(token, operation, resource, claims.clone(), kid);
                claims
            }
        };

        if let Some(limit) = &claims.constraints.rate_limit {
            self.limiter.check(&claims.jti, limit)?;
        }
        Ok(claims)
    }

    /// Signature, time claims and revocation only.
    pub fn validate_token_structure(&self, token: &str) -> Result<Claims> {
        self.verify(token, Utc::now())
            .map(|(claims, _)| claims)
            .inspect_err(|err| {
                self.record_failure(token, err, None);
            })
    }

    /// Returns the claims and the kid of the key that verified them.
    fn verify(&self, token: &str, now: DateTime<Utc>) -> Result<(Claims, String)> {
        let header =
            decode_header(token).map_err(|e| TokenError::InvalidTokenFormat(e.to_string()))?;
        if header.alg != ALGORITHM {
            return Err(TokenError::InvalidTokenFormat(format!(
                "unsupported algorithm {:?}",
                header.alg
            )));
        }

        let named = header
            .kid
            .and_then(|kid| self.keys.verification_key(&kid).map(|key| (kid, key)));
        let candidates: Vec<(String, DecodingKey)> = match named {
            Some(named) => vec![named],
            None => self.keys.get_verification_keys().into_iter().collect(),
        };

        let mut verified = None;
        for (kid, key) in candidates {
            match decode::<Claims>(token, &key, &self.validation) {
                Ok(data) => {
                    verified = Some((data.claims, kid));
                    break;
                }
                Err(e) => match map_jwt_error(e.kind()) {
                    TokenError::InvalidSignature => continue,
                    other => return Err(other),
                },
            }
        }
        let (claims, kid) = verified.ok_or(TokenError::InvalidSignature)?;

        let skew = i64::try_from(self.config.clock_skew.as_secs()).unwrap_or(i64::MAX);
        if claims.iat > now.timestamp().saturating_add(skew) || claims.iat > claims.exp {
            return Err(TokenError::InvalidIssuedAt);
        }

        self.check_revoked(&claims)?;
        Ok((claims, kid))
    }

    fn check_revoked(&self, claims: &Claims) -> Result<()> {
        match self.revocations.first_revoked(claims.lineage_ids()) {
            Some(id) => Err(TokenError::Revoked { id: id.to_string() }),
            None => Ok(()),
        }
    }

    fn record_failure(&self, token: &str, err: &TokenError, request: Option<(&Operation, &str)>) {
        self.counters.validation_failures.fetch_add(1, Ordering::Relaxed);
        let peeked = self.peek_claims(token).ok();
        debug!(
            reason = err.reason(),
            token_id = ?peeked.as_ref().map(|c| c.jti.as_str()),
            "token validation failed"
        );
        self.audit(
            AuditEventType::TokenValidationFailed,
            json!({
                "reason": err.reason(),
                "token_id": peeked.as_ref().map(|c| c.jti.as_str()),
                "operation": request.map(|(op, _)| op.as_str()),
                "resource": request.map(|(_, resource)| resource),
            }),
            peeked.as_ref().map(|c| c.sub.as_str()),
        );
    }

    /// Decode claims without verifying anything. For diagnostics only.
    pub fn peek_claims(&self, token: &str) -> Result<Claims> {
        peek_claims(token)
    }

    /// Cheap expiry check; unreadable tokens count as expired.
    pub fn is_expired(&self, token: &str) -> bool {
        peek_claims(token).map_or(true, |claims| claims.is_expired_at(Utc::now()))
    }

    /// Revoke a token id and every token delegated from it. `None` revokes
    /// permanently; pass the token's expiry to let the entry lapse with it.
    pub fn revoke_token(&self, token_id: &str, until: Option<DateTime<Utc>>) {
        let expiry = until.map_or(RevocationExpiry::Permanent, RevocationExpiry::Until);
        self.revocations.revoke(token_id, expiry);
        let purged = self.cache.purge(token_id);
        self.limiter.forget(token_id);
        self.counters.revoked.fetch_add(1, Ordering::Relaxed);

        info!(token_id, purged, "revoked token");
        self.audit(
            AuditEventType::TokenRevoked,
            json!({ "token_id": token_id, "until": until }),
            None,
        );
    }

    /// Revoke a presented token until its own expiry. Returns its id.
    pub fn revoke_presented_token(&self, token: &str) -> Result<String> {
        let claims = peek_claims(token)?;
        self.revoke_token(&claims.jti, claims.expires_at());
        Ok(claims.jti)
    }

    pub fn get_stats(&self) -> TokenStats {
        TokenStats {
            issued: self.counters.issued.load(Ordering::Relaxed),
            delegated: self.counters.delegated.load(Ordering::Relaxed),
            validated: self.counters.validated.load(Ordering::Relaxed),
            validation_failures: self.counters.validation_failures.load(Ordering::Relaxed),
            cache_hits: self.counters.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.counters.cache_misses.load(Ordering::Relaxed),
            revoked: self.counters.revoked.load(Ordering::Relaxed),
            cached_entries: self.cache.len(),
        }
    }

    fn audit(&self, event_type: AuditEventType, details: serde_json::Value, principal: Option<&str>) {
        if let Some(audit) = &self.audit {
            audit.log_event(event_type, details, principal);
        }
    }
}

/// Decode the claims segment of a JWT without verifying it.
pub fn peek_claims(token: &str) -> Result<Claims> {
    let mut segments = token.split('.');
    let (Some(_), Some(payload), Some(_), None) =
        (segments.next(), segments.next(), segments.next(), segments.next())
    else {
        return Err(TokenError::InvalidTokenFormat(
            "expected three dot-separated segments".into(),
        ));
    };

    let bytes = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|e| TokenError::InvalidTokenFormat(e.to_string()))?;
    serde_json::from_slice(&bytes).map_err(|e| TokenError::InvalidTokenFormat(e.to_string()))
}

fn map_jwt_error(kind: &ErrorKind) -> TokenError {
    match kind {
        ErrorKind::InvalidSignature | ErrorKind::InvalidRsaKey(_) => TokenError::InvalidSignature,
        ErrorKind::ExpiredSignature => TokenError::Expired,
        ErrorKind::InvalidIssuer => TokenError::InvalidIssuer,
        ErrorKind::ImmatureSignature => TokenError::InvalidIssuedAt,
        other => TokenError::InvalidTokenFormat(format!("{other:?}")),
    }
}

fn new_token_id() -> String {
    format!("tok_{}", uuid::Uuid::new_v4().simple())
}
