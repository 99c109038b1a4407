//! The capability authority: issuance, validation, delegation and revocation.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use audit::{AuditEventType, AuditLogger};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use policy::{ConstraintSet, Decision, Operation, Policy, RateLimiter, ResourcePattern, ResourceType};
use revocation::{RevocationCache, RevocationEntry, RevocationExpiry};
use serde_json::json;
use tokens::{IssuedToken, TokenRequest, TokenService};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::signer::RecordSigner;
use crate::state::AuthorityState;
use crate::{AuthorityError, Capability, CapabilityEvent, CapabilityId, PrincipalId, Result};

const COMMAND_QUEUE_DEPTH: usize = 1024;
const EVENT_CAPACITY: usize = 1024;

/// Issuance limits applied by the authority.
#[derive(Debug, Clone)]
pub struct AuthoritySettings {
    pub default_lifetime: Duration,
    pub max_delegation_depth: u32,
    /// How long revoked records stay in the index.
    pub retention: Duration,
}

impl Default for AuthoritySettings {
    fn default() -> Self {
        Self {
            default_lifetime: Duration::from_secs(3600),
            max_delegation_depth: 3,
            retention: Duration::from_secs(3600),
        }
    }
}

impl From<&crate::Config> for AuthoritySettings {
    fn from(config: &crate::Config) -> Self {
        Self {
            default_lifetime: config.default_capability_lifetime(),
            max_delegation_depth: config.max_delegation_depth,
            retention: config.capability_retention(),
        }
    }
}

/// Point-in-time view of the authority.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityStats {
    pub total_capabilities: usize,
    pub active_capabilities: usize,
    pub revoked_capabilities: usize,
    pub principals: usize,
    pub delegation_edges: usize,
    pub created: u64,
    pub validated: u64,
    pub delegated: u64,
    pub revoked: u64,
    pub validation_failures: u64,
    pub coordinator_restarts: u64,
}

#[derive(Default)]
struct Counters {
    created: AtomicU64,
    validated: AtomicU64,
    delegated: AtomicU64,
    revoked: AtomicU64,
    validation_failures: AtomicU64,
    coordinator_restarts: AtomicU64,
}

enum Command {
    Request {
        resource_type: ResourceType,
        constraints: ConstraintSet,
        principal_id: PrincipalId,
        reply: oneshot::Sender<Result<Capability>>,
    },
    Delegate {
        parent: Box<Capability>,
        child: PrincipalId,
        extra: ConstraintSet,
        reply: oneshot::Sender<Result<Capability>>,
    },
    Revoke {
        id: CapabilityId,
        reason: String,
        reply: oneshot::Sender<Result<Vec<CapabilityId>>>,
    },
    Cleanup {
        reply: oneshot::Sender<usize>,
    },
    #[cfg(test)]
    Crash,
}

struct Shared {
    settings: AuthoritySettings,
    policy: Policy,
    signer: RecordSigner,
    /// Written only by the coordinator; validation reads it directly.
    state: RwLock<AuthorityState>,
    revocations: Arc<RevocationCache>,
    audit: Arc<AuditLogger>,
    tokens: Option<Arc<TokenService>>,
    limiter: RateLimiter,
    events: broadcast::Sender<CapabilityEvent>,
    counters: Counters,
}

/// Central capability coordinator.
///
/// Mutations (request, delegate, revoke, cleanup) are queued to a single
/// coordinator task and applied one at a time. Validation and queries read
/// the current state without going through the queue.
///
/// Cloning is cheap; clones share one coordinator.
#[derive(Clone)]
pub struct CapabilityAuthority {
    commands: mpsc::Sender<Command>,
    shared: Arc<Shared>,
}

/// Builder for [`CapabilityAuthority`].
pub struct AuthorityBuilder {
    settings: AuthoritySettings,
    policy: Policy,
    revocations: Arc<RevocationCache>,
    audit: Arc<AuditLogger>,
    tokens: Option<Arc<TokenService>>,
}

impl AuthorityBuilder {
    #[must_use]
    pub fn settings(mut self, settings: AuthoritySettings) -> Self {
        self.settings = settings;
        self
    }

    /// Enable [`CapabilityAuthority::export_token`].
    #[must_use]
    pub fn tokens(mut self, tokens: Arc<TokenService>) -> Self {
        self.tokens = Some(tokens);
        self
    }

    /// Spawn the coordinator. Must be called inside a tokio runtime.
    pub fn start(self) -> CapabilityAuthority {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let shared = Arc::new(Shared {
            settings: self.settings,
            policy: self.policy,
            signer: RecordSigner::generate(),
            state: RwLock::new(AuthorityState::default()),
            revocations: self.revocations,
            audit: self.audit,
            tokens: self.tokens,
            limiter: RateLimiter::new(),
            events,
            counters: Counters::default(),
        });

        let (commands, inbox) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        tokio::spawn(coordinate(Arc::clone(&shared), inbox));

        CapabilityAuthority { commands, shared }
    }
}

/// Apply commands one at a time until every handle is dropped.
///
/// A command that panics loses its reply, the state is reset, and the loop
/// carries on: revocations survive in the revocation cache.
async fn coordinate(shared: Arc<Shared>, mut inbox: mpsc::Receiver<Command>) {
    debug!("capability coordinator started");
    while let Some(command) = inbox.recv().await {
        let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| shared.apply(command)));
        if let Err(panic) = outcome {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".into());
            shared.restart(&message);
        }
    }
    debug!("capability coordinator stopped");
}

impl CapabilityAuthority {
    pub fn builder(
        policy: Policy,
        revocations: Arc<RevocationCache>,
        audit: Arc<AuditLogger>,
    ) -> AuthorityBuilder {
        AuthorityBuilder {
            settings: AuthoritySettings::default(),
            policy,
            revocations,
            audit,
            tokens: None,
        }
    }

    async fn call<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> std::result::Result<T, AuthorityError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| AuthorityError::CoordinatorUnavailable)?;
        response.await.map_err(|_| AuthorityError::CoordinatorUnavailable)
    }

    /// Issue a root capability if policy allows it.
    ///
    /// Unset paths and operations are filled from the policy rule; an unset
    /// expiry becomes now plus the default lifetime.
    pub async fn request_capability(
        &self,
        resource_type: ResourceType,
        constraints: ConstraintSet,
        principal_id: impl Into<PrincipalId>,
    ) -> Result<Capability> {
        let principal_id = principal_id.into();
        self.call(|reply| Command::Request {
            resource_type,
            constraints,
            principal_id,
            reply,
        })
        .await?
    }

    /// Derive a narrower capability from `parent` for another principal.
    pub async fn delegate_capability(
        &self,
        parent: &Capability,
        child_principal_id: impl Into<PrincipalId>,
        extra_constraints: ConstraintSet,
    ) -> Result<Capability> {
        let child = child_principal_id.into();
        let parent = Box::new(parent.clone());
        self.call(|reply| Command::Delegate {
            parent,
            child,
            extra: extra_constraints,
            reply,
        })
        .await?
    }

    /// Revoke a capability and everything delegated from it.
    ///
    /// Returns the ids newly revoked by this call; revoking an already
    /// revoked capability succeeds with an empty list.
    pub async fn revoke_capability(&self, capability: &Capability, reason: &str) -> Result<Vec<CapabilityId>> {
        self.revoke_by_id(&capability.id, reason).await
    }

    pub async fn revoke_by_id(&self, id: &CapabilityId, reason: &str) -> Result<Vec<CapabilityId>> {
        let id = id.clone();
        let reason = reason.to_string();
        self.call(|reply| Command::Revoke { id, reason, reply }).await?
    }

    /// Drop expired records and revoked records past retention.
    pub async fn cleanup_expired_capabilities(&self) -> Result<usize> {
        self.call(|reply| Command::Cleanup { reply }).await
    }

    /// Check a presented capability for `operation` on `resource`.
    pub fn validate_capability(
        &self,
        capability: &Capability,
        operation: &Operation,
        resource: &str,
    ) -> Result<()> {
        let shared = &self.shared;
        let outcome = shared
            .check_record(capability, Utc::now())
            .and_then(|stored| {
                stored.constraints.permits(operation, resource, Utc::now())?;
                if let Some(limit) = &stored.constraints.rate_limit {
                    shared.limiter.check(stored.id.as_str(), limit)?;
                }
                Ok(())
            });

        match &outcome {
            Ok(()) => {
                shared.counters.validated.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                shared.counters.validation_failures.fetch_add(1, Ordering::Relaxed);
                debug!(
                    capability_id = %capability.id,
                    reason = err.reason(),
                    operation = %operation,
                    resource,
                    "capability validation failed"
                );
                let event = match err {
                    AuthorityError::SignatureMismatch(_) => AuditEventType::SecurityViolation,
                    _ => AuditEventType::ValidationFailed,
                };
                shared.audit.log_event(
                    event,
                    json!({
                        "capability_id": capability.id,
                        "reason": err.reason(),
                        "operation": operation,
                        "resource": resource,
                    }),
                    Some(capability.principal_id.as_str()),
                );
            }
        }
        outcome
    }

    /// Active capabilities held by `principal_id`.
    pub fn list_capabilities(&self, principal_id: &PrincipalId) -> Vec<Capability> {
        let now = Utc::now();
        let state = self.shared.state.read();
        state
            .for_principal(principal_id)
            .filter(|cap| cap.is_active_at(now) && !self.shared.revocations.is_revoked(cap.id.as_str()))
            .cloned()
            .collect()
    }

    /// Whether any of the principal's capabilities allows the request.
    /// Returns the first capability that does. A use is counted against that
    /// capability's rate limit; a capability that is out of uses is passed
    /// over for the next one.
    pub fn check_permission(
        &self,
        principal_id: &PrincipalId,
        resource_type: ResourceType,
        operation: &Operation,
        resource: &str,
    ) -> Result<CapabilityId> {
        let shared = &self.shared;
        let now = Utc::now();
        let mut limited = None;
        let granted = {
            let state = shared.state.read();
            state
                .for_principal(principal_id)
                .filter(|cap| cap.resource_type == resource_type && cap.is_active_at(now))
                .filter(|cap| !shared.revocations.is_revoked(cap.id.as_str()))
                .filter(|cap| cap.constraints.permits(operation, resource, now).is_ok())
                .find(|cap| match &cap.constraints.rate_limit {
                    Some(limit) => match shared.limiter.check(cap.id.as_str(), limit) {
                        Ok(()) => true,
                        Err(denial) => {
                            limited.get_or_insert(denial);
                            false
                        }
                    },
                    None => true,
                })
                .map(|cap| cap.id.clone())
        };

        if let Some(id) = granted {
            shared.counters.validated.fetch_add(1, Ordering::Relaxed);
            return Ok(id);
        }

        shared.counters.validation_failures.fetch_add(1, Ordering::Relaxed);
        let err = match limited {
            Some(denial) => AuthorityError::Denied(denial),
            None => AuthorityError::PermissionDenied {
                principal: principal_id.to_string(),
                operation: operation.to_string(),
                resource: resource.to_string(),
            },
        };
        debug!(
            principal = %principal_id,
            reason = err.reason(),
            operation = %operation,
            resource,
            "permission check failed"
        );
        shared.audit.log_event(
            AuditEventType::ValidationFailed,
            json!({
                "reason": err.reason(),
                "resource_type": resource_type,
                "operation": operation,
                "resource": resource,
            }),
            Some(principal_id.as_str()),
        );
        Err(err)
    }

    /// Issue a portable token for a live capability. The token's `jti` is
    /// the capability id, so revoking the capability revokes the token.
    pub fn export_token(&self, capability: &Capability) -> Result<IssuedToken> {
        let tokens = self
            .shared
            .tokens
            .as_ref()
            .ok_or(AuthorityError::TokensUnavailable)?;
        let stored = self.shared.check_record(capability, Utc::now())?;

        let resource = match stored.constraints.paths.as_deref() {
            Some([single]) => single.clone(),
            _ => ResourcePattern::any(),
        };
        let operations: Vec<Operation> = stored
            .constraints
            .operations
            .iter()
            .flatten()
            .cloned()
            .collect();

        let request = TokenRequest::new(stored.resource_type, resource, stored.principal_id.as_str())
            .operations(operations)
            .constraints(stored.constraints.clone())
            .id(stored.id.as_str())
            .max_delegation_depth(
                stored
                    .max_delegation_depth
                    .saturating_sub(stored.delegation_depth),
            );
        Ok(tokens.issue_token(request)?)
    }

    pub fn get_capability(&self, id: &CapabilityId) -> Option<Capability> {
        self.shared.state.read().get(id).cloned()
    }

    pub fn get_security_stats(&self) -> SecurityStats {
        let now = Utc::now();
        let state = self.shared.state.read();
        let counters = &self.shared.counters;
        SecurityStats {
            total_capabilities: state.len(),
            active_capabilities: state.active(now),
            revoked_capabilities: state.revoked(),
            principals: state.principals(),
            delegation_edges: state.delegation_edges(),
            created: counters.created.load(Ordering::Relaxed),
            validated: counters.validated.load(Ordering::Relaxed),
            delegated: counters.delegated.load(Ordering::Relaxed),
            revoked: counters.revoked.load(Ordering::Relaxed),
            validation_failures: counters.validation_failures.load(Ordering::Relaxed),
            coordinator_restarts: counters.coordinator_restarts.load(Ordering::Relaxed),
        }
    }

    /// Lifecycle notifications for capabilities created, delegated, revoked
    /// or removed after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<CapabilityEvent> {
        self.shared.events.subscribe()
    }

    /// Run [`cleanup_expired_capabilities`](Self::cleanup_expired_capabilities)
    /// every `period`.
    pub fn spawn_cleanup(&self, period: Duration) -> JoinHandle<()> {
        let authority = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = authority.cleanup_expired_capabilities().await {
                    warn!(error = %e, "capability cleanup failed");
                    break;
                }
            }
        })
    }

    #[cfg(test)]
    async fn crash_coordinator(&self) {
        let _ = self.commands.send(Command::Crash).await;
    }
}

impl Shared {
    fn apply(&self, command: Command) {
        match command {
            Command::Request {
                resource_type,
                constraints,
                principal_id,
                reply,
            } => {
                let _ = reply.send(self.request(resource_type, constraints, principal_id));
            }
            Command::Delegate {
                parent,
                child,
                extra,
                reply,
            } => {
                let _ = reply.send(self.delegate(&parent, child, extra));
            }
            Command::Revoke { id, reason, reply } => {
                let _ = reply.send(self.revoke(&id, &reason));
            }
            Command::Cleanup { reply } => {
                let _ = reply.send(self.cleanup(Utc::now()));
            }
            #[cfg(test)]
            Command::Crash => panic!("injected coordinator failure"),
        }
    }

    fn restart(&self, message: &str) {
        let lost = {
            let mut state = self.state.write();
            let lost = state.len();
            *state = AuthorityState::default();
            lost
        };
        self.counters.coordinator_restarts.fetch_add(1, Ordering::Relaxed);
        error!(panic = message, lost, "capability coordinator panicked, restarted with empty state");
        self.audit.log_event(
            AuditEventType::CoordinatorRestarted,
            json!({ "panic": message, "capabilities_lost": lost }),
            None,
        );
    }

    /// Checks shared by validation, delegation and export: the record must
    /// be the one on file, intact, unexpired and unrevoked.
    fn check_record(&self, presented: &Capability, now: DateTime<Utc>) -> Result<Capability> {
        let stored = self
            .state
            .read()
            .get(&presented.id)
            .cloned()
            .ok_or_else(|| AuthorityError::CapabilityNotFound(presented.id.clone()))?;

        if presented.signature != stored.signature || !self.signer.verify(presented) {
            return Err(AuthorityError::SignatureMismatch(presented.id.clone()));
        }
        if stored.is_expired_at(now) {
            return Err(AuthorityError::Expired(stored.id));
        }
        if stored.revoked || self.revocations.is_revoked(stored.id.as_str()) {
            return Err(AuthorityError::Revoked(stored.id));
        }
        Ok(stored)
    }

    fn publish(&self, event: CapabilityEvent) {
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }

    fn request(
        &self,
        resource_type: ResourceType,
        constraints: ConstraintSet,
        principal_id: PrincipalId,
    ) -> Result<Capability> {
        let mut constraints = self.policy.apply_defaults(resource_type, constraints);
        if let Decision::Deny(violation) = self.policy.check(resource_type, &constraints) {
            info!(principal = %principal_id, reason = violation.reason(), "capability request denied");
            self.audit.log_event(
                AuditEventType::PolicyViolation,
                json!({
                    "reason": violation.reason(),
                    "detail": violation.to_string(),
                    "resource_type": resource_type,
                }),
                Some(principal_id.as_str()),
            );
            return Err(violation.into());
        }

        let now = Utc::now();
        let expires_at = constraints.expires_at.unwrap_or_else(|| {
            now.checked_add_signed(lifetime(self.settings.default_lifetime))
                .unwrap_or(DateTime::<Utc>::MAX_UTC)
        });
        constraints.expires_at = Some(expires_at);

        let mut cap = Capability {
            id: CapabilityId::new(),
            resource_type,
            constraints,
            principal_id,
            parent_id: None,
            delegation_depth: 0,
            max_delegation_depth: self.settings.max_delegation_depth,
            created_at: now,
            expires_at: Some(expires_at),
            signature: String::new(),
            revoked: false,
        };
        cap.signature = self.signer.sign(&cap)?;
        self.state.write().insert(cap.clone());

        self.counters.created.fetch_add(1, Ordering::Relaxed);
        debug!(capability_id = %cap.id, principal = %cap.principal_id, "capability created");
        self.audit.log_event(
            AuditEventType::CapabilityCreated,
            json!({
                "capability_id": cap.id,
                "resource_type": resource_type,
                "constraints": cap.constraints,
                "expires_at": expires_at,
            }),
            Some(cap.principal_id.as_str()),
        );
        self.publish(CapabilityEvent::Created {
            id: cap.id.clone(),
            principal_id: cap.principal_id.clone(),
            resource_type,
        });
        Ok(cap)
    }

    fn delegate(&self, parent: &Capability, child: PrincipalId, extra: ConstraintSet) -> Result<Capability> {
        let result = self.try_delegate(parent, child.clone(), &extra);
        if let Err(err) = &result {
            info!(parent = %parent.id, child = %child, reason = err.reason(), "delegation denied");
            self.audit.log_event(
                AuditEventType::DelegationDenied,
                json!({
                    "parent_id": parent.id,
                    "child_principal_id": child,
                    "reason": err.reason(),
                }),
                Some(parent.principal_id.as_str()),
            );
        }
        result
    }

    fn try_delegate(&self, presented: &Capability, child: PrincipalId, extra: &ConstraintSet) -> Result<Capability> {
        let now = Utc::now();
        let parent = self.check_record(presented, now)?;

        let depth = parent.delegation_depth + 1;
        if depth > parent.max_delegation_depth {
            return Err(AuthorityError::DelegationDepthExceeded {
                depth,
                max: parent.max_delegation_depth,
            });
        }
        if parent.constraints.max_delegations == Some(0) {
            return Err(AuthorityError::DelegationNotAllowed);
        }

        let mut constraints = parent.constraints.narrow(extra)?;
        let expires_at = match (parent.expires_at, constraints.expires_at) {
            (Some(p), Some(c)) => Some(p.min(c)),
            (p, c) => p.or(c),
        };
        constraints.expires_at = expires_at;

        let mut cap = Capability {
            id: CapabilityId::new(),
            resource_type: parent.resource_type,
            constraints,
            principal_id: child,
            parent_id: Some(parent.id.clone()),
            delegation_depth: depth,
            max_delegation_depth: parent.max_delegation_depth,
            created_at: now,
            expires_at,
            signature: String::new(),
            revoked: false,
        };
        cap.signature = self.signer.sign(&cap)?;
        self.state.write().insert(cap.clone());

        self.counters.delegated.fetch_add(1, Ordering::Relaxed);
        debug!(capability_id = %cap.id, parent = %parent.id, depth, "capability delegated");
        self.audit.log_event(
            AuditEventType::CapabilityDelegated,
            json!({
                "capability_id": cap.id,
                "parent_id": parent.id,
                "delegation_depth": depth,
                "constraints": cap.constraints,
                "expires_at": cap.expires_at,
            }),
            Some(cap.principal_id.as_str()),
        );
        self.publish(CapabilityEvent::Delegated {
            id: cap.id.clone(),
            parent_id: parent.id,
            principal_id: cap.principal_id.clone(),
        });
        Ok(cap)
    }

    fn revoke(&self, root: &CapabilityId, reason: &str) -> Result<Vec<CapabilityId>> {
        let now = Utc::now();
        let mut newly = Vec::new();
        {
            let mut state = self.state.write();
            if !state.contains(root) {
                return Err(AuthorityError::CapabilityNotFound(root.clone()));
            }
            for id in state.subtree(root) {
                if state.mark_revoked(&id, now) {
                    newly.extend(state.get(&id).cloned());
                }
            }
        }

        if newly.is_empty() {
            debug!(capability_id = %root, "capability already revoked");
            return Ok(Vec::new());
        }

        self.revocations.revoke_batch(
            newly
                .iter()
                .map(|cap| RevocationEntry {
                    id: cap.id.to_string(),
                    expiry: cap
                        .expires_at
                        .map_or(RevocationExpiry::Permanent, RevocationExpiry::Until),
                })
                .collect(),
        );

        for cap in &newly {
            self.limiter.forget(cap.id.as_str());
            self.audit.log_event(
                AuditEventType::CapabilityRevoked,
                json!({
                    "capability_id": cap.id,
                    "root_id": root,
                    "cascade": &cap.id != root,
                    "reason": reason,
                }),
                Some(cap.principal_id.as_str()),
            );
            self.publish(CapabilityEvent::Revoked {
                id: cap.id.clone(),
                reason: reason.to_string(),
            });
        }
        self.counters
            .revoked
            .fetch_add(newly.len() as u64, Ordering::Relaxed);
        info!(capability_id = %root, count = newly.len(), reason, "revoked capability subtree");

        Ok(newly.into_iter().map(|cap| cap.id).collect())
    }

    fn cleanup(&self, now: DateTime<Utc>) -> usize {
        let mut removed = Vec::new();
        {
            let mut state = self.state.write();
            for id in state.stale(now, lifetime(self.settings.retention)) {
                if state.remove(&id).is_some() {
                    removed.push(id);
                }
            }
        }

        for id in &removed {
            self.limiter.forget(id.as_str());
            self.publish(CapabilityEvent::Removed { id: id.clone() });
        }
        if !removed.is_empty() {
            debug!(removed = removed.len(), "removed stale capabilities");
        }
        removed.len()
    }
}

fn lifetime(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use audit::{AuditConfig, AuditEvent, SearchCriteria, SearchOptions};
    use chrono::Timelike;
    use policy::{RateLimit, TimeWindow};

    struct Harness {
        authority: CapabilityAuthority,
        audit: Arc<AuditLogger>,
        revocations: Arc<RevocationCache>,
    }

    fn policy() -> Policy {
        Policy::parse(
            r#"
            [rules.filesystem]
            paths = ["/**"]
            operations = ["read", "write", "list"]

            [rules.network]
            operations = ["connect"]

            [deny]
            all = ["process"]
            "#,
        )
        .unwrap()
    }

    fn harness_with(settings: AuthoritySettings) -> Harness {
        let audit = Arc::new(AuditLogger::new(AuditConfig::default(), Vec::new()));
        let revocations = Arc::new(RevocationCache::standalone());
        let authority = CapabilityAuthority::builder(policy(), revocations.clone(), audit.clone())
            .settings(settings)
            .start();
        Harness {
            authority,
            audit,
            revocations,
        }
    }

    fn harness() -> Harness {
        harness_with(AuthoritySettings::default())
    }

    fn tmp(ops: &[&str]) -> ConstraintSet {
        ConstraintSet::new()
            .with_paths(["/tmp/**"])
            .with_operations(ops.iter().copied())
    }

    async fn audited(audit: &AuditLogger, event_type: AuditEventType) -> Vec<AuditEvent> {
        audit.flush().await.unwrap();
        audit.search_events(
            &SearchCriteria::new().event_type(event_type),
            &SearchOptions::default(),
        )
    }

    fn reason<T: std::fmt::Debug>(result: Result<T>) -> &'static str {
        result.unwrap_err().reason()
    }

    #[tokio::test]
    async fn tmp_read_scenario() {
        let h = harness();
        let cap = h
            .authority
            .request_capability(ResourceType::Filesystem, tmp(&["read"]), "agent")
            .await
            .unwrap();
        assert!(cap.id.as_str().starts_with("cap_"));
        assert_eq!(cap.delegation_depth, 0);

        let read = Operation::read();
        assert!(h.authority.validate_capability(&cap, &read, "/tmp/a/b.txt").is_ok());
        assert_eq!(
            reason(h.authority.validate_capability(&cap, &Operation::write(), "/tmp/a/b.txt")),
            "operation_not_permitted"
        );
        assert_eq!(
            reason(h.authority.validate_capability(&cap, &read, "/etc/passwd")),
            "resource_not_permitted"
        );

        let failures = audited(&h.audit, AuditEventType::ValidationFailed).await;
        assert_eq!(failures.len(), 2);
        assert_eq!(failures[0].principal_id.as_deref(), Some("agent"));
    }

    #[tokio::test]
    async fn policy_rejections_carry_reasons() {
        let h = harness();
        let a = &h.authority;

        let outside = ConstraintSet::new().with_paths(["relative/**"]);
        assert_eq!(
            reason(a.request_capability(ResourceType::Filesystem, outside, "p").await),
            "path_not_allowed"
        );
        let delete = tmp(&["delete"]);
        assert_eq!(
            reason(a.request_capability(ResourceType::Filesystem, delete, "p").await),
            "operation_not_allowed"
        );
        assert_eq!(
            reason(a.request_capability(ResourceType::Process, ConstraintSet::new(), "p").await),
            "resource_type_denied"
        );
        assert_eq!(
            reason(a.request_capability(ResourceType::Database, ConstraintSet::new(), "p").await),
            "resource_type_not_allowed"
        );

        assert_eq!(audited(&h.audit, AuditEventType::PolicyViolation).await.len(), 4);
    }

    #[tokio::test]
    async fn unset_constraints_come_from_policy() {
        let h = harness();
        let before = Utc::now();
        let cap = h
            .authority
            .request_capability(ResourceType::Filesystem, ConstraintSet::new(), "p")
            .await
            .unwrap();

        let ops: Vec<_> = cap.constraints.operations.iter().flatten().map(Operation::as_str).collect();
        assert_eq!(ops, ["list", "read", "write"]);
        assert_eq!(cap.constraints.paths, Some(vec![ResourcePattern::new("/**")]));

        let expires_at = cap.expires_at.unwrap();
        assert!(expires_at >= before + chrono::Duration::seconds(3599));
        assert_eq!(cap.constraints.expires_at, cap.expires_at);
    }

    #[tokio::test]
    async fn delegation_scenario() {
        let h = harness();
        let parent = h
            .authority
            .request_capability(ResourceType::Filesystem, tmp(&["read", "write"]), "parent")
            .await
            .unwrap();

        let child = h
            .authority
            .delegate_capability(
                &parent,
                "child",
                ConstraintSet::new().with_operations(["read"]).with_max_delegations(0),
            )
            .await
            .unwrap();
        assert_eq!(child.delegation_depth, 1);
        assert_eq!(child.parent_id.as_ref(), Some(&parent.id));
        assert_eq!(child.principal_id.as_str(), "child");
        assert!(child.constraints.is_subset_of(&parent.constraints));
        assert!(child.expires_at <= parent.expires_at);
        assert!(h.authority.validate_capability(&child, &Operation::read(), "/tmp/x").is_ok());
        assert_eq!(
            reason(h.authority.validate_capability(&child, &Operation::write(), "/tmp/x")),
            "operation_not_permitted"
        );

        assert_eq!(
            reason(h.authority.delegate_capability(&child, "grandchild", ConstraintSet::new()).await),
            "delegation_not_allowed"
        );
        assert_eq!(audited(&h.audit, AuditEventType::DelegationDenied).await.len(), 1);
    }

    #[tokio::test]
    async fn delegation_depth_is_bounded_by_root() {
        let h = harness_with(AuthoritySettings {
            max_delegation_depth: 1,
            ..AuthoritySettings::default()
        });
        let root = h
            .authority
            .request_capability(ResourceType::Filesystem, tmp(&["read"]), "root")
            .await
            .unwrap();
        let c1 = h
            .authority
            .delegate_capability(&root, "c1", ConstraintSet::new())
            .await
            .unwrap();
        assert_eq!(
            reason(h.authority.delegate_capability(&c1, "c2", ConstraintSet::new()).await),
            "delegation_depth_exceeded"
        );
    }

    #[tokio::test]
    async fn delegation_never_widens() {
        let h = harness();
        let parent = h
            .authority
            .request_capability(ResourceType::Filesystem, tmp(&["read"]), "parent")
            .await
            .unwrap();

        assert_eq!(
            reason(
                h.authority
                    .delegate_capability(&parent, "child", ConstraintSet::new().with_operations(["write"]))
                    .await
            ),
            "constraint_widening"
        );

        let later = parent.expires_at.unwrap() + chrono::Duration::days(1);
        let child = h
            .authority
            .delegate_capability(&parent, "child", ConstraintSet::new().with_expires_at(later))
            .await
            .unwrap();
        assert_eq!(child.expires_at, parent.expires_at);
    }

    #[tokio::test]
    async fn revocation_cascades_once() {
        let h = harness();
        let p = h
            .authority
            .request_capability(ResourceType::Filesystem, tmp(&["read"]), "p")
            .await
            .unwrap();
        let c1 = h.authority.delegate_capability(&p, "c1", ConstraintSet::new()).await.unwrap();
        let c2 = h.authority.delegate_capability(&c1, "c2", ConstraintSet::new()).await.unwrap();

        let revoked = h.authority.revoke_capability(&p, "compromised").await.unwrap();
        assert_eq!(revoked, [p.id.clone(), c1.id.clone(), c2.id.clone()]);

        for cap in [&p, &c1, &c2] {
            assert_eq!(
                reason(h.authority.validate_capability(cap, &Operation::read(), "/tmp/x")),
                "capability_revoked"
            );
            assert!(h.revocations.is_revoked(cap.id.as_str()));
        }

        assert!(h.authority.revoke_capability(&c1, "again").await.unwrap().is_empty());
        let events = audited(&h.audit, AuditEventType::CapabilityRevoked).await;
        assert_eq!(events.len(), 3);
        assert_eq!(events[2].details["cascade"], true);
        assert_eq!(h.authority.get_security_stats().revoked, 3);
    }

    #[tokio::test]
    async fn unknown_capabilities_are_not_found() {
        let h = harness();
        let mut ghost = h
            .authority
            .request_capability(ResourceType::Filesystem, tmp(&["read"]), "p")
            .await
            .unwrap();
        ghost.id = CapabilityId::new();

        assert_eq!(
            reason(h.authority.validate_capability(&ghost, &Operation::read(), "/tmp/x")),
            "capability_not_found"
        );
        assert_eq!(reason(h.authority.revoke_by_id(&ghost.id, "x").await), "capability_not_found");
    }

    #[tokio::test]
    async fn tampered_record_is_rejected() {
        let h = harness();
        let cap = h
            .authority
            .request_capability(ResourceType::Filesystem, tmp(&["read"]), "p")
            .await
            .unwrap();

        let mut forged = cap.clone();
        forged.constraints = tmp(&["read", "write"]);
        forged.constraints.expires_at = cap.expires_at;
        assert_eq!(
            reason(h.authority.validate_capability(&forged, &Operation::write(), "/tmp/x")),
            "capability_signature_mismatch"
        );
        assert_eq!(audited(&h.audit, AuditEventType::SecurityViolation).await.len(), 1);
    }

    #[tokio::test]
    async fn expired_capabilities_fail_then_get_cleaned_up() {
        let h = harness();
        let past = Utc::now() - chrono::Duration::seconds(5);
        let cap = h
            .authority
            .request_capability(ResourceType::Filesystem, tmp(&["read"]).with_expires_at(past), "p")
            .await
            .unwrap();

        assert_eq!(
            reason(h.authority.validate_capability(&cap, &Operation::read(), "/tmp/x")),
            "capability_expired"
        );
        assert!(h.authority.list_capabilities(&"p".into()).is_empty());

        assert_eq!(h.authority.cleanup_expired_capabilities().await.unwrap(), 1);
        assert_eq!(h.authority.cleanup_expired_capabilities().await.unwrap(), 0);
        assert!(h.authority.get_capability(&cap.id).is_none());
    }

    #[tokio::test]
    async fn stateful_constraints_are_enforced() {
        let h = harness();
        let limited = h
            .authority
            .request_capability(
                ResourceType::Filesystem,
                tmp(&["read"]).with_rate_limit(RateLimit::new(1, 60)),
                "p",
            )
            .await
            .unwrap();
        assert!(h.authority.validate_capability(&limited, &Operation::read(), "/tmp/x").is_ok());
        assert_eq!(
            reason(h.authority.validate_capability(&limited, &Operation::read(), "/tmp/x")),
            "rate_limited"
        );

        let hour = Utc::now().hour() as u8;
        let later = TimeWindow::new(hour + 2, hour + 3);
        let windowed = h
            .authority
            .request_capability(ResourceType::Filesystem, tmp(&["read"]).with_time_window(later), "p")
            .await
            .unwrap();
        assert_eq!(
            reason(h.authority.validate_capability(&windowed, &Operation::read(), "/tmp/x")),
            "outside_time_window"
        );

        let texts = h
            .authority
            .request_capability(ResourceType::Filesystem, tmp(&["read"]).with_extensions(["txt"]), "p")
            .await
            .unwrap();
        assert_eq!(
            reason(h.authority.validate_capability(&texts, &Operation::read(), "/tmp/run.sh")),
            "extension_not_allowed"
        );
    }

    #[tokio::test]
    async fn permission_is_an_or_over_capabilities() {
        let h = harness();
        let principal = PrincipalId::new("p");
        h.authority
            .request_capability(ResourceType::Filesystem, tmp(&["read"]), principal.clone())
            .await
            .unwrap();
        let logs = h
            .authority
            .request_capability(
                ResourceType::Filesystem,
                ConstraintSet::new().with_paths(["/var/log/**"]).with_operations(["write"]),
                principal.clone(),
            )
            .await
            .unwrap();

        let write = Operation::write();
        let granted = h
            .authority
            .check_permission(&principal, ResourceType::Filesystem, &write, "/var/log/app.log")
            .unwrap();
        assert_eq!(granted, logs.id);
        assert_eq!(
            reason(h.authority.check_permission(&principal, ResourceType::Filesystem, &write, "/tmp/x")),
            "permission_denied"
        );
        assert_eq!(
            reason(h.authority.check_permission(&principal, ResourceType::Network, &write, "/var/log/app.log")),
            "permission_denied"
        );
        assert_eq!(h.authority.list_capabilities(&principal).len(), 2);
    }

    #[tokio::test]
    async fn permission_checks_spend_rate_limits_and_count() {
        let h = harness();
        let principal = PrincipalId::new("p");
        let limited = h
            .authority
            .request_capability(
                ResourceType::Filesystem,
                tmp(&["read"]).with_rate_limit(RateLimit::new(1, 60)),
                principal.clone(),
            )
            .await
            .unwrap();

        let read = Operation::read();
        let granted = h
            .authority
            .check_permission(&principal, ResourceType::Filesystem, &read, "/tmp/x")
            .unwrap();
        assert_eq!(granted, limited.id);
        assert_eq!(
            reason(h.authority.check_permission(&principal, ResourceType::Filesystem, &read, "/tmp/x")),
            "rate_limited"
        );
        // The limit is shared with presented-capability validation.
        assert_eq!(
            reason(h.authority.validate_capability(&limited, &read, "/tmp/x")),
            "rate_limited"
        );

        // An unlimited capability covers the request once the first is spent.
        let spare = h
            .authority
            .request_capability(ResourceType::Filesystem, tmp(&["read"]), principal.clone())
            .await
            .unwrap();
        let granted = h
            .authority
            .check_permission(&principal, ResourceType::Filesystem, &read, "/tmp/x")
            .unwrap();
        assert_eq!(granted, spare.id);

        let stats = h.authority.get_security_stats();
        assert_eq!(stats.validated, 2);
        assert_eq!(stats.validation_failures, 2);
    }

    #[tokio::test]
    async fn stats_track_lifecycle() {
        let h = harness();
        let p = h
            .authority
            .request_capability(ResourceType::Filesystem, tmp(&["read"]), "p")
            .await
            .unwrap();
        let c = h.authority.delegate_capability(&p, "c", ConstraintSet::new()).await.unwrap();
        h.authority.validate_capability(&c, &Operation::read(), "/tmp/x").unwrap();
        let _ = h.authority.validate_capability(&c, &Operation::write(), "/tmp/x");
        h.authority.revoke_capability(&c, "done").await.unwrap();

        let stats = h.authority.get_security_stats();
        assert_eq!(stats.total_capabilities, 2);
        assert_eq!(stats.active_capabilities, 1);
        assert_eq!(stats.revoked_capabilities, 1);
        assert_eq!(stats.principals, 2);
        assert_eq!(stats.delegation_edges, 1);
        assert_eq!((stats.created, stats.delegated, stats.revoked), (1, 1, 1));
        assert_eq!((stats.validated, stats.validation_failures), (1, 1));
    }

    #[tokio::test]
    async fn subscribers_see_lifecycle_events() {
        let h = harness();
        let mut events = h.authority.subscribe();

        let p = h
            .authority
            .request_capability(ResourceType::Filesystem, tmp(&["read"]), "p")
            .await
            .unwrap();
        let c = h.authority.delegate_capability(&p, "c", ConstraintSet::new()).await.unwrap();
        h.authority.revoke_capability(&p, "rotate").await.unwrap();

        assert!(matches!(events.recv().await.unwrap(), CapabilityEvent::Created { id, .. } if id == p.id));
        assert!(matches!(
            events.recv().await.unwrap(),
            CapabilityEvent::Delegated { id, parent_id, .. } if id == c.id && parent_id == p.id
        ));
        assert_eq!(events.recv().await.unwrap().id(), &p.id);
        assert_eq!(events.recv().await.unwrap().id(), &c.id);
    }

    #[tokio::test]
    async fn coordinator_restarts_with_empty_state() {
        let h = harness();
        let before = h
            .authority
            .request_capability(ResourceType::Filesystem, tmp(&["read"]), "p")
            .await
            .unwrap();
        h.authority.revoke_capability(&before, "pre-crash").await.unwrap();

        h.authority.crash_coordinator().await;

        let after = h
            .authority
            .request_capability(ResourceType::Filesystem, tmp(&["read"]), "p")
            .await
            .unwrap();
        assert!(h.authority.validate_capability(&after, &Operation::read(), "/tmp/x").is_ok());
        assert_eq!(
            reason(h.authority.validate_capability(&before, &Operation::read(), "/tmp/x")),
            "capability_not_found"
        );
        assert!(h.revocations.is_revoked(before.id.as_str()));
        assert_eq!(h.authority.get_security_stats().coordinator_restarts, 1);
        assert_eq!(audited(&h.audit, AuditEventType::CoordinatorRestarted).await.len(), 1);
    }

    #[tokio::test]
    async fn export_requires_token_service() {
        let h = harness();
        let cap = h
            .authority
            .request_capability(ResourceType::Filesystem, tmp(&["read"]), "p")
            .await
            .unwrap();
        assert_eq!(reason(h.authority.export_token(&cap)), "token_service_unavailable");
    }
}
