//! Wires the authority, token service, key ring, revocation cache and audit
//! log together and owns their background tasks.

use std::sync::Arc;
use std::time::Duration;

use audit::{AuditEventType, AuditLogger, SinkConfig};
use revocation::{Cluster, NodeId, RevocationCache};
use serde_json::json;
use tokens::{KeyManager, TokenService};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::{AuthoritySettings, CapabilityAuthority, Config, Error};

/// A running kernel node.
///
/// Dropping the kernel stops its background tasks without flushing; call
/// [`shutdown`](Self::shutdown) to flush pending audit events first.
pub struct Kernel {
    config: Config,
    authority: CapabilityAuthority,
    tokens: Arc<TokenService>,
    keys: Arc<KeyManager>,
    revocations: Arc<RevocationCache>,
    audit: Arc<AuditLogger>,
    tasks: Vec<JoinHandle<()>>,
}

impl Kernel {
    /// Start a node with a freshly generated signing key.
    pub async fn start(config: Config, cluster: Arc<dyn Cluster>) -> Result<Self, Error> {
        config.validate()?;
        let bits = config.keys.rsa_bits;
        let keys = tokio::task::spawn_blocking(move || KeyManager::new(bits)).await??;
        Self::start_with_keys(config, cluster, Arc::new(keys)).await
    }

    /// Start a node that signs and verifies with an existing key ring.
    /// Nodes sharing a ring accept each other's tokens.
    pub async fn start_with_keys(
        config: Config,
        cluster: Arc<dyn Cluster>,
        keys: Arc<KeyManager>,
    ) -> Result<Self, Error> {
        config.validate()?;

        let sink_configs = config.audit.sinks.clone();
        let sinks = tokio::task::spawn_blocking(move || {
            sink_configs
                .iter()
                .map(SinkConfig::build)
                .collect::<audit::Result<Vec<_>>>()
        })
        .await??;
        let audit = Arc::new(AuditLogger::new(config.audit_config(), sinks));

        let revocations = Arc::new(RevocationCache::new(NodeId::random(), cluster));
        let tokens = Arc::new(
            TokenService::new(config.token_config(), Arc::clone(&keys), Arc::clone(&revocations))
                .with_audit(Arc::clone(&audit)),
        );
        let authority = CapabilityAuthority::builder(
            config.policy.clone(),
            Arc::clone(&revocations),
            Arc::clone(&audit),
        )
        .settings(AuthoritySettings::from(&config))
        .tokens(Arc::clone(&tokens))
        .start();

        let tasks = vec![
            revocations.spawn_listener(),
            revocations.spawn_cleanup(config.revocation_cleanup_interval()),
            audit.spawn_flusher(),
            authority.spawn_cleanup(config.cleanup_interval()),
            spawn_rotation(
                Arc::clone(&keys),
                Arc::clone(&audit),
                config.key_rotation_interval(),
            ),
        ];

        info!(
            node_id = %revocations.node_id(),
            kid = %keys.current_kid(),
            sinks = config.audit.sinks.len(),
            "kernel started"
        );

        Ok(Self {
            config,
            authority,
            tokens,
            keys,
            revocations,
            audit,
            tasks,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn authority(&self) -> &CapabilityAuthority {
        &self.authority
    }

    pub fn tokens(&self) -> &Arc<TokenService> {
        &self.tokens
    }

    pub fn keys(&self) -> &Arc<KeyManager> {
        &self.keys
    }

    pub fn revocations(&self) -> &Arc<RevocationCache> {
        &self.revocations
    }

    pub fn audit(&self) -> &Arc<AuditLogger> {
        &self.audit
    }

    pub fn node_id(&self) -> &NodeId {
        self.revocations.node_id()
    }

    /// Rotate the signing key now. Returns the new kid.
    pub async fn rotate_keys(&self) -> Result<String, Error> {
        rotate(&self.keys, &self.audit).await
    }

    /// Wipe every revocation on this node and its peers.
    pub fn clear_revocations(&self) {
        let cleared = self.revocations.get_stats().total;
        self.revocations.clear_all();
        warn!(cleared, "cleared all revocations");
        self.audit.log_event(
            AuditEventType::RevocationCleared,
            json!({ "node_id": self.node_id().as_str(), "cleared": cleared }),
            None,
        );
    }

    /// Stop background tasks and flush buffered audit events.
    pub async fn shutdown(mut self) -> Result<(), Error> {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        let flushed = self.audit.flush().await?;
        info!(flushed, "kernel stopped");
        Ok(())
    }
}

impl Drop for Kernel {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn rotate(keys: &Arc<KeyManager>, audit: &AuditLogger) -> Result<String, Error> {
    let previous = keys.current_kid();
    let manager = Arc::clone(keys);
    let kid = tokio::task::spawn_blocking(move || manager.rotate_keys()).await??;
    audit.log_event(
        AuditEventType::KeyRotated,
        json!({ "kid": kid, "previous_kid": previous }),
        None,
    );
    Ok(kid)
}

fn spawn_rotation(keys: Arc<KeyManager>, audit: Arc<AuditLogger>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(e) = rotate(&keys, &audit).await {
                warn!(error = %e, "scheduled key rotation failed");
            }
        }
    })
}
