//! Configuration loading from keel.toml.

use std::path::Path;
use std::time::Duration;

use audit::{AuditConfig, SinkConfig};
use policy::Policy;
use serde::{Deserialize, Serialize};
use tokens::TokenConfig;

/// Smallest RSA modulus accepted for token signing keys.
pub const MIN_RSA_BITS: usize = 2048;

/// Top-level configuration. Every field has a default, so an empty file is
/// a valid configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// `iss` claim of issued tokens.
    pub issuer: String,

    /// Lifetime of a capability requested without an explicit expiry.
    pub default_capability_lifetime_secs: u64,

    /// Deepest delegation chain below a root capability.
    pub max_delegation_depth: u32,

    /// How long revoked records stay visible before cleanup removes them.
    pub capability_retention_secs: u64,

    /// Period of the expired-capability sweep.
    pub cleanup_interval_secs: u64,

    /// Issuance rules. Defaults to [`Policy::restrictive`].
    pub policy: Policy,

    pub audit: AuditSection,
    pub keys: KeysSection,
    pub revocation: RevocationSection,
    pub tokens: TokensSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditSection {
    pub buffer_size: usize,
    pub flush_interval_ms: u64,
    pub flush_timeout_ms: u64,
    pub max_buffered: usize,
    pub retained_events: usize,
    pub sinks: Vec<SinkConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeysSection {
    pub rotation_interval_secs: u64,
    pub rsa_bits: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RevocationSection {
    pub cleanup_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokensSection {
    pub cache_ttl_secs: u64,
    pub cache_capacity: usize,
    pub clock_skew_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            issuer: "keel".into(),
            default_capability_lifetime_secs: 3600,
            max_delegation_depth: 3,
            capability_retention_secs: 3600,
            cleanup_interval_secs: 60,
            policy: Policy::restrictive(),
            audit: AuditSection::default(),
            keys: KeysSection::default(),
            revocation: RevocationSection::default(),
            tokens: TokensSection::default(),
        }
    }
}

impl Default for AuditSection {
    fn default() -> Self {
        let defaults = AuditConfig::default();
        Self {
            buffer_size: defaults.buffer_size,
            flush_interval_ms: millis(defaults.flush_interval),
            flush_timeout_ms: millis(defaults.flush_timeout),
            max_buffered: defaults.max_buffered,
            retained_events: defaults.retained_events,
            sinks: vec![SinkConfig::Tracing],
        }
    }
}

impl Default for KeysSection {
    fn default() -> Self {
        Self {
            rotation_interval_secs: 24 * 3600,
            rsa_bits: tokens::DEFAULT_RSA_BITS,
        }
    }
}

impl Default for RevocationSection {
    fn default() -> Self {
        Self {
            cleanup_interval_secs: 60,
        }
    }
}

impl Default for TokensSection {
    fn default() -> Self {
        let defaults = TokenConfig::default();
        Self {
            cache_ttl_secs: defaults.cache_ttl.as_secs(),
            cache_capacity: defaults.cache_capacity,
            clock_skew_secs: defaults.clock_skew.as_secs(),
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::parse(&content)
    }

    /// Load `path` if it exists, otherwise use the built-in defaults.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Parse and validate configuration from a TOML string.
    pub fn parse(toml: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.issuer.trim().is_empty() {
            return Err(ConfigError::Invalid("issuer must not be empty".into()));
        }
        if self.keys.rsa_bits < MIN_RSA_BITS {
            return Err(ConfigError::Invalid(format!(
                "keys.rsa_bits must be at least {MIN_RSA_BITS}, got {}",
                self.keys.rsa_bits
            )));
        }

        let positive = [
            ("default_capability_lifetime_secs", self.default_capability_lifetime_secs),
            ("cleanup_interval_secs", self.cleanup_interval_secs),
            ("audit.flush_interval_ms", self.audit.flush_interval_ms),
            ("audit.flush_timeout_ms", self.audit.flush_timeout_ms),
            ("keys.rotation_interval_secs", self.keys.rotation_interval_secs),
            ("revocation.cleanup_interval_secs", self.revocation.cleanup_interval_secs),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Invalid(format!("{name} must be greater than zero")));
        }
        if self.audit.buffer_size == 0 || self.audit.max_buffered < self.audit.buffer_size {
            return Err(ConfigError::Invalid(
                "audit.buffer_size must be non-zero and no larger than audit.max_buffered".into(),
            ));
        }

        self.policy.validate()?;
        Ok(())
    }

    pub fn audit_config(&self) -> AuditConfig {
        AuditConfig {
            buffer_size: self.audit.buffer_size,
            flush_interval: Duration::from_millis(self.audit.flush_interval_ms),
            flush_timeout: Duration::from_millis(self.audit.flush_timeout_ms),
            max_buffered: self.audit.max_buffered,
            retained_events: self.audit.retained_events,
        }
    }

    pub fn token_config(&self) -> TokenConfig {
        TokenConfig {
            issuer: self.issuer.clone(),
            default_lifetime: self.default_capability_lifetime(),
            max_delegation_depth: self.max_delegation_depth,
            cache_ttl: Duration::from_secs(self.tokens.cache_ttl_secs),
            cache_capacity: self.tokens.cache_capacity,
            clock_skew: Duration::from_secs(self.tokens.clock_skew_secs),
        }
    }

    pub fn default_capability_lifetime(&self) -> Duration {
        Duration::from_secs(self.default_capability_lifetime_secs)
    }

    pub fn capability_retention(&self) -> Duration {
        Duration::from_secs(self.capability_retention_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn key_rotation_interval(&self) -> Duration {
        Duration::from_secs(self.keys.rotation_interval_secs)
    }

    pub fn revocation_cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.revocation.cleanup_interval_secs)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error(transparent)]
    Policy(#[from] policy::Error),
}
