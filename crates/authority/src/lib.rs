//! Capability authority for the keel kernel.
//!
//! Principals receive signed capability records scoped by a [`Policy`].
//! Records can be delegated with narrower constraints, and revoking one
//! revokes everything delegated from it.
//!
//! # Overview
//!
//! - [`CapabilityAuthority`] issues, validates, delegates and revokes records.
//!   Mutations are serialised through a single coordinator task.
//! - [`Kernel`] assembles the authority with the token service, key ring,
//!   revocation cache and audit log, and runs their background tasks.
//! - [`Config`] is loaded from `keel.toml`.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use authority::{Config, Kernel};
//! use policy::{ConstraintSet, Operation, ResourceType};
//! use revocation::LocalCluster;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let kernel = Kernel::start(Config::load_or_default("keel.toml")?, Arc::new(LocalCluster::new())).await?;
//!
//! let constraints = ConstraintSet::new()
//!     .with_paths(["./src/**"])
//!     .with_operations(["read"]);
//! let cap = kernel
//!     .authority()
//!     .request_capability(ResourceType::Filesystem, constraints, "agent-1")
//!     .await?;
//! kernel.authority().validate_capability(&cap, &Operation::read(), "./src/main.rs")?;
//!
//! kernel.shutdown().await?;
//! # Ok(())
//! # }
//! ```
//!
//! [`Policy`]: policy::Policy

mod authority;
mod capability;
mod config;
mod error;
mod event;
mod kernel;
mod signer;
mod state;

pub use authority::{AuthorityBuilder, AuthoritySettings, CapabilityAuthority, SecurityStats};
pub use capability::{Capability, CapabilityId, PrincipalId};
pub use config::{
    AuditSection, Config, ConfigError, KeysSection, MIN_RSA_BITS, RevocationSection, TokensSection,
};
pub use error::{AuthorityError, Error, Result};
pub use event::CapabilityEvent;
pub use kernel::Kernel;
