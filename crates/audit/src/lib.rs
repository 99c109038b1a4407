//! Tamper-evident audit logging for the keel capability kernel.
//!
//! Every security-relevant decision the kernel makes (capability issued,
//! delegated, revoked, a validation denied, a key rotated) is recorded as an
//! [`AuditEvent`]. Events are buffered in memory so recording never stalls a
//! validation, then flushed in batches to one or more [`AuditSink`]s.
//!
//! # Checksum chain
//!
//! At flush time each event receives a sequence number and a SHA-256 checksum
//! that covers its fields and the checksum of the event before it. Altering,
//! removing or reordering any stored event breaks the chain, which
//! [`verify_chain`] detects.
//!
//! # Sinks
//!
//! - [`MemorySink`]: in-process, for tests and embedding
//! - [`FileSink`]: JSON lines, one event per line
//! - [`SqliteSink`]: queryable, verifiable offline
//! - [`TracingSink`]: forwards to the `tracing` subscriber
//!
//! A sink that fails or times out keeps its events queued and receives them
//! again on the next flush. Persistent sinks report their last stored event,
//! and a new logger continues the chain from the highest one.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use audit::{AuditConfig, AuditEventType, AuditLogger, AuditSink, SqliteSink};
//!
//! # async fn example() -> audit::Result<()> {
//! let sink = Arc::new(SqliteSink::open("audit.db")?);
//! let logger = Arc::new(AuditLogger::new(AuditConfig::default(), vec![sink as Arc<dyn AuditSink>]));
//! let _flusher = logger.spawn_flusher();
//!
//! logger.log_event(
//!     AuditEventType::CapabilityCreated,
//!     serde_json::json!({ "capability_id": "cap_123" }),
//!     Some("session-42"),
//! );
//! logger.flush().await?;
//! logger.verify_integrity()?;
//! # Ok(())
//! # }
//! ```

mod chain;
mod error;
mod event;
mod logger;
mod search;
mod sink;
mod store;

pub use chain::{ChainHead, GENESIS_CHECKSUM, IntegrityError, verify_chain};
pub use error::{Error, Result};
pub use event::{AuditEvent, AuditEventType};
pub use logger::{AuditConfig, AuditLogger, AuditStats};
pub use search::{DEFAULT_SEARCH_LIMIT, SearchCriteria, SearchOptions};
pub use sink::{AuditSink, FileSink, MemorySink, SinkConfig, TracingSink};
pub use store::SqliteSink;
