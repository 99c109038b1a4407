//! CLI error types.

use std::path::PathBuf;
use thiserror::Error;

/// CLI errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The audit database file does not exist.
    ///
    /// Point `--db` at the path of a configured `sqlite` sink.
    #[error("audit database not found at {path}")]
    DatabaseNotFound { path: PathBuf },

    /// The configuration file is missing or invalid.
    #[error(transparent)]
    Config(#[from] authority::ConfigError),

    /// An error occurred reading or verifying the audit log.
    #[error(transparent)]
    Audit(#[from] audit::Error),

    /// The token could not be decoded.
    #[error(transparent)]
    Token(#[from] tokens::TokenError),

    #[error(transparent)]
    Key(#[from] tokens::KeyError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, Error>;
