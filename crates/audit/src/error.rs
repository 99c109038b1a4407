use thiserror::Error;

use crate::IntegrityError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("sink '{sink}' failed: {reason}")]
    Sink { sink: String, reason: String },

    #[error("sink '{sink}' timed out")]
    Timeout { sink: String },

    #[error(transparent)]
    Integrity(#[from] IntegrityError),

    #[error("audit sequence {sequence} is already stored with a different checksum")]
    SequenceConflict { sequence: u64 },

    #[error("invalid audit record: {0}")]
    InvalidRecord(String),
}

pub type Result<T> = std::result::Result<T, Error>;
