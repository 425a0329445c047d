//! Error taxonomy for the scan engine and quarantine pipeline.
//!
//! Configuration and signature-load errors abort a command before any file
//! is read. Acquisition errors abort after cleaning up partial staging.
//! Everything else is recovered locally (warn + skip) and never surfaces
//! through this type.

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SigilError>;

#[derive(Debug, Error)]
pub enum SigilError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("signature '{id}': invalid pattern: {reason}")]
    InvalidPattern { id: String, reason: String },

    #[error("signature '{id}': unknown phase '{value}'")]
    UnknownPhase { id: String, value: String },

    #[error("signature '{id}': unknown severity '{value}'")]
    UnknownSeverity { id: String, value: String },

    #[error("signature '{id}': weight {value} is outside 0..=20")]
    OutOfRangeWeight { id: String, value: f64 },

    #[error("duplicate signature id '{0}' in one source")]
    DuplicateSignature(String),

    #[error("acquisition failed: {0}")]
    AcquisitionFailed(String),

    #[error("invalid quarantine id '{0}'")]
    InvalidQuarantineId(String),

    #[error("quarantine item '{0}' not found")]
    ItemNotFound(String),

    #[error("quarantine item '{id}' is already {state} (terminal)")]
    AlreadyTerminal { id: String, state: String },

    #[error("quarantine item '{0}' is locked by another invocation")]
    Locked(String),

    #[error("scan interrupted by operator")]
    Interrupted,

    #[error("{}: {source}", path.display())]
    PathIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("malformed JSON in {}: {reason}", path.display())]
    Json { path: PathBuf, reason: String },
}

impl SigilError {
    /// Attach a path to a bare I/O error.
    pub fn io_at(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SigilError::PathIo {
            path: path.into(),
            source,
        }
    }
}
