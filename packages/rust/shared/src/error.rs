//! Error types for chatlake.
//!
//! Library crates use [`ChatlakeError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.
//!
//! Record-level problems ([`ChatlakeError::RecordMalformed`]) are normally
//! absorbed into a run summary; every other variant aborts the current run.

use std::path::PathBuf;

/// Top-level error type for all chatlake operations.
#[derive(Debug, thiserror::Error)]
pub enum ChatlakeError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// The key-value source could not be read. Fatal for the run.
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),

    /// A single source item failed shape validation.
    #[error("malformed record {key}: {reason}")]
    RecordMalformed { key: String, reason: String },

    /// The destination object could not be written. Fatal for the run.
    #[error("export write failed for {key}: {message}")]
    ExportWrite { key: String, message: String },

    /// The external columnar transform job reported failure.
    #[error("transform job {job_id} failed with state {state}")]
    TransformFailed { job_id: String, state: String },

    /// An external job or catalog refresh could not be started.
    #[error("trigger error: {0}")]
    Trigger(String),

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (bad event payload, invalid date, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },

    /// JSON/CSV encoding or decoding error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, ChatlakeError>;

impl ChatlakeError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create a malformed-record error for the item identified by `key`.
    pub fn malformed(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::RecordMalformed {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Create an export-write error for the object `key`.
    pub fn export_write(key: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::ExportWrite {
            key: key.into(),
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

impl From<serde_json::Error> for ChatlakeError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
