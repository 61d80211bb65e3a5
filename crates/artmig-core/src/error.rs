//! Error types for the migration engine.
//!
//! The taxonomy follows the run model: configuration problems abort the
//! whole run, per-item problems (a missing file, a bad fetch) degrade a
//! single article/tag/image to "skipped", and a duplicate mapping insert
//! is an invariant violation that must surface, never be swallowed.

use std::path::PathBuf;
use thiserror::Error;

use crate::mapping::EntityKind;

/// Main error type for migration operations.
#[derive(Debug, Error)]
pub enum MigrateError {
    // Fatal configuration errors. These abort the run before it starts.
    #[error("Configuration error: {message}")]
    Config { message: String },

    // Per-item recoverable errors. The enclosing item is skipped and the
    // batch continues.
    #[error("Fetch failed for {locator}: {message}")]
    FetchFailed { locator: String, message: String },

    #[error("File not found: {0}")]
    FileNotFound(PathBuf),

    // Invariant violation: a second insert for the same (kind, source_id).
    #[error("Duplicate mapping for {kind} {source_id}")]
    MappingConflict { kind: EntityKind, source_id: String },

    // Infrastructure errors
    #[error("Database error: {message}")]
    Database {
        message: String,
        #[source]
        source: Option<rusqlite::Error>,
    },

    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Network error: {message}")]
    Network {
        message: String,
        #[source]
        source: Option<reqwest::Error>,
    },

    #[error("Entity not found: {kind} {id}")]
    EntityNotFound { kind: String, id: i64 },

    #[error("{0}")]
    Other(String),
}

/// Result type alias for migration operations.
pub type Result<T> = std::result::Result<T, MigrateError>;

impl From<std::io::Error> for MigrateError {
    fn from(err: std::io::Error) -> Self {
        MigrateError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<rusqlite::Error> for MigrateError {
    fn from(err: rusqlite::Error) -> Self {
        MigrateError::Database {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<reqwest::Error> for MigrateError {
    fn from(err: reqwest::Error) -> Self {
        MigrateError::Network {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl MigrateError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        MigrateError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// Whether this error degrades a single item rather than the run.
    ///
    /// The migrator logs recoverable errors at warning level and moves on
    /// to the next tag/image/article; everything else propagates.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            MigrateError::FetchFailed { .. } | MigrateError::FileNotFound(_)
        )
    }
}
