//! Archive error types
//!
//! Defines the errors that abort an archive operation. Per-file problems
//! found while scanning are not errors: they are collected into the
//! `ScanReport`. Per-interval problems found while fetching become gaps.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur in the archive index
#[derive(Error, Debug)]
pub enum ArchiveError {
    /// I/O operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// SQLite operation failed
    #[error("Database error: {0}")]
    Database(String),

    /// The persistent index is inconsistent and must be rebuilt
    #[error("Index corruption: {0}")]
    IndexCorruption(String),

    /// Serialization/deserialization failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error (malformed source root, bad filter, ...)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Requested source is not registered
    #[error("Source not found: {0:?}")]
    SourceNotFound(PathBuf),

    /// Channel pattern could not be parsed
    #[error("Invalid channel pattern: {0}")]
    InvalidPattern(String),

    /// Invalid time span (start >= end)
    #[error("Invalid time span: start must be less than end")]
    InvalidTimeSpan,

    /// The caller cancelled the operation
    #[error("Operation cancelled")]
    Cancelled,

    /// Lock acquisition failed
    #[error("Lock error: {0}")]
    Lock(String),

    /// A background task panicked or was aborted
    #[error("Task error: {0}")]
    Task(String),
}

impl From<rusqlite::Error> for ArchiveError {
    fn from(err: rusqlite::Error) -> Self {
        match err.sqlite_error_code() {
            Some(rusqlite::ErrorCode::DatabaseCorrupt) | Some(rusqlite::ErrorCode::NotADatabase) => {
                ArchiveError::IndexCorruption(err.to_string())
            }
            _ => ArchiveError::Database(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for ArchiveError {
    fn from(err: serde_json::Error) -> Self {
        ArchiveError::Serialization(err.to_string())
    }
}

impl From<walkdir::Error> for ArchiveError {
    fn from(err: walkdir::Error) -> Self {
        ArchiveError::Io(err.into())
    }
}

impl From<tokio::task::JoinError> for ArchiveError {
    fn from(err: tokio::task::JoinError) -> Self {
        ArchiveError::Task(err.to_string())
    }
}

/// Result type alias for archive operations
pub type ArchiveResult<T> = Result<T, ArchiveError>;
