//! Error types for notebook conversion.

use std::path::PathBuf;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur while importing or exporting notebooks.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Failed to read source file.
    #[error("Failed to read file {path}: {message}")]
    ReadError { path: PathBuf, message: String },

    /// Failed to write output file.
    #[error("Failed to write file {path}: {message}")]
    WriteError { path: PathBuf, message: String },

    /// Invalid notebook structure.
    #[error("Invalid notebook: {0}")]
    InvalidNotebook(String),
}
