//! Error types for quill-vault.

use std::path::{Path, PathBuf};

use quill_core::BlockId;

/// Vault error type.
#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    /// IO error.
    #[error("IO error at {path}: {message}")]
    Io { path: PathBuf, message: String },

    /// Path is not a notebook directory.
    #[error("not a notebook: {0}")]
    NotANotebook(PathBuf),

    /// Refusing to overwrite an existing path.
    #[error("path already exists: {0}")]
    AlreadyExists(PathBuf),

    /// Block is missing from the notebook index.
    #[error("block not found: {0}")]
    BlockNotFound(BlockId),

    /// `.index.json` could not be parsed or written.
    #[error("invalid index {path}: {message}")]
    InvalidIndex { path: PathBuf, message: String },

    /// Vault configuration could not be parsed or written.
    #[error("config error: {0}")]
    Config(String),

    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("invalid password")]
    InvalidPassword,

    #[error("no matching key found")]
    NoMatchingKey,

    #[error("identity file not found: {0}")]
    IdentityFileNotFound(PathBuf),

    #[error("invalid identity file: {0}")]
    InvalidIdentityFile(String),

    /// No credential is loaded.
    #[error("encryption session is locked")]
    SessionLocked,

    /// Watch error.
    #[error("file watch error: {0}")]
    Watch(String),

    /// Markdown conversion failed.
    #[error("sync error: {0}")]
    Sync(#[from] quill_sync::SyncError),
}

impl VaultError {
    pub(crate) fn io(path: &Path, e: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            message: e.to_string(),
        }
    }
}

impl From<std::io::Error> for VaultError {
    fn from(e: std::io::Error) -> Self {
        Self::Io {
            path: PathBuf::new(),
            message: e.to_string(),
        }
    }
}

impl From<VaultError> for quill_core::Error {
    fn from(e: VaultError) -> Self {
        match e {
            VaultError::BlockNotFound(id) => quill_core::Error::BlockNotFound(id),
            VaultError::SessionLocked | VaultError::InvalidPassword => {
                quill_core::Error::EncryptionLocked {
                    needs_password: true,
                    message: e.to_string(),
                }
            }
            VaultError::EncryptionFailed(_)
            | VaultError::DecryptionFailed(_)
            | VaultError::NoMatchingKey
            | VaultError::IdentityFileNotFound(_)
            | VaultError::InvalidIdentityFile(_) => quill_core::Error::Encryption(e.to_string()),
            _ => quill_core::Error::Store(e.to_string()),
        }
    }
}

/// Result type for vault operations.
pub type VaultResult<T> = Result<T, VaultError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_error_mapping() {
        let err: quill_core::Error = VaultError::InvalidPassword.into();
        assert!(err.needs_password());

        let err: quill_core::Error = VaultError::BlockNotFound(BlockId::new("b1")).into();
        assert!(matches!(err, quill_core::Error::BlockNotFound(_)));

        let err: quill_core::Error = VaultError::NotANotebook(PathBuf::from("/x")).into();
        assert!(matches!(err, quill_core::Error::Store(_)));

        let err: quill_core::Error = VaultError::NoMatchingKey.into();
        assert!(matches!(err, quill_core::Error::Encryption(_)));
    }
}
