//! Error types for quill-core.

use thiserror::Error;

use crate::block::BlockId;

/// Result type for quill-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in quill-core.
///
/// Structural errors (`BlockNotFound`, `LastBlock`) are raised before any
/// state is touched. Storage and crypto errors are raised after the external
/// call failed, again without mutating the open notebook.
#[derive(Debug, Error)]
pub enum Error {
    /// An operation needs an open notebook but none is open.
    #[error("no notebook is open")]
    NoNotebook,

    /// Block not found in the open notebook.
    #[error("block not found: {0}")]
    BlockNotFound(BlockId),

    /// Attempted to delete the only block of a notebook.
    #[error("cannot delete the last remaining block")]
    LastBlock,

    /// Writing a block to the file store failed. The block stays dirty.
    #[error("failed to save block {block}: {message}")]
    Persist { block: BlockId, message: String },

    /// The encryption session is locked and could not be unlocked.
    #[error("encryption is locked: {message}")]
    EncryptionLocked {
        /// True when supplying a password would resolve the error.
        needs_password: bool,
        message: String,
    },

    /// Encrypting or decrypting content failed.
    #[error("encryption error: {0}")]
    Encryption(String),

    /// The block already has a process in flight.
    #[error("block {0} is already running")]
    AlreadyRunning(BlockId),

    /// The block cannot be run (markdown, unsupported language, hidden ciphertext).
    #[error("block {block} cannot be executed: {reason}")]
    NotExecutable { block: BlockId, reason: String },

    /// Spawning or waiting on an external process failed.
    #[error("execution error: {0}")]
    Execution(String),

    /// The file store rejected an operation.
    #[error("store error: {0}")]
    Store(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid operation (e.g., hiding a block that is not decrypted).
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
}

impl Error {
    /// Whether the caller should prompt for a password and retry.
    pub fn needs_password(&self) -> bool {
        matches!(
            self,
            Error::EncryptionLocked {
                needs_password: true,
                ..
            }
        )
    }

    /// Render the error together with a short recovery hint for end users.
    pub fn with_hint(&self) -> String {
        let hint = match self {
            Error::NoNotebook => Some("open or create a notebook first"),
            Error::LastBlock => Some("a notebook always keeps at least one block"),
            Error::Persist { .. } => Some("the block is still dirty; edit it again or save explicitly to retry"),
            Error::EncryptionLocked {
                needs_password: true,
                ..
            } => Some("supply the vault password to continue"),
            Error::AlreadyRunning(_) => Some("terminate the running block before starting it again"),
            Error::NotExecutable { .. } => Some("only code blocks in shell, python, ruby or javascript can run"),
            _ => None,
        };

        match hint {
            Some(hint) => format!("{} (hint: {})", self, hint),
            None => self.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_needs_password() {
        let locked = Error::EncryptionLocked {
            needs_password: true,
            message: "no stored credentials".to_string(),
        };
        assert!(locked.needs_password());

        let failed = Error::EncryptionLocked {
            needs_password: false,
            message: "identity file missing".to_string(),
        };
        assert!(!failed.needs_password());
        assert!(!Error::LastBlock.needs_password());
    }

    #[test]
    fn test_with_hint() {
        let msg = Error::LastBlock.with_hint();
        assert!(msg.starts_with("cannot delete the last remaining block"));
        assert!(msg.contains("hint:"));

        let msg = Error::Store("disk full".to_string()).with_hint();
        assert_eq!(msg, "store error: disk full");
    }
}
