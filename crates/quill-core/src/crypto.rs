//! Encryption state mediation.
//!
//! Encrypted blocks store armored ciphertext. A user can ask to see the
//! plaintext, which is held in a transient overlay that is never persisted.
//! Edits made while the overlay is visible go to the overlay; only `hide`
//! (re-encrypt) or `remove_encryption` (keep as plaintext) commit them.

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::block::{Block, BlockId};
use crate::error::{Error, Result};

/// Why an unlock attempt did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UnlockError {
    /// No stored credentials; a password from the user would unlock.
    #[error("a password is required")]
    NeedsPassword,
    /// Credentials were found but unlocking failed.
    #[error("unlock failed: {0}")]
    Failed(String),
}

/// Cryptographic collaborator.
///
/// Implementations own the session (password or identity) and the ciphertext
/// format. `is_content_encrypted` is the sole authority on whether a block's
/// content is ciphertext.
#[async_trait]
pub trait EncryptionService: Send + Sync {
    /// Classify content by its format alone.
    fn is_content_encrypted(&self, content: &str) -> bool;

    fn is_unlocked(&self) -> bool;

    /// Unlock from stored credentials without user interaction.
    async fn try_auto_unlock(&self) -> std::result::Result<(), UnlockError>;

    async fn unlock_with_password(&self, password: &str) -> Result<()>;

    async fn lock(&self);

    async fn encrypt(&self, plaintext: &str) -> Result<String>;

    async fn decrypt(&self, ciphertext: &str) -> Result<String>;
}

/// Unlock the service if needed, trying stored credentials first.
pub async fn ensure_unlocked(service: &dyn EncryptionService) -> Result<()> {
    if service.is_unlocked() {
        return Ok(());
    }
    match service.try_auto_unlock().await {
        Ok(()) => {
            debug!("Encryption unlocked from stored credentials");
            Ok(())
        }
        Err(UnlockError::NeedsPassword) => Err(Error::EncryptionLocked {
            needs_password: true,
            message: "no stored credentials; a password is required".to_string(),
        }),
        Err(UnlockError::Failed(message)) => Err(Error::EncryptionLocked {
            needs_password: false,
            message,
        }),
    }
}

/// What the editor sees for a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncryptionState {
    /// Content is plaintext.
    Plain,
    /// Content is ciphertext and no plaintext is shown.
    Hidden,
    /// Content is ciphertext and a decrypted overlay is shown.
    Visible,
}

/// The operation waiting on a password.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PasswordIntent {
    Encrypt,
    Decrypt,
    Hide,
    RemoveEncryption,
}

impl std::fmt::Display for PasswordIntent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PasswordIntent::Encrypt => "encrypt",
            PasswordIntent::Decrypt => "decrypt",
            PasswordIntent::Hide => "hide",
            PasswordIntent::RemoveEncryption => "remove encryption",
        };
        f.write_str(s)
    }
}

/// An encryption operation suspended until the user supplies a password.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingPasswordRequest {
    pub block_id: BlockId,
    pub intent: PasswordIntent,
}

/// Per-notebook overlay and pending-request state.
#[derive(Debug, Default)]
pub struct EncryptionMediator {
    overlays: FxHashMap<BlockId, String>,
    pending: Option<PendingPasswordRequest>,
}

impl EncryptionMediator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current view state of a block.
    pub fn state(&self, block: &Block, service: &dyn EncryptionService) -> EncryptionState {
        if !service.is_content_encrypted(&block.content) {
            EncryptionState::Plain
        } else if self.overlays.contains_key(&block.id) {
            EncryptionState::Visible
        } else {
            EncryptionState::Hidden
        }
    }

    /// Content to show in the editor: the overlay when visible, else stored content.
    pub fn display_content<'a>(&'a self, block: &'a Block) -> &'a str {
        self.overlays
            .get(&block.id)
            .map(String::as_str)
            .unwrap_or(&block.content)
    }

    /// Plaintext to encrypt, after checking the block is plain and non-empty.
    pub fn encrypt_source(&self, block: &Block, service: &dyn EncryptionService) -> Result<String> {
        if service.is_content_encrypted(&block.content) {
            return Err(Error::InvalidOperation(format!(
                "block {} is already encrypted",
                block.id.short()
            )));
        }
        if block.content.trim().is_empty() {
            return Err(Error::InvalidOperation(
                "cannot encrypt an empty block".to_string(),
            ));
        }
        Ok(block.content.clone())
    }

    /// Ciphertext to decrypt, after checking the block is encrypted.
    pub fn decrypt_source(&self, block: &Block, service: &dyn EncryptionService) -> Result<String> {
        if !service.is_content_encrypted(&block.content) {
            return Err(Error::InvalidOperation(format!(
                "block {} is not encrypted",
                block.id.short()
            )));
        }
        Ok(block.content.clone())
    }

    /// Overlay plaintext to re-encrypt. Hiding requires a visible overlay.
    pub fn hide_source(&self, id: &BlockId) -> Result<String> {
        self.overlays.get(id).cloned().ok_or_else(|| {
            Error::InvalidOperation(format!("block {} is not decrypted", id.short()))
        })
    }

    pub fn overlay(&self, id: &BlockId) -> Option<&str> {
        self.overlays.get(id).map(String::as_str)
    }

    pub fn has_overlay(&self, id: &BlockId) -> bool {
        self.overlays.contains_key(id)
    }

    pub fn set_overlay(&mut self, id: &BlockId, plaintext: String) {
        self.overlays.insert(id.clone(), plaintext);
    }

    /// Route an edit into the overlay if one is visible.
    ///
    /// Returns `None` when the block has no overlay, otherwise whether the
    /// overlay text changed.
    pub fn edit_overlay(&mut self, id: &BlockId, text: &str) -> Option<bool> {
        let overlay = self.overlays.get_mut(id)?;
        if overlay == text {
            return Some(false);
        }
        *overlay = text.to_string();
        Some(true)
    }

    pub fn clear_overlay(&mut self, id: &BlockId) -> Option<String> {
        self.overlays.remove(id)
    }

    pub fn pending(&self) -> Option<&PendingPasswordRequest> {
        self.pending.as_ref()
    }

    /// Record the operation to resume once a password arrives, replacing any earlier one.
    pub fn set_pending(&mut self, block_id: &BlockId, intent: PasswordIntent) {
        self.pending = Some(PendingPasswordRequest {
            block_id: block_id.clone(),
            intent,
        });
    }

    pub fn take_pending(&mut self) -> Option<PendingPasswordRequest> {
        self.pending.take()
    }

    /// Forget the pending request if it targets `id`.
    pub fn drop_pending_for(&mut self, id: &BlockId) -> bool {
        if self.pending.as_ref().is_some_and(|p| &p.block_id == id) {
            self.pending = None;
            return true;
        }
        false
    }

    /// Drop all overlays and any pending request.
    pub fn clear(&mut self) {
        self.overlays.clear();
        self.pending = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockType;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Reverses text behind an `ENC:` prefix.
    struct Reverse {
        unlocked: AtomicBool,
        auto: std::result::Result<(), UnlockError>,
    }

    #[async_trait]
    impl EncryptionService for Reverse {
        fn is_content_encrypted(&self, content: &str) -> bool {
            content.starts_with("ENC:")
        }

        fn is_unlocked(&self) -> bool {
            self.unlocked.load(Ordering::SeqCst)
        }

        async fn try_auto_unlock(&self) -> std::result::Result<(), UnlockError> {
            if self.auto.is_ok() {
                self.unlocked.store(true, Ordering::SeqCst);
            }
            self.auto.clone()
        }

        async fn unlock_with_password(&self, _password: &str) -> Result<()> {
            self.unlocked.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn lock(&self) {
            self.unlocked.store(false, Ordering::SeqCst);
        }

        async fn encrypt(&self, plaintext: &str) -> Result<String> {
            Ok(format!("ENC:{}", plaintext.chars().rev().collect::<String>()))
        }

        async fn decrypt(&self, ciphertext: &str) -> Result<String> {
            Ok(ciphertext.trim_start_matches("ENC:").chars().rev().collect())
        }
    }

    fn service(auto: std::result::Result<(), UnlockError>) -> Reverse {
        Reverse {
            unlocked: AtomicBool::new(false),
            auto,
        }
    }

    fn block(content: &str) -> Block {
        let mut block = Block::new(BlockType::Markdown, None);
        block.content = content.to_string();
        block
    }

    #[test]
    fn test_state_follows_content_not_flag() {
        let svc = service(Ok(()));
        let mut mediator = EncryptionMediator::new();

        let mut b = block("ENC:olleh");
        assert_eq!(mediator.state(&b, &svc), EncryptionState::Hidden);

        b.encrypted = false;
        assert_eq!(mediator.state(&b, &svc), EncryptionState::Hidden);

        mediator.set_overlay(&b.id, "hello".to_string());
        assert_eq!(mediator.state(&b, &svc), EncryptionState::Visible);
        assert_eq!(mediator.display_content(&b), "hello");

        let mut plain = block("hello");
        plain.encrypted = true;
        assert_eq!(mediator.state(&plain, &svc), EncryptionState::Plain);
    }

    #[test]
    fn test_encrypt_preconditions() {
        let svc = service(Ok(()));
        let mediator = EncryptionMediator::new();

        assert!(mediator.encrypt_source(&block("   "), &svc).is_err());
        assert!(mediator.encrypt_source(&block("ENC:x"), &svc).is_err());
        assert_eq!(mediator.encrypt_source(&block("hi"), &svc).unwrap(), "hi");

        assert!(mediator.decrypt_source(&block("hi"), &svc).is_err());
        assert!(mediator.hide_source(&BlockId::new("x")).is_err());
    }

    #[test]
    fn test_overlay_edits() {
        let mut mediator = EncryptionMediator::new();
        let id = BlockId::new("a");

        assert_eq!(mediator.edit_overlay(&id, "x"), None);
        mediator.set_overlay(&id, "secret".to_string());
        assert_eq!(mediator.edit_overlay(&id, "secret"), Some(false));
        assert_eq!(mediator.edit_overlay(&id, "secret 2"), Some(true));
        assert_eq!(mediator.hide_source(&id).unwrap(), "secret 2");
        assert_eq!(mediator.clear_overlay(&id).as_deref(), Some("secret 2"));
        assert!(!mediator.has_overlay(&id));
    }

    #[test]
    fn test_pending_request_lifecycle() {
        let mut mediator = EncryptionMediator::new();
        let a = BlockId::new("a");
        let b = BlockId::new("b");

        mediator.set_pending(&a, PasswordIntent::Encrypt);
        assert!(!mediator.drop_pending_for(&b));
        assert_eq!(mediator.pending().map(|p| p.intent), Some(PasswordIntent::Encrypt));
        assert!(mediator.drop_pending_for(&a));
        assert!(mediator.pending().is_none());

        mediator.set_pending(&b, PasswordIntent::Hide);
        mediator.set_overlay(&b, "x".to_string());
        mediator.clear();
        assert!(mediator.pending().is_none());
        assert!(!mediator.has_overlay(&b));
    }

    #[tokio::test]
    async fn test_ensure_unlocked_variants() {
        let svc = service(Ok(()));
        ensure_unlocked(&svc).await.unwrap();
        assert!(svc.is_unlocked());

        let svc = service(Err(UnlockError::NeedsPassword));
        let err = ensure_unlocked(&svc).await.unwrap_err();
        assert!(err.needs_password());

        let svc = service(Err(UnlockError::Failed("bad identity".to_string())));
        let err = ensure_unlocked(&svc).await.unwrap_err();
        assert!(!err.needs_password());
        assert!(err.to_string().contains("bad identity"));
    }

    #[tokio::test]
    async fn test_round_trip_through_service() {
        let svc = service(Ok(()));
        let cipher = svc.encrypt("line one\nline two").await.unwrap();
        assert!(svc.is_content_encrypted(&cipher));
        assert_eq!(svc.decrypt(&cipher).await.unwrap(), "line one\nline two");
    }
}
