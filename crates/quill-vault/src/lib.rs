//! On-disk collaborators for the Quill notebook engine.
//!
//! - [`DiskFileStore`]: notebooks as `Name.md/` directories with a
//!   `.index.json` and one file per block
//! - [`VaultConfig`]: per-vault settings in `.quill/config.yaml`
//! - [`AgeEncryptionService`]: age encryption with password or identity-file
//!   sessions and pluggable [`CredentialSource`]s for auto-unlock
//! - [`FileWatcher`]: debounced notifications for external edits

mod config;
mod credentials;
mod crypto;
mod disk;
mod error;
mod index;
mod watcher;

pub use config::{
    CONFIG_DIR, CONFIG_FILE, EncryptionConfig, EncryptionMethod, VaultConfig, VaultInfo,
    find_vault_root, init_vault,
};
pub use credentials::{
    Credential, CredentialSource, CredentialsFile, EnvCredentials, IDENTITY_ENV, PASSPHRASE_ENV,
    VaultIdentity, default_sources,
};
pub use crypto::{
    ARMOR_BEGIN, ARMOR_END, AgeEncryptionService, armor, dearmor, generate_identity, is_armored,
    public_key,
};
pub use disk::{DiskFileStore, is_notebook};
pub use error::{VaultError, VaultResult};
pub use index::{INDEX_FILE, IndexEntry, NotebookIndex};
pub use watcher::{FileEvent, FileWatcher};
