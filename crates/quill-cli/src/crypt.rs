//! Encryption commands: encrypt, decrypt, hide, unencrypt, keygen.

use quill_core::EncryptionState;
use quill_vault::{EncryptionMethod, VaultConfig, find_vault_root, generate_identity, init_vault};

use crate::colors;
use crate::session::{GlobalOpts, Session, with_password};

/// Which encryption operation to apply to a block.
#[derive(Debug, Clone, Copy)]
pub enum Action {
    Encrypt,
    /// Print the plaintext without changing the stored block.
    Decrypt,
    /// Re-encrypt with the current credential.
    Hide,
    /// Store the plaintext permanently.
    Unencrypt,
}

pub async fn execute(
    opts: &GlobalOpts,
    notebook: &str,
    block: &str,
    action: Action,
) -> anyhow::Result<()> {
    let session = Session::open(opts, notebook).await?;
    let id = session.block(block)?;
    let engine = &session.engine;

    match action {
        Action::Encrypt => {
            with_password(engine, || engine.encrypt_block(&id)).await?;
            println!("Encrypted block {}", id.short());
        }
        Action::Decrypt => {
            with_password(engine, || engine.decrypt_block(&id)).await?;
            if let Some(plaintext) = engine.display_content(&id) {
                print!("{}", plaintext);
                if !plaintext.ends_with('\n') {
                    println!();
                }
            }
        }
        Action::Hide => {
            if engine.encryption_state(&id) != Some(EncryptionState::Hidden) {
                anyhow::bail!("Block {} is not encrypted", id.short());
            }
            with_password(engine, || engine.decrypt_block(&id)).await?;
            with_password(engine, || engine.hide_block(&id)).await?;
            println!("Re-encrypted block {}", id.short());
        }
        Action::Unencrypt => {
            with_password(engine, || engine.remove_block_encryption(&id)).await?;
            println!("Removed encryption from block {}", id.short());
        }
    }
    session.finish().await
}

/// Generate an age identity. With `use_for_vault`, make it the vault's
/// encryption credential.
pub fn keygen(opts: &GlobalOpts, path: &str, use_for_vault: bool) -> anyhow::Result<()> {
    let path = std::path::absolute(path)?;
    let public = generate_identity(&path)?;
    println!("{}Public key:{} {}", colors::BOLD, colors::RESET, public);

    if use_for_vault {
        let root = match &opts.vault {
            Some(vault) => std::path::absolute(vault)?,
            None => match path.parent().and_then(find_vault_root) {
                Some(root) => root,
                None => std::env::current_dir()?,
            },
        };
        let mut config = init_vault(&root, None)?;
        config.encryption.enabled = true;
        config.encryption.method = EncryptionMethod::IdentityFile;
        config.encryption.identity_file = Some(path.clone());
        config.save(&root)?;
        println!(
            "Vault {} now encrypts with {}",
            root.display(),
            path.display()
        );
        tracing::debug!("Wrote {}", VaultConfig::path(&root).display());
    }
    Ok(())
}
