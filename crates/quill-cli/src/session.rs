//! Engine setup shared by the commands.

use std::future::Future;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use quill_core::{Block, BlockId, CommandRunner, EngineConfig, NotebookEngine};
use quill_vault::{AgeEncryptionService, DiskFileStore, find_vault_root};
use tokio::io::AsyncReadExt;

use crate::colors;

const PASSWORD_ATTEMPTS: usize = 3;

/// Options shared by every command.
#[derive(Debug, Clone)]
pub struct GlobalOpts {
    pub vault: Option<PathBuf>,
    pub save_delay: Duration,
}

/// An engine wired to the on-disk vault that contains a notebook.
pub struct Session {
    pub engine: NotebookEngine,
    pub vault_root: PathBuf,
}

impl Session {
    /// Set up an engine for `notebook` without opening it.
    pub fn new(opts: &GlobalOpts, notebook: &Path) -> anyhow::Result<Self> {
        let vault_root = match &opts.vault {
            Some(vault) => std::path::absolute(vault)?,
            None => {
                let parent = notebook.parent().unwrap_or(Path::new("."));
                find_vault_root(parent).unwrap_or_else(|| parent.to_path_buf())
            }
        };

        let crypto = AgeEncryptionService::for_vault(&vault_root)
            .with_context(|| format!("Failed to load vault config in {}", vault_root.display()))?;
        let engine = NotebookEngine::new(
            Arc::new(DiskFileStore::new()),
            Arc::new(crypto),
            Arc::new(CommandRunner::new()),
            EngineConfig {
                save_delay: opts.save_delay,
                vault_root: Some(vault_root.clone()),
                ..Default::default()
            },
        );
        tracing::debug!("Using vault {}", vault_root.display());

        Ok(Self { engine, vault_root })
    }

    /// Set up an engine and open an existing notebook.
    pub async fn open(opts: &GlobalOpts, notebook: &str) -> anyhow::Result<Self> {
        let path = notebook_path(notebook)?;
        let session = Self::new(opts, &path)?;
        session.engine.open(&path).await?;
        Ok(session)
    }

    /// Resolve a block by full id or unique id prefix.
    pub fn block(&self, reference: &str) -> anyhow::Result<BlockId> {
        resolve_block(&self.engine.blocks(), reference)
    }

    /// Flush every dirty block and close the notebook.
    pub async fn finish(self) -> anyhow::Result<()> {
        let saved = self.engine.save_all().await;
        self.engine.close().await;
        saved?;
        Ok(())
    }
}

/// Absolute path for a notebook argument.
pub fn notebook_path(notebook: &str) -> anyhow::Result<PathBuf> {
    Ok(std::path::absolute(notebook)?)
}

pub fn resolve_block(blocks: &[Block], reference: &str) -> anyhow::Result<BlockId> {
    if let Some(block) = blocks.iter().find(|b| b.id.as_str() == reference) {
        return Ok(block.id.clone());
    }
    let matches: Vec<&Block> = blocks
        .iter()
        .filter(|b| b.id.as_str().starts_with(reference))
        .collect();
    match matches.as_slice() {
        [block] if !reference.is_empty() => Ok(block.id.clone()),
        [] | [_] => anyhow::bail!("No block matches '{}'", reference),
        _ => anyhow::bail!(
            "'{}' matches {} blocks; use a longer prefix",
            reference,
            matches.len()
        ),
    }
}

/// Run an encryption operation, prompting for the vault password when needed.
pub async fn with_password<T, F, Fut>(engine: &NotebookEngine, mut op: F) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = quill_core::Result<T>>,
{
    let mut attempts = 0;
    loop {
        match op().await {
            Err(e) if e.needs_password() && attempts < PASSWORD_ATTEMPTS => {
                attempts += 1;
                engine.cancel_password_request();
                let password = prompt_password().await?;
                if let Err(e) = engine.supply_password(&password).await {
                    eprintln!("{}Error:{} {}", colors::RED, colors::RESET, e);
                }
            }
            other => return Ok(other?),
        }
    }
}

/// Ask for the vault password.
///
/// A terminal gets a prompt without echo. Piped stdin is read one line at a
/// time, byte by byte, so later prompts still see the remaining lines.
async fn prompt_password() -> anyhow::Result<String> {
    let prompt = format!("{}Password:{} ", colors::BOLD, colors::RESET);
    if std::io::stdin().is_terminal() {
        let password = tokio::task::spawn_blocking(move || rpassword::prompt_password(prompt))
            .await?
            .context("Failed to read password")?;
        return Ok(password);
    }

    eprint!("{}", prompt);
    let mut stdin = tokio::io::stdin();
    let mut bytes = Vec::new();
    loop {
        let mut byte = [0u8; 1];
        let read = stdin
            .read(&mut byte)
            .await
            .context("Failed to read password")?;
        if read == 0 || byte[0] == b'\n' {
            if read == 0 && bytes.is_empty() {
                anyhow::bail!("No password given");
            }
            break;
        }
        bytes.push(byte[0]);
    }
    let line = String::from_utf8(bytes).context("Password is not valid UTF-8")?;
    Ok(line.trim_end_matches('\r').to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_core::{BlockDef, Language};

    fn block(id: &str) -> Block {
        let mut b = Block::from_def(&BlockDef::code(Language::Shell, ""));
        b.id = BlockId::new(id);
        b
    }

    #[test]
    fn test_resolve_block() {
        let blocks = vec![block("abc123"), block("abd456"), block("ff0000")];
        assert_eq!(resolve_block(&blocks, "ff").unwrap().as_str(), "ff0000");
        assert_eq!(resolve_block(&blocks, "abc123").unwrap().as_str(), "abc123");
        assert!(resolve_block(&blocks, "ab").is_err());
        assert!(resolve_block(&blocks, "zz").is_err());
        assert!(resolve_block(&blocks, "").is_err());
    }
}
