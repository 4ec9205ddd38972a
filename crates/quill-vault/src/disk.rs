//! Notebooks stored as directories.
//!
//! A notebook is a directory whose name ends in `.md`. `.index.json` lists the
//! blocks in order and each block's content lives in its own file, so an edit
//! to one block never rewrites the others.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use quill_core::{
    Block, BlockDef, BlockId, BlockType, FileStore, InterpreterSettings, Language, Notebook,
    notebook_title,
};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::VaultConfig;
use crate::error::{VaultError, VaultResult};
use crate::index::{IndexEntry, NotebookIndex, block_file_name};

/// Whether `path` is a notebook directory.
pub fn is_notebook(path: &Path) -> bool {
    path.is_dir() && path.extension().is_some_and(|e| e == "md")
}

/// `FileStore` backed by notebook directories.
#[derive(Debug, Default)]
pub struct DiskFileStore {
    /// Serialises read-modify-write cycles on index files.
    index_lock: Mutex<()>,
}

impl DiskFileStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn read(&self, path: &Path) -> VaultResult<Notebook> {
        if !is_notebook(path) {
            return Err(VaultError::NotANotebook(path.to_path_buf()));
        }

        let index = NotebookIndex::load(path).await?;
        let mut blocks = Vec::with_capacity(index.blocks.len());
        for entry in &index.blocks {
            let content = read_optional(&path.join(&entry.file)).await?;
            blocks.push(entry.to_block(content));
        }

        debug!("Read notebook {} ({} blocks)", path.display(), blocks.len());
        Ok(Notebook {
            path: path.to_path_buf(),
            name: notebook_title(path),
            blocks,
        })
    }

    /// Create a notebook directory holding `blocks`.
    pub async fn create(&self, path: &Path, blocks: Vec<Block>) -> VaultResult<Notebook> {
        if tokio::fs::try_exists(path)
            .await
            .map_err(|e| VaultError::io(path, e))?
        {
            return Err(VaultError::AlreadyExists(path.to_path_buf()));
        }
        let notebook = write_notebook_dir(path, blocks).await?;
        info!("Created notebook {}", path.display());
        Ok(notebook)
    }

    /// Turn a single-file Markdown note into a notebook at the same path.
    ///
    /// Fenced code becomes code blocks. The note is only removed once the
    /// notebook has been fully written next to it.
    pub async fn convert_note_to_notebook(&self, note_path: &Path) -> VaultResult<Notebook> {
        let meta = tokio::fs::metadata(note_path)
            .await
            .map_err(|e| VaultError::io(note_path, e))?;
        if meta.is_dir() {
            return Err(VaultError::AlreadyExists(note_path.to_path_buf()));
        }

        let defs = quill_sync::import_markdown(note_path)?;
        let blocks = defs.iter().map(Block::from_def).collect();

        let staging = staging_path(note_path);
        if tokio::fs::try_exists(&staging).await.unwrap_or(false) {
            tokio::fs::remove_dir_all(&staging)
                .await
                .map_err(|e| VaultError::io(&staging, e))?;
        }
        let staged = write_notebook_dir(&staging, blocks).await?;

        tokio::fs::remove_file(note_path)
            .await
            .map_err(|e| VaultError::io(note_path, e))?;
        tokio::fs::rename(&staging, note_path)
            .await
            .map_err(|e| VaultError::io(note_path, e))?;

        info!(
            "Converted {} into a notebook ({} blocks)",
            note_path.display(),
            staged.blocks.len()
        );
        Ok(Notebook {
            path: note_path.to_path_buf(),
            name: notebook_title(note_path),
            blocks: staged.blocks,
        })
    }

    async fn update_index<T>(
        &self,
        notebook: &Path,
        f: impl FnOnce(&mut NotebookIndex) -> VaultResult<T>,
    ) -> VaultResult<T> {
        let _guard = self.index_lock.lock().await;
        if !is_notebook(notebook) {
            return Err(VaultError::NotANotebook(notebook.to_path_buf()));
        }
        let mut index = NotebookIndex::load(notebook).await?;
        let out = f(&mut index)?;
        index.save(notebook).await?;
        Ok(out)
    }

}

fn title_block(path: &Path, title: Option<&str>) -> Block {
    let title = title.map(str::to_string).unwrap_or_else(|| notebook_title(path));
    Block::from_def(&BlockDef::markdown(format!("# {}\n\n", title)))
}

fn staging_path(note_path: &Path) -> PathBuf {
    let mut name = note_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".converting");
    note_path.with_file_name(name)
}

async fn write_notebook_dir(path: &Path, blocks: Vec<Block>) -> VaultResult<Notebook> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|e| VaultError::io(path, e))?;

    let mut index = NotebookIndex::default();
    for block in &blocks {
        let entry = IndexEntry::for_block(block);
        let file = path.join(&entry.file);
        tokio::fs::write(&file, &block.content)
            .await
            .map_err(|e| VaultError::io(&file, e))?;
        index.blocks.push(entry);
    }
    index.save(path).await?;

    Ok(Notebook {
        path: path.to_path_buf(),
        name: notebook_title(path),
        blocks,
    })
}

/// Read a file, treating a missing file as empty.
async fn read_optional(path: &Path) -> VaultResult<String> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => Ok(content),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(VaultError::io(path, e)),
    }
}

async fn remove_optional(path: &Path) -> VaultResult<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(VaultError::io(path, e)),
    }
}

#[async_trait]
impl FileStore for DiskFileStore {
    async fn read_notebook(&self, path: &Path) -> quill_core::Result<Notebook> {
        Ok(self.read(path).await?)
    }

    async fn create_notebook(
        &self,
        path: &Path,
        title: Option<&str>,
    ) -> quill_core::Result<Notebook> {
        Ok(self.create(path, vec![title_block(path, title)]).await?)
    }

    async fn create_notebook_with_blocks(
        &self,
        path: &Path,
        blocks: &[BlockDef],
    ) -> quill_core::Result<Notebook> {
        let blocks = if blocks.is_empty() {
            vec![title_block(path, None)]
        } else {
            blocks.iter().map(Block::from_def).collect()
        };
        Ok(self.create(path, blocks).await?)
    }

    async fn write_block(
        &self,
        notebook: &Path,
        id: &BlockId,
        content: &str,
    ) -> quill_core::Result<()> {
        // Held across the write so a concurrent rename or delete of the block
        // file cannot swallow it.
        let _guard = self.index_lock.lock().await;
        let entry = NotebookIndex::load(notebook).await?.entry(id).cloned()?;
        let file = notebook.join(&entry.file);
        tokio::fs::write(&file, content)
            .await
            .map_err(|e| VaultError::io(&file, e))?;
        Ok(())
    }

    async fn add_block(
        &self,
        notebook: &Path,
        block_type: BlockType,
        language: Option<Language>,
        after: Option<&BlockId>,
    ) -> quill_core::Result<Block> {
        let block = Block::new(block_type, language);
        let entry = IndexEntry::for_block(&block);
        let file = notebook.join(&entry.file);
        if !is_notebook(notebook) {
            return Err(VaultError::NotANotebook(notebook.to_path_buf()).into());
        }

        tokio::fs::write(&file, "")
            .await
            .map_err(|e| VaultError::io(&file, e))?;
        self.update_index(notebook, |index| {
            index.insert_after(entry, after);
            Ok(())
        })
        .await?;
        Ok(block)
    }

    async fn delete_block(&self, notebook: &Path, id: &BlockId) -> quill_core::Result<()> {
        let removed = self
            .update_index(notebook, |index| {
                let at = index.position(id)?;
                Ok(index.blocks.remove(at))
            })
            .await?;
        remove_optional(&notebook.join(&removed.file)).await?;
        Ok(())
    }

    async fn move_block(
        &self,
        notebook: &Path,
        id: &BlockId,
        new_index: usize,
    ) -> quill_core::Result<()> {
        self.update_index(notebook, |index| {
            let at = index.position(id)?;
            let entry = index.blocks.remove(at);
            let to = new_index.min(index.blocks.len());
            index.blocks.insert(to, entry);
            Ok(())
        })
        .await?;
        Ok(())
    }

    async fn change_block_type(
        &self,
        notebook: &Path,
        id: &BlockId,
        block_type: BlockType,
        language: Option<Language>,
    ) -> quill_core::Result<Block> {
        let _guard = self.index_lock.lock().await;
        let mut index = NotebookIndex::load(notebook).await?;
        let entry = index.entry_mut(id)?;

        let old_path = notebook.join(&entry.file);
        let content = read_optional(&old_path).await?;

        let mut changed = entry.to_block(content);
        changed.block_type = block_type;
        changed.language = match block_type {
            BlockType::Markdown => None,
            BlockType::Code => Some(language.unwrap_or(Language::Text)),
        };
        let new_file = block_file_name(id, block_type, changed.language);
        let new_path = notebook.join(&new_file);

        if new_path != old_path {
            tokio::fs::write(&new_path, &changed.content)
                .await
                .map_err(|e| VaultError::io(&new_path, e))?;
        }

        entry.block_type = block_type;
        entry.language = changed.language.map(|l| l.as_str().to_string());
        entry.file = new_file;
        index.save(notebook).await?;

        if new_path != old_path {
            remove_optional(&old_path).await?;
        }
        Ok(changed)
    }

    async fn set_block_encrypted(
        &self,
        notebook: &Path,
        id: &BlockId,
        encrypted: bool,
    ) -> quill_core::Result<()> {
        self.update_index(notebook, |index| {
            index.entry_mut(id)?.encrypted = encrypted.then_some(true);
            Ok(())
        })
        .await?;
        Ok(())
    }

    async fn interpreter_settings(&self, vault: &Path) -> quill_core::Result<InterpreterSettings> {
        Ok(VaultConfig::load(vault)?.interpreters)
    }
}
