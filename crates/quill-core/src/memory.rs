//! In-memory file store.
//!
//! Keeps notebooks in a map keyed by path. Useful for tests and for embedding
//! the engine without a vault on disk. Every write is recorded, and writes can
//! be made to fail per block to exercise persistence error paths.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::debug;

use crate::block::{Block, BlockDef, BlockId, BlockType, Language, Notebook, notebook_title};
use crate::error::{Error, Result};
use crate::execute::InterpreterSettings;
use crate::files::FileStore;
use crate::store::BlockStore;

/// A recorded `write_block` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockWrite {
    pub notebook: PathBuf,
    pub id: BlockId,
    pub content: String,
}

#[derive(Debug, Default)]
struct Inner {
    notebooks: FxHashMap<PathBuf, BlockStore>,
    writes: Vec<BlockWrite>,
    failing: FxHashSet<BlockId>,
    interpreters: InterpreterSettings,
}

/// `FileStore` backed by process memory.
#[derive(Debug, Default)]
pub struct MemoryFileStore {
    inner: Mutex<Inner>,
}

impl MemoryFileStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store a notebook as-is, replacing any existing one at the same path.
    pub fn insert_notebook(&self, notebook: Notebook) -> Result<()> {
        let path = notebook.path.clone();
        let store = BlockStore::new(notebook)?;
        self.lock().notebooks.insert(path, store);
        Ok(())
    }

    /// Current persisted state of a notebook.
    pub fn notebook(&self, path: &Path) -> Option<Notebook> {
        self.lock().notebooks.get(path).map(BlockStore::to_notebook)
    }

    /// Persisted content of one block.
    pub fn block_content(&self, path: &Path, id: &BlockId) -> Option<String> {
        self.lock()
            .notebooks
            .get(path)
            .and_then(|s| s.get(id))
            .map(|b| b.content.clone())
    }

    /// Every successful `write_block` call in order.
    pub fn writes(&self) -> Vec<BlockWrite> {
        self.lock().writes.clone()
    }

    pub fn write_count(&self, id: &BlockId) -> usize {
        self.lock().writes.iter().filter(|w| &w.id == id).count()
    }

    /// Make writes for `id` fail (or succeed again).
    pub fn fail_writes_for(&self, id: &BlockId, fail: bool) {
        let mut inner = self.lock();
        if fail {
            inner.failing.insert(id.clone());
        } else {
            inner.failing.remove(id);
        }
    }

    pub fn set_interpreters(&self, settings: InterpreterSettings) {
        self.lock().interpreters = settings;
    }

    fn with_store<T>(
        &self,
        path: &Path,
        f: impl FnOnce(&mut BlockStore) -> Result<T>,
    ) -> Result<T> {
        let mut inner = self.lock();
        let store = inner
            .notebooks
            .get_mut(path)
            .ok_or_else(|| Error::Store(format!("notebook not found: {}", path.display())))?;
        f(store)
    }

    fn create(&self, path: &Path, blocks: Vec<Block>) -> Result<Notebook> {
        let mut inner = self.lock();
        if inner.notebooks.contains_key(path) {
            return Err(Error::Store(format!(
                "notebook already exists: {}",
                path.display()
            )));
        }
        let notebook = Notebook {
            path: path.to_path_buf(),
            name: notebook_title(path),
            blocks,
        };
        inner
            .notebooks
            .insert(path.to_path_buf(), BlockStore::new(notebook.clone())?);
        debug!("Created in-memory notebook {}", path.display());
        Ok(notebook)
    }
}

fn title_block(path: &Path, title: Option<&str>) -> Block {
    let title = title.map(str::to_string).unwrap_or_else(|| notebook_title(path));
    Block::from_def(&BlockDef::markdown(format!("# {}\n\n", title)))
}

#[async_trait]
impl FileStore for MemoryFileStore {
    async fn read_notebook(&self, path: &Path) -> Result<Notebook> {
        self.notebook(path)
            .ok_or_else(|| Error::Store(format!("notebook not found: {}", path.display())))
    }

    async fn create_notebook(&self, path: &Path, title: Option<&str>) -> Result<Notebook> {
        self.create(path, vec![title_block(path, title)])
    }

    async fn create_notebook_with_blocks(
        &self,
        path: &Path,
        blocks: &[BlockDef],
    ) -> Result<Notebook> {
        let blocks = if blocks.is_empty() {
            vec![title_block(path, None)]
        } else {
            blocks.iter().map(Block::from_def).collect()
        };
        self.create(path, blocks)
    }

    async fn write_block(&self, notebook: &Path, id: &BlockId, content: &str) -> Result<()> {
        let mut inner = self.lock();
        if inner.failing.contains(id) {
            return Err(Error::Store(format!("write rejected for block {}", id.short())));
        }
        let store = inner
            .notebooks
            .get_mut(notebook)
            .ok_or_else(|| Error::Store(format!("notebook not found: {}", notebook.display())))?;
        store.set_content(id, content)?;
        inner.writes.push(BlockWrite {
            notebook: notebook.to_path_buf(),
            id: id.clone(),
            content: content.to_string(),
        });
        Ok(())
    }

    async fn add_block(
        &self,
        notebook: &Path,
        block_type: BlockType,
        language: Option<Language>,
        after: Option<&BlockId>,
    ) -> Result<Block> {
        self.with_store(notebook, |store| {
            let id = store.insert(after, block_type, language);
            store
                .get(&id)
                .cloned()
                .ok_or_else(|| Error::BlockNotFound(id.clone()))
        })
    }

    async fn delete_block(&self, notebook: &Path, id: &BlockId) -> Result<()> {
        self.with_store(notebook, |store| store.remove(id).map(|_| ()))
    }

    async fn move_block(&self, notebook: &Path, id: &BlockId, new_index: usize) -> Result<()> {
        self.with_store(notebook, |store| store.move_block(id, new_index).map(|_| ()))
    }

    async fn change_block_type(
        &self,
        notebook: &Path,
        id: &BlockId,
        block_type: BlockType,
        language: Option<Language>,
    ) -> Result<Block> {
        self.with_store(notebook, |store| {
            store.set_type(id, block_type, language)?;
            store
                .get(id)
                .cloned()
                .ok_or_else(|| Error::BlockNotFound(id.clone()))
        })
    }

    async fn set_block_encrypted(
        &self,
        notebook: &Path,
        id: &BlockId,
        encrypted: bool,
    ) -> Result<()> {
        self.with_store(notebook, |store| store.set_encrypted_flag(id, encrypted))
    }

    async fn interpreter_settings(&self, _vault: &Path) -> Result<InterpreterSettings> {
        Ok(self.lock().interpreters.clone())
    }
}
