//! Ordered block storage for one open notebook.

use std::path::{Path, PathBuf};

use crate::block::{Block, BlockId, BlockType, Language, Notebook, normalize_language};
use crate::error::{Error, Result};

/// In-memory ordered block sequence for one notebook.
///
/// Position in `blocks` is the only record of document order. A store is
/// never empty: construction rejects an empty notebook and `remove` refuses to
/// take the last block.
#[derive(Debug, Clone)]
pub struct BlockStore {
    path: PathBuf,
    name: String,
    blocks: Vec<Block>,
}

impl BlockStore {
    /// Wrap a notebook read from storage.
    pub fn new(notebook: Notebook) -> Result<Self> {
        if notebook.blocks.is_empty() {
            return Err(Error::Store(format!(
                "notebook {} has no blocks",
                notebook.path.display()
            )));
        }
        Ok(Self {
            path: notebook.path,
            name: notebook.name,
            blocks: notebook.blocks,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Create an empty block after `after` (or at the end) and return its id.
    pub fn insert(
        &mut self,
        after: Option<&BlockId>,
        block_type: BlockType,
        language: Option<Language>,
    ) -> BlockId {
        let block = Block::new(block_type, language);
        let id = block.id.clone();
        self.insert_block(block, after);
        id
    }

    /// Insert an existing block after `after`; unknown or absent anchors append.
    pub fn insert_block(&mut self, block: Block, after: Option<&BlockId>) {
        match after.and_then(|a| self.position(a)) {
            Some(idx) => self.blocks.insert(idx + 1, block),
            None => self.blocks.push(block),
        }
    }

    /// Remove a block, returning it. The last remaining block cannot be removed.
    pub fn remove(&mut self, id: &BlockId) -> Result<Block> {
        let idx = self
            .position(id)
            .ok_or_else(|| Error::BlockNotFound(id.clone()))?;
        if self.blocks.len() == 1 {
            return Err(Error::LastBlock);
        }
        Ok(self.blocks.remove(idx))
    }

    /// Move a block to `new_index`, clamped to the last position.
    ///
    /// Returns the index the block ended up at.
    pub fn move_block(&mut self, id: &BlockId, new_index: usize) -> Result<usize> {
        let idx = self
            .position(id)
            .ok_or_else(|| Error::BlockNotFound(id.clone()))?;
        let target = new_index.min(self.blocks.len() - 1);
        if target != idx {
            let block = self.blocks.remove(idx);
            self.blocks.insert(target, block);
        }
        Ok(target)
    }

    /// Replace a block's content. Returns false when the content was identical.
    pub fn set_content(&mut self, id: &BlockId, content: &str) -> Result<bool> {
        let block = self.get_mut(id)?;
        if block.content == content {
            return Ok(false);
        }
        block.content = content.to_string();
        Ok(true)
    }

    /// Change a block's type; language is dropped for markdown and defaulted for code.
    pub fn set_type(
        &mut self,
        id: &BlockId,
        block_type: BlockType,
        language: Option<Language>,
    ) -> Result<()> {
        let block = self.get_mut(id)?;
        block.block_type = block_type;
        block.language = normalize_language(block_type, language);
        Ok(())
    }

    pub fn set_encrypted_flag(&mut self, id: &BlockId, encrypted: bool) -> Result<()> {
        self.get_mut(id)?.encrypted = encrypted;
        Ok(())
    }

    /// Replace a block wholesale with the version returned by storage.
    pub fn replace(&mut self, block: Block) -> Result<()> {
        let slot = self.get_mut(&block.id.clone())?;
        *slot = block;
        Ok(())
    }

    pub fn get(&self, id: &BlockId) -> Option<&Block> {
        self.blocks.iter().find(|b| &b.id == id)
    }

    fn get_mut(&mut self, id: &BlockId) -> Result<&mut Block> {
        self.blocks
            .iter_mut()
            .find(|b| &b.id == id)
            .ok_or_else(|| Error::BlockNotFound(id.clone()))
    }

    pub fn all(&self) -> &[Block] {
        &self.blocks
    }

    pub fn position(&self, id: &BlockId) -> Option<usize> {
        self.blocks.iter().position(|b| &b.id == id)
    }

    pub fn contains(&self, id: &BlockId) -> bool {
        self.position(id).is_some()
    }

    /// Snapshot the store as a plain notebook value.
    pub fn to_notebook(&self) -> Notebook {
        Notebook {
            path: self.path.clone(),
            name: self.name.clone(),
            blocks: self.blocks.clone(),
        }
    }
}
