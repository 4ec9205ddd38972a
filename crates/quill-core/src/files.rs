//! Storage collaborator.

use std::path::Path;

use async_trait::async_trait;

use crate::block::{Block, BlockDef, BlockId, BlockType, Language, Notebook};
use crate::error::Result;
use crate::execute::InterpreterSettings;

/// Persistent notebook storage.
///
/// Structural operations are applied to storage first; the engine mirrors
/// them in memory only after the store reports success.
#[async_trait]
pub trait FileStore: Send + Sync {
    async fn read_notebook(&self, path: &Path) -> Result<Notebook>;

    /// Create a notebook seeded with a single titled markdown block.
    async fn create_notebook(&self, path: &Path, title: Option<&str>) -> Result<Notebook>;

    /// Create a notebook from predefined blocks.
    async fn create_notebook_with_blocks(&self, path: &Path, blocks: &[BlockDef])
    -> Result<Notebook>;

    async fn write_block(&self, notebook: &Path, id: &BlockId, content: &str) -> Result<()>;

    async fn add_block(
        &self,
        notebook: &Path,
        block_type: BlockType,
        language: Option<Language>,
        after: Option<&BlockId>,
    ) -> Result<Block>;

    async fn delete_block(&self, notebook: &Path, id: &BlockId) -> Result<()>;

    async fn move_block(&self, notebook: &Path, id: &BlockId, new_index: usize) -> Result<()>;

    async fn change_block_type(
        &self,
        notebook: &Path,
        id: &BlockId,
        block_type: BlockType,
        language: Option<Language>,
    ) -> Result<Block>;

    /// Persist the advisory `encrypted` flag.
    async fn set_block_encrypted(&self, notebook: &Path, id: &BlockId, encrypted: bool)
    -> Result<()>;

    /// Interpreter overrides configured for a vault.
    async fn interpreter_settings(&self, vault: &Path) -> Result<InterpreterSettings>;
}
