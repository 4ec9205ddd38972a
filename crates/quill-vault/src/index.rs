//! `.index.json`: block order and metadata of an on-disk notebook.

use std::path::{Path, PathBuf};

use quill_core::{Block, BlockId, BlockType, Language};
use serde::{Deserialize, Serialize};

use crate::error::{VaultError, VaultResult};

pub const INDEX_FILE: &str = ".index.json";
const INDEX_VERSION: u32 = 1;

/// One block of the index, in document order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub id: BlockId,
    #[serde(rename = "type")]
    pub block_type: BlockType,
    /// Content file name relative to the notebook directory.
    pub file: String,
    /// Kept as a string so unknown languages do not invalidate the index.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted: Option<bool>,
}

impl IndexEntry {
    pub fn for_block(block: &Block) -> Self {
        Self {
            id: block.id.clone(),
            block_type: block.block_type,
            file: block_file_name(&block.id, block.block_type, block.language),
            language: block.language.map(|l| l.as_str().to_string()),
            encrypted: block.encrypted.then_some(true),
        }
    }

    /// Language as the data model sees it: none for markdown, text when unknown.
    pub fn language(&self) -> Option<Language> {
        match self.block_type {
            BlockType::Markdown => None,
            BlockType::Code => Some(
                self.language
                    .as_deref()
                    .and_then(Language::parse)
                    .unwrap_or(Language::Text),
            ),
        }
    }

    pub fn to_block(&self, content: String) -> Block {
        Block {
            id: self.id.clone(),
            block_type: self.block_type,
            language: self.language(),
            content,
            encrypted: self.encrypted.unwrap_or(false),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotebookIndex {
    pub version: u32,
    #[serde(default)]
    pub blocks: Vec<IndexEntry>,
}

impl Default for NotebookIndex {
    fn default() -> Self {
        Self {
            version: INDEX_VERSION,
            blocks: Vec::new(),
        }
    }
}

impl NotebookIndex {
    pub fn path(notebook: &Path) -> PathBuf {
        notebook.join(INDEX_FILE)
    }

    /// Read a notebook's index. A missing index is an empty notebook.
    pub async fn load(notebook: &Path) -> VaultResult<Self> {
        let path = Self::path(notebook);
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(VaultError::io(&path, e)),
        };
        serde_json::from_str(&text).map_err(|e| VaultError::InvalidIndex {
            path,
            message: e.to_string(),
        })
    }

    /// Write the index through a temporary file and an atomic rename.
    pub async fn save(&self, notebook: &Path) -> VaultResult<()> {
        let path = Self::path(notebook);
        let text = serde_json::to_string_pretty(self).map_err(|e| VaultError::InvalidIndex {
            path: path.clone(),
            message: e.to_string(),
        })?;

        let tmp = notebook.join(format!("{}.tmp", INDEX_FILE));
        tokio::fs::write(&tmp, text)
            .await
            .map_err(|e| VaultError::io(&tmp, e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| VaultError::io(&path, e))
    }

    pub fn position(&self, id: &BlockId) -> VaultResult<usize> {
        self.blocks
            .iter()
            .position(|b| &b.id == id)
            .ok_or_else(|| VaultError::BlockNotFound(id.clone()))
    }

    pub fn entry(&self, id: &BlockId) -> VaultResult<&IndexEntry> {
        self.position(id).map(|i| &self.blocks[i])
    }

    pub fn entry_mut(&mut self, id: &BlockId) -> VaultResult<&mut IndexEntry> {
        let i = self.position(id)?;
        Ok(&mut self.blocks[i])
    }

    /// Insert after `after` when it is present, otherwise append.
    pub fn insert_after(&mut self, entry: IndexEntry, after: Option<&BlockId>) -> usize {
        let at = after
            .and_then(|a| self.blocks.iter().position(|b| &b.id == a))
            .map(|i| i + 1)
            .unwrap_or(self.blocks.len());
        self.blocks.insert(at, entry);
        at
    }
}

/// Content file name for a block: `<id>.md` for markdown, `<id>.<ext>` for code.
pub fn block_file_name(id: &BlockId, block_type: BlockType, language: Option<Language>) -> String {
    let ext = match block_type {
        BlockType::Markdown => "md",
        BlockType::Code => language.unwrap_or(Language::Text).extension(),
    };
    format!("{}.{}", id, ext)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_names() {
        let id = BlockId::new("abc");
        assert_eq!(block_file_name(&id, BlockType::Markdown, None), "abc.md");
        assert_eq!(
            block_file_name(&id, BlockType::Code, Some(Language::Python)),
            "abc.py"
        );
        assert_eq!(block_file_name(&id, BlockType::Code, None), "abc.txt");
    }

    #[test]
    fn test_index_json_shape() {
        let json = r#"{
            "version": 1,
            "blocks": [
                {"id": "a", "type": "markdown", "file": "a.md"},
                {"id": "b", "type": "code", "file": "b.sh", "language": "bash", "encrypted": true},
                {"id": "c", "type": "code", "file": "c.txt", "language": "cobol"}
            ]
        }"#;
        let index: NotebookIndex = serde_json::from_str(json).unwrap();
        assert_eq!(index.blocks[0].language(), None);
        assert_eq!(index.blocks[1].language(), Some(Language::Shell));
        assert!(index.blocks[1].to_block(String::new()).encrypted);
        assert_eq!(index.blocks[2].language(), Some(Language::Text));

        let out = serde_json::to_value(&index.blocks[0]).unwrap();
        assert!(out.get("language").is_none());
        assert!(out.get("encrypted").is_none());
        assert_eq!(out["type"], "markdown");
    }

    #[test]
    fn test_insert_after_unknown_appends() {
        let mut index = NotebookIndex::default();
        let a = Block::new(BlockType::Markdown, None);
        let b = Block::new(BlockType::Markdown, None);
        let c = Block::new(BlockType::Markdown, None);
        index.insert_after(IndexEntry::for_block(&a), None);
        index.insert_after(IndexEntry::for_block(&b), Some(&BlockId::new("missing")));
        assert_eq!(index.insert_after(IndexEntry::for_block(&c), Some(&a.id)), 1);
        let ids: Vec<_> = index.blocks.iter().map(|e| e.id.clone()).collect();
        assert_eq!(ids, vec![a.id, c.id, b.id]);
    }
}
