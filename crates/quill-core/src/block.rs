//! Notebook data model.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Unique identifier for a block within a notebook.
///
/// Ids are opaque strings assigned once at creation and never reused.
/// Generated ids are 32 lowercase hex characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlockId(String);

impl BlockId {
    /// Generate a fresh random id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 8 characters, for human display only.
    pub fn short(&self) -> &str {
        let end = self
            .0
            .char_indices()
            .nth(8)
            .map(|(i, _)| i)
            .unwrap_or(self.0.len());
        &self.0[..end]
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BlockId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for BlockId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Type of block in the notebook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockType {
    /// Prose, rendered by the editor.
    Markdown,
    /// A snippet in some language, possibly executable.
    Code,
}

impl fmt::Display for BlockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockType::Markdown => f.write_str("markdown"),
            BlockType::Code => f.write_str("code"),
        }
    }
}

impl FromStr for BlockType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "markdown" | "md" => Ok(BlockType::Markdown),
            "code" => Ok(BlockType::Code),
            other => Err(Error::InvalidOperation(format!("unknown block type: {}", other))),
        }
    }
}

/// Languages a code block can be written in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[serde(alias = "bash", alias = "sh")]
    Shell,
    #[serde(alias = "py")]
    Python,
    #[serde(alias = "rb")]
    Ruby,
    #[serde(alias = "js", alias = "node")]
    JavaScript,
    #[serde(alias = "ts")]
    TypeScript,
    #[serde(alias = "rs")]
    Rust,
    Sql,
    #[serde(alias = "txt")]
    Text,
}

impl Language {
    pub const ALL: [Language; 8] = [
        Language::Shell,
        Language::Python,
        Language::Ruby,
        Language::JavaScript,
        Language::TypeScript,
        Language::Rust,
        Language::Sql,
        Language::Text,
    ];

    /// Parse a language name or common alias (case-insensitive).
    pub fn parse(name: &str) -> Option<Self> {
        let lang = match name.trim().to_ascii_lowercase().as_str() {
            "shell" | "bash" | "sh" | "zsh" => Language::Shell,
            "python" | "py" | "python3" => Language::Python,
            "ruby" | "rb" => Language::Ruby,
            "javascript" | "js" | "node" => Language::JavaScript,
            "typescript" | "ts" => Language::TypeScript,
            "rust" | "rs" => Language::Rust,
            "sql" => Language::Sql,
            "text" | "txt" | "plain" => Language::Text,
            _ => return None,
        };
        Some(lang)
    }

    /// Canonical lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Shell => "shell",
            Language::Python => "python",
            Language::Ruby => "ruby",
            Language::JavaScript => "javascript",
            Language::TypeScript => "typescript",
            Language::Rust => "rust",
            Language::Sql => "sql",
            Language::Text => "text",
        }
    }

    /// File extension used when a block is stored as its own file.
    pub fn extension(&self) -> &'static str {
        match self {
            Language::Shell => "sh",
            Language::Python => "py",
            Language::Ruby => "rb",
            Language::JavaScript => "js",
            Language::TypeScript => "ts",
            Language::Rust => "rs",
            Language::Sql => "sql",
            Language::Text => "txt",
        }
    }

    /// Whether blocks in this language can be run as an external process.
    pub fn is_executable(&self) -> bool {
        matches!(
            self,
            Language::Shell | Language::Python | Language::Ruby | Language::JavaScript
        )
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Language {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Language::parse(s)
            .ok_or_else(|| Error::InvalidOperation(format!("unsupported language: {}", s)))
    }
}

/// A single block of a notebook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub id: BlockId,
    #[serde(rename = "type")]
    pub block_type: BlockType,
    /// Present only for code blocks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<Language>,
    /// Plaintext or armored ciphertext.
    pub content: String,
    /// Persisted hint that `content` is ciphertext. Content is authoritative.
    #[serde(default)]
    pub encrypted: bool,
}

impl Block {
    /// Create an empty block with a fresh id.
    pub fn new(block_type: BlockType, language: Option<Language>) -> Self {
        Self {
            id: BlockId::generate(),
            block_type,
            language: normalize_language(block_type, language),
            content: String::new(),
            encrypted: false,
        }
    }

    /// Create a block from a definition, assigning a fresh id.
    pub fn from_def(def: &BlockDef) -> Self {
        Self {
            content: def.content.clone(),
            ..Self::new(def.block_type, def.language)
        }
    }

    pub fn is_code(&self) -> bool {
        self.block_type == BlockType::Code
    }
}

/// Enforce "language only for code blocks"; code blocks default to plain text.
pub(crate) fn normalize_language(block_type: BlockType, language: Option<Language>) -> Option<Language> {
    match block_type {
        BlockType::Markdown => None,
        BlockType::Code => Some(language.unwrap_or(Language::Text)),
    }
}

/// Template entry used when creating a notebook with predefined blocks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockDef {
    #[serde(rename = "type")]
    pub block_type: BlockType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<Language>,
    #[serde(default)]
    pub content: String,
}

impl BlockDef {
    pub fn markdown(content: impl Into<String>) -> Self {
        Self {
            block_type: BlockType::Markdown,
            language: None,
            content: content.into(),
        }
    }

    pub fn code(language: Language, content: impl Into<String>) -> Self {
        Self {
            block_type: BlockType::Code,
            language: Some(language),
            content: content.into(),
        }
    }
}

/// A notebook: an ordered list of blocks persisted at one path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notebook {
    pub path: PathBuf,
    pub name: String,
    pub blocks: Vec<Block>,
}

impl Notebook {
    /// Directory that contains the notebook; used as the working directory for runs.
    pub fn parent_dir(&self) -> PathBuf {
        self.path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

/// Display name for a notebook path: the file stem without any `.md` suffix.
pub fn notebook_title(path: &Path) -> String {
    path.file_name()
        .and_then(|s| s.to_str())
        .map(|s| s.trim_end_matches(".md").to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "Untitled".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_are_unique_hex() {
        let a = BlockId::generate();
        let b = BlockId::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 32);
        assert!(a.as_str().chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(a.short().len(), 8);
    }

    #[test]
    fn test_short_id_on_short_input() {
        assert_eq!(BlockId::new("abc").short(), "abc");
    }

    #[test]
    fn test_language_aliases() {
        assert_eq!(Language::parse("bash"), Some(Language::Shell));
        assert_eq!(Language::parse("PY"), Some(Language::Python));
        assert_eq!(Language::parse("node"), Some(Language::JavaScript));
        assert_eq!(Language::parse("cobol"), None);
        assert!("cobol".parse::<Language>().is_err());
    }

    #[test]
    fn test_language_serde_names() {
        let json = serde_json::to_string(&Language::JavaScript).unwrap();
        assert_eq!(json, "\"javascript\"");
        let lang: Language = serde_json::from_str("\"sh\"").unwrap();
        assert_eq!(lang, Language::Shell);
    }

    #[test]
    fn test_executable_languages() {
        let runnable: Vec<_> = Language::ALL.iter().filter(|l| l.is_executable()).collect();
        assert_eq!(runnable.len(), 4);
        assert!(!Language::Rust.is_executable());
    }

    #[test]
    fn test_markdown_blocks_drop_language() {
        let block = Block::new(BlockType::Markdown, Some(Language::Python));
        assert_eq!(block.language, None);

        let code = Block::new(BlockType::Code, None);
        assert_eq!(code.language, Some(Language::Text));
    }

    #[test]
    fn test_block_json_shape() {
        let block = Block {
            id: BlockId::new("b1"),
            block_type: BlockType::Code,
            language: Some(Language::Python),
            content: "print(1)".to_string(),
            encrypted: false,
        };
        let value = serde_json::to_value(&block).unwrap();
        assert_eq!(value["type"], "code");
        assert_eq!(value["language"], "python");
        assert_eq!(value["id"], "b1");
    }

    #[test]
    fn test_notebook_title() {
        assert_eq!(notebook_title(Path::new("/vault/Ideas.md")), "Ideas");
        assert_eq!(notebook_title(Path::new("plain")), "plain");
        assert_eq!(notebook_title(Path::new("/")), "Untitled");
    }
}
