//! Splitting Markdown notes into notebook blocks.
//!
//! Fenced code becomes a code block, everything between fences becomes a
//! markdown block.

use quill_core::{BlockDef, BlockType, Language};

/// A section of a Markdown document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedBlock {
    pub block_type: BlockType,
    /// Fence info string, for code sections only.
    pub language: Option<String>,
    pub content: String,
}

impl ParsedBlock {
    fn markdown(text: &str) -> Option<Self> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return None;
        }
        Some(Self {
            block_type: BlockType::Markdown,
            language: None,
            content: trimmed.to_string(),
        })
    }

    fn code(info: &str, body: &str) -> Self {
        Self {
            block_type: BlockType::Code,
            language: Some(info.to_string()).filter(|s| !s.is_empty()),
            content: body.trim_end().to_string(),
        }
    }

    /// Convert to a block definition. Unknown languages become plain text.
    pub fn to_def(&self) -> BlockDef {
        match self.block_type {
            BlockType::Markdown => BlockDef::markdown(self.content.clone()),
            BlockType::Code => {
                let language = self
                    .language
                    .as_deref()
                    .and_then(Language::parse)
                    .unwrap_or(Language::Text);
                BlockDef::code(language, self.content.clone())
            }
        }
    }
}

/// Split Markdown text into markdown and code sections.
///
/// Any line starting with three backticks toggles a fence. Text outside
/// fences is trimmed and dropped when empty. An unterminated fence at the end
/// of the input is still treated as code.
pub fn parse_markdown_blocks(source: &str) -> Vec<ParsedBlock> {
    let mut blocks = Vec::new();
    let mut text = String::new();
    let mut fence: Option<String> = None;
    let mut code = String::new();

    for line in source.lines() {
        if line.starts_with("```") {
            match fence.take() {
                Some(info) => {
                    blocks.push(ParsedBlock::code(&info, &code));
                    code.clear();
                }
                None => {
                    blocks.extend(ParsedBlock::markdown(&text));
                    text.clear();
                    fence = Some(line.trim_start_matches('`').trim().to_string());
                }
            }
            continue;
        }

        let buf = if fence.is_some() { &mut code } else { &mut text };
        if !buf.is_empty() {
            buf.push('\n');
        }
        buf.push_str(line);
    }

    match fence {
        Some(info) => blocks.push(ParsedBlock::code(&info, &code)),
        None => blocks.extend(ParsedBlock::markdown(&text)),
    }

    blocks
}

/// Block definitions for a new notebook built from Markdown text.
///
/// A document with no content yields a single `# <title>` block so the
/// notebook is never empty.
pub fn to_block_defs(source: &str, title: &str) -> Vec<BlockDef> {
    let defs: Vec<BlockDef> = parse_markdown_blocks(source)
        .iter()
        .map(ParsedBlock::to_def)
        .collect();

    if defs.is_empty() {
        vec![BlockDef::markdown(format!("# {}\n\n", title))]
    } else {
        defs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_text_and_fences() {
        let source = r#"# Setup

Install things first.

```bash
echo one
echo two

```

Then check:

```python
print(1)
```
"#;
        let blocks = parse_markdown_blocks(source);
        assert_eq!(blocks.len(), 4);

        assert_eq!(blocks[0].block_type, BlockType::Markdown);
        assert_eq!(blocks[0].content, "# Setup\n\nInstall things first.");

        assert_eq!(blocks[1].block_type, BlockType::Code);
        assert_eq!(blocks[1].language.as_deref(), Some("bash"));
        assert_eq!(blocks[1].content, "echo one\necho two");

        assert_eq!(blocks[2].content, "Then check:");
        assert_eq!(blocks[3].language.as_deref(), Some("python"));
        assert_eq!(blocks[3].content, "print(1)");
    }

    #[test]
    fn test_fence_without_info_string() {
        let blocks = parse_markdown_blocks("```\nplain\n```");
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].language, None);
        assert_eq!(blocks[0].to_def().language, Some(Language::Text));
    }

    #[test]
    fn test_unterminated_fence_is_code() {
        let blocks = parse_markdown_blocks("intro\n```ruby\nputs 1\n");
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[1].block_type, BlockType::Code);
        assert_eq!(blocks[1].content, "puts 1");
        assert_eq!(blocks[1].to_def().language, Some(Language::Ruby));
    }

    #[test]
    fn test_unknown_language_becomes_text() {
        let defs = to_block_defs("```haskell\nmain = pure ()\n```", "T");
        assert_eq!(defs[0].block_type, BlockType::Code);
        assert_eq!(defs[0].language, Some(Language::Text));
    }

    #[test]
    fn test_empty_document_gets_title_block() {
        let defs = to_block_defs("  \n\n", "Ideas");
        assert_eq!(defs, vec![BlockDef::markdown("# Ideas\n\n")]);
    }
}
