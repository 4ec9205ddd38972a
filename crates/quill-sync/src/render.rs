//! Rendering notebooks back to a single Markdown document.

use quill_core::{Block, BlockType, Notebook};

/// Fence info string used for encrypted blocks.
pub const ENCRYPTED_FENCE: &str = "age";

/// Render a notebook as Markdown.
///
/// Markdown blocks are emitted verbatim, code blocks as fenced code with
/// their language. Blocks for which `is_encrypted` holds are emitted as their
/// ciphertext inside an `age` fence; nothing is decrypted.
pub fn render_markdown(notebook: &Notebook, is_encrypted: impl Fn(&Block) -> bool) -> String {
    let sections: Vec<String> = notebook
        .blocks
        .iter()
        .map(|block| {
            if is_encrypted(block) {
                fenced(ENCRYPTED_FENCE, block.content.trim())
            } else {
                match block.block_type {
                    BlockType::Markdown => block.content.trim_end().to_string(),
                    BlockType::Code => {
                        let language = block.language.map(|l| l.as_str()).unwrap_or("");
                        fenced(language, block.content.trim_end())
                    }
                }
            }
        })
        .filter(|s| !s.is_empty())
        .collect();

    let mut out = sections.join("\n\n");
    out.push('\n');
    out
}

fn fenced(info: &str, body: &str) -> String {
    if body.is_empty() {
        format!("```{}\n```", info)
    } else {
        format!("```{}\n{}\n```", info, body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_core::{BlockDef, Language};
    use std::path::PathBuf;

    fn notebook(defs: &[BlockDef]) -> Notebook {
        Notebook {
            path: PathBuf::from("/vault/Doc.md"),
            name: "Doc".to_string(),
            blocks: defs.iter().map(Block::from_def).collect(),
        }
    }

    #[test]
    fn test_render_mixed_blocks() {
        let nb = notebook(&[
            BlockDef::markdown("# Doc\n\n"),
            BlockDef::code(Language::Shell, "ls\n"),
            BlockDef::markdown("Done."),
        ]);
        let md = render_markdown(&nb, |_| false);
        assert_eq!(md, "# Doc\n\n```shell\nls\n```\n\nDone.\n");
    }

    #[test]
    fn test_encrypted_blocks_stay_sealed() {
        let nb = notebook(&[
            BlockDef::markdown("public"),
            BlockDef::markdown("SEALED-abc\n"),
        ]);
        let md = render_markdown(&nb, |b| b.content.starts_with("SEALED"));
        assert_eq!(md, "public\n\n```age\nSEALED-abc\n```\n");
    }

    #[test]
    fn test_empty_markdown_blocks_are_skipped() {
        let nb = notebook(&[
            BlockDef::markdown("a"),
            BlockDef::markdown(""),
            BlockDef::code(Language::Python, ""),
        ]);
        let md = render_markdown(&nb, |_| false);
        assert_eq!(md, "a\n\n```python\n```\n");
    }
}
