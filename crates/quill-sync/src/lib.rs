//! Conversion between Markdown notes and Quill notebooks.
//!
//! # Architecture
//!
//! ```text
//! note.md ──► parse_markdown_blocks ──► ParsedBlock ──► BlockDef ──► FileStore
//!
//! Notebook ──► render_markdown ──► export.md
//!                    │
//!                    ▼
//!            encrypted blocks stay
//!            sealed in ```age fences
//! ```

mod error;
mod parser;
mod render;

pub use error::{SyncError, SyncResult};
pub use parser::{ParsedBlock, parse_markdown_blocks, to_block_defs};
pub use render::{ENCRYPTED_FENCE, render_markdown};

use std::fs;
use std::path::{Path, PathBuf};

use quill_core::{Block, BlockDef, Notebook, notebook_title};

/// Read a Markdown note and split it into block definitions.
pub fn import_markdown(note_path: impl AsRef<Path>) -> SyncResult<Vec<BlockDef>> {
    let note_path = note_path.as_ref();
    let source = fs::read_to_string(note_path).map_err(|e| SyncError::ReadError {
        path: note_path.to_path_buf(),
        message: e.to_string(),
    })?;

    let defs = to_block_defs(&source, &notebook_title(note_path));
    tracing::debug!("Parsed {} into {} blocks", note_path.display(), defs.len());
    Ok(defs)
}

/// Write a notebook as a single Markdown document.
pub fn export_to_markdown(
    notebook: &Notebook,
    out_path: impl AsRef<Path>,
    is_encrypted: impl Fn(&Block) -> bool,
) -> SyncResult<()> {
    let out_path = out_path.as_ref();
    if out_path.is_dir() {
        return Err(SyncError::InvalidNotebook(format!(
            "export target is a directory: {}",
            out_path.display()
        )));
    }

    let markdown = render_markdown(notebook, is_encrypted);
    fs::write(out_path, markdown).map_err(|e| SyncError::WriteError {
        path: out_path.to_path_buf(),
        message: e.to_string(),
    })?;

    tracing::info!(
        "Exported {} → {} ({} blocks)",
        notebook.path.display(),
        out_path.display(),
        notebook.blocks.len()
    );

    Ok(())
}

/// Default export path: `<title>.export.md` next to the notebook directory.
pub fn default_export_path(notebook_path: impl AsRef<Path>) -> PathBuf {
    let notebook_path = notebook_path.as_ref();
    notebook_path.with_file_name(format!("{}.export.md", notebook_title(notebook_path)))
}
