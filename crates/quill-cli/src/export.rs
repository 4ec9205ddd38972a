//! Markdown conversion commands: export, convert.

use std::time::Instant;

use quill_core::Notebook;
use quill_sync::{default_export_path, export_to_markdown};
use quill_vault::{DiskFileStore, is_armored};

use crate::colors;
use crate::session::{GlobalOpts, Session, notebook_path};

/// Write a notebook as one Markdown file. Encrypted blocks stay sealed.
pub async fn execute(opts: &GlobalOpts, notebook: &str, output: Option<&str>) -> anyhow::Result<()> {
    let start = Instant::now();
    let session = Session::open(opts, notebook).await?;
    let engine = &session.engine;

    let path = engine.notebook_path().ok_or(quill_core::Error::NoNotebook)?;
    let snapshot = Notebook {
        name: engine.notebook_name().unwrap_or_default(),
        blocks: engine.blocks(),
        path: path.clone(),
    };
    let out = match output {
        Some(out) => std::path::absolute(out)?,
        None => default_export_path(&path),
    };

    export_to_markdown(&snapshot, &out, |block| is_armored(&block.content))?;
    println!(
        "  {} → {} {}✓{} ({:.2}ms)",
        snapshot.name,
        out.display(),
        colors::GREEN,
        colors::RESET,
        start.elapsed().as_secs_f64() * 1000.0
    );
    session.finish().await
}

/// Turn a single-file Markdown note into a notebook at the same path.
pub async fn convert(note: &str) -> anyhow::Result<()> {
    let path = notebook_path(note)?;
    let notebook = DiskFileStore::new().convert_note_to_notebook(&path).await?;
    println!(
        "Converted {} into a notebook with {} blocks",
        path.display(),
        notebook.blocks.len()
    );
    Ok(())
}
