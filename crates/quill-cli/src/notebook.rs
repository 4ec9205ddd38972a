//! Structural and content commands: new, show, add, edit, rm, mv, retype.

use anyhow::Context;
use quill_core::{BlockType, EncryptionState, Language};
use tokio::io::AsyncReadExt;

use crate::colors;
use crate::output::print_notebook;
use crate::session::{GlobalOpts, Session, notebook_path, with_password};

/// Parse `--language`, rejecting unknown names.
fn language(name: Option<&str>) -> anyhow::Result<Option<Language>> {
    name.map(str::parse::<Language>)
        .transpose()
        .map_err(anyhow::Error::from)
}

/// Create a notebook seeded with a title block.
pub async fn create(opts: &GlobalOpts, notebook: &str, title: Option<&str>) -> anyhow::Result<()> {
    let path = notebook_path(notebook)?;
    if path.extension().is_none_or(|e| e != "md") {
        anyhow::bail!("Notebook paths must end in .md: {}", path.display());
    }
    let session = Session::new(opts, &path)?;
    session.engine.create(&path, title).await?;
    println!("Created new notebook: {}", path.display());
    session.finish().await
}

pub async fn show(opts: &GlobalOpts, notebook: &str) -> anyhow::Result<()> {
    let session = Session::open(opts, notebook).await?;
    print_notebook(&session.engine);
    session.finish().await
}

pub async fn add(
    opts: &GlobalOpts,
    notebook: &str,
    block_type: &str,
    lang: Option<&str>,
    after: Option<&str>,
    content: Option<&str>,
) -> anyhow::Result<()> {
    let block_type: BlockType = block_type.parse()?;
    let lang = language(lang)?;
    let session = Session::open(opts, notebook).await?;
    let after = after.map(|r| session.block(r)).transpose()?;

    let id = session
        .engine
        .add_block(block_type, lang, after.as_ref())
        .await?;
    if let Some(content) = content {
        session.engine.update_content(&id, content)?;
    }
    println!("{}", id);
    session.finish().await
}

/// Replace a block's content. `-` reads the new content from stdin.
///
/// Encrypted blocks are decrypted, edited and sealed again.
pub async fn edit(opts: &GlobalOpts, notebook: &str, block: &str, content: &str) -> anyhow::Result<()> {
    let content = if content == "-" {
        let mut buf = String::new();
        tokio::io::stdin()
            .read_to_string(&mut buf)
            .await
            .context("Failed to read content from stdin")?;
        buf
    } else {
        content.to_string()
    };

    let session = Session::open(opts, notebook).await?;
    let id = session.block(block)?;
    let engine = &session.engine;

    if engine.encryption_state(&id) == Some(EncryptionState::Hidden) {
        with_password(engine, || engine.decrypt_block(&id)).await?;
        engine.update_content(&id, &content)?;
        with_password(engine, || engine.hide_block(&id)).await?;
    } else {
        engine.update_content(&id, &content)?;
    }
    session.finish().await
}

pub async fn remove(opts: &GlobalOpts, notebook: &str, block: &str) -> anyhow::Result<()> {
    let session = Session::open(opts, notebook).await?;
    let id = session.block(block)?;
    session.engine.delete_block(&id).await?;
    println!("Deleted block {}", id.short());
    session.finish().await
}

pub async fn move_block(
    opts: &GlobalOpts,
    notebook: &str,
    block: &str,
    index: usize,
) -> anyhow::Result<()> {
    let session = Session::open(opts, notebook).await?;
    let id = session.block(block)?;
    let placed = session.engine.move_block(&id, index).await?;
    if placed != index {
        println!(
            "{}Moved to the end (position {}){}",
            colors::DIM,
            placed,
            colors::RESET
        );
    }
    session.finish().await
}

pub async fn retype(
    opts: &GlobalOpts,
    notebook: &str,
    block: &str,
    block_type: &str,
    lang: Option<&str>,
) -> anyhow::Result<()> {
    let block_type: BlockType = block_type.parse()?;
    let lang = language(lang)?;
    let session = Session::open(opts, notebook).await?;
    let id = session.block(block)?;
    session.engine.change_type(&id, block_type, lang).await?;
    session.finish().await
}
