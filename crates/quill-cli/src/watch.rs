//! Watch command implementation for Quill CLI.
//!
//! Re-runs a block whenever the notebook changes on disk.

use std::path::Path;

use quill_vault::{FileEvent, FileWatcher};

use crate::colors;
use crate::run::run_one;
use crate::session::{GlobalOpts, Session};

/// Execute the watch command.
pub async fn execute(opts: &GlobalOpts, notebook: &str, block: &str) -> anyhow::Result<()> {
    let session = Session::open(opts, notebook).await?;
    let id = session.block(block)?;
    let path = session
        .engine
        .notebook_path()
        .ok_or(quill_core::Error::NoNotebook)?;

    println!(
        "\n{}Quill Watch{} - {}{}{} block {}",
        colors::BOLD,
        colors::RESET,
        colors::CYAN,
        display_name(&path),
        colors::RESET,
        id.short()
    );
    println!(
        "{}Watching for changes... (Ctrl+C to stop){}",
        colors::DIM,
        colors::RESET
    );

    if let Err(e) = run_one(&session.engine, &id, None).await {
        eprintln!("{}Error:{} {}", colors::RED, colors::RESET, e);
    }

    let mut watcher = FileWatcher::new(&path)
        .map_err(|e| anyhow::anyhow!("Failed to create file watcher: {}", e))?;

    loop {
        tokio::select! {
            event = watcher.recv() => match event {
                Some(FileEvent::Modified(_)) => {
                    println!("\n{}Notebook changed, re-running...{}", colors::YELLOW, colors::RESET);
                    if let Err(e) = session.engine.open(&path).await {
                        eprintln!("{}Error:{} {}", colors::RED, colors::RESET, e.with_hint());
                        continue;
                    }
                    if !session.engine.blocks().iter().any(|b| b.id == id) {
                        eprintln!("{}Block {} was removed{}", colors::YELLOW, id.short(), colors::RESET);
                        break;
                    }
                    if let Err(e) = run_one(&session.engine, &id, None).await {
                        eprintln!("{}Error:{} {}", colors::RED, colors::RESET, e);
                    }
                }
                Some(FileEvent::Removed(removed)) => {
                    if !path.exists() {
                        eprintln!("\n{}Warning:{} Notebook removed", colors::YELLOW, colors::RESET);
                        break;
                    }
                    tracing::debug!("Removed {}", removed.display());
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    session.engine.close().await;
    Ok(())
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .unwrap_or_default()
        .to_string_lossy()
        .to_string()
}
