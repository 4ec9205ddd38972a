//! Run command implementation for Quill CLI.
//!
//! Runs one block or every executable block of a notebook, in order.

use std::time::{Duration, Instant};

use quill_core::{BlockId, EncryptionState, NotebookEngine};

use crate::colors;
use crate::output::print_output;
use crate::session::{GlobalOpts, Session, with_password};

/// Execute the run command.
pub async fn execute(
    opts: &GlobalOpts,
    notebook: &str,
    block: Option<&str>,
    timeout: Option<Duration>,
) -> anyhow::Result<()> {
    let session = Session::open(opts, notebook).await?;
    let targets: Vec<BlockId> = match block {
        Some(reference) => vec![session.block(reference)?],
        None => session
            .engine
            .blocks()
            .into_iter()
            .filter(|b| b.language.is_some_and(|l| l.is_executable()))
            .map(|b| b.id)
            .collect(),
    };

    if targets.is_empty() {
        println!("{}No executable blocks{}", colors::DIM, colors::RESET);
        return session.finish().await;
    }

    let start = Instant::now();
    let mut failed = 0;
    for id in &targets {
        match run_one(&session.engine, id, timeout).await {
            Ok(true) => {}
            Ok(false) => failed += 1,
            Err(e) => {
                failed += 1;
                eprintln!("{}Error:{} {}", colors::RED, colors::RESET, e);
            }
        }
    }

    println!("{}", "─".repeat(50));
    println!(
        "{}Completed{} {} blocks in {:.2}s",
        if failed == 0 { colors::GREEN } else { colors::YELLOW },
        colors::RESET,
        targets.len(),
        start.elapsed().as_secs_f64()
    );
    session.finish().await?;

    if failed > 0 {
        anyhow::bail!("{} of {} blocks failed", failed, targets.len());
    }
    Ok(())
}

/// Run a block to completion. Returns whether it exited with 0.
pub async fn run_one(
    engine: &NotebookEngine,
    id: &BlockId,
    timeout: Option<Duration>,
) -> anyhow::Result<bool> {
    if engine.encryption_state(id) == Some(EncryptionState::Hidden) {
        with_password(engine, || engine.decrypt_block(id)).await?;
    }

    let ticket = engine.run_block(id).await?;
    let output = match timeout {
        Some(limit) => {
            let waiting = ticket.wait();
            tokio::pin!(waiting);
            match tokio::time::timeout(limit, &mut waiting).await {
                Ok(output) => output,
                Err(_) => {
                    eprintln!(
                        "{}Timed out after {:.1}s; terminating{}",
                        colors::YELLOW,
                        limit.as_secs_f64(),
                        colors::RESET
                    );
                    engine.terminate_block(id).await?;
                    waiting.await
                }
            }
        }
        None => ticket.wait().await,
    };

    let output = output.or_else(|| engine.get_output(id)).unwrap_or_default();
    print_output(id.short(), &output);
    Ok(output.exit_code == Some(0))
}
