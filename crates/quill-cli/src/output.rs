//! Printing blocks and execution results.

use quill_core::{Block, BlockOutput, BlockType, EncryptionState, NotebookEngine};

use crate::colors;

/// One-line summary of a block: position, short id, type and state.
pub fn block_header(index: usize, block: &Block, state: Option<EncryptionState>) -> String {
    let kind = match (block.block_type, block.language) {
        (BlockType::Code, Some(lang)) => format!("code:{}", lang),
        (block_type, _) => block_type.to_string(),
    };
    let lock = match state {
        Some(EncryptionState::Hidden) => " [encrypted]",
        Some(EncryptionState::Visible) => " [decrypted]",
        _ => "",
    };
    format!(
        "{}[{}]{} {}{}{} {}{}",
        colors::DIM,
        index,
        colors::RESET,
        colors::CYAN,
        block.id.short(),
        colors::RESET,
        kind,
        lock
    )
}

/// Print every block of the open notebook.
pub fn print_notebook(engine: &NotebookEngine) {
    if let Some(name) = engine.notebook_name() {
        println!("\n{}{}{}", colors::BOLD, name, colors::RESET);
        println!("{}", "─".repeat(50));
    }
    for (i, block) in engine.blocks().iter().enumerate() {
        let state = engine.encryption_state(&block.id);
        println!("{}", block_header(i, block, state));
        if state == Some(EncryptionState::Hidden) {
            println!("  {}(decrypt to view){}", colors::DIM, colors::RESET);
        } else if let Some(content) = engine.display_content(&block.id) {
            for line in content.trim_end().lines() {
                println!("  {}", line);
            }
        }
        println!();
    }
}

/// Print a finished run.
pub fn print_output(label: &str, output: &BlockOutput) {
    let (color, status) = match output.exit_code {
        Some(0) => (colors::GREEN, "ok".to_string()),
        Some(code) => (colors::RED, format!("exit {}", code)),
        None => (colors::YELLOW, "running".to_string()),
    };
    println!(
        "{}▶ {}{} {}{}{}",
        colors::BOLD,
        label,
        colors::RESET,
        color,
        status,
        colors::RESET
    );
    if !output.stdout.is_empty() {
        print!("{}", output.stdout);
        if !output.stdout.ends_with('\n') {
            println!();
        }
    }
    if !output.stderr.is_empty() {
        eprint!("{}{}{}", colors::RED, output.stderr, colors::RESET);
        if !output.stderr.ends_with('\n') {
            eprintln!();
        }
    }
    colors::flush_stdout();
}
