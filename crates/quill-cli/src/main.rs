//! Quill CLI - block notebooks from the terminal.

mod colors;
mod crypt;
mod export;
mod notebook;
mod output;
mod run;
mod session;
mod watch;

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};

use crate::crypt::Action;
use crate::session::GlobalOpts;

#[derive(Parser)]
#[command(name = "quill")]
#[command(about = "Block notebooks with per-block encryption and execution")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Vault root (default: nearest ancestor with a .quill directory)
    #[arg(long, global = true)]
    vault: Option<PathBuf>,

    /// Quiet period before an edited block is written
    #[arg(long, global = true, default_value = "1500")]
    save_delay_ms: u64,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new notebook
    New {
        /// Path of the notebook directory (must end in .md)
        path: String,

        /// Title for the first block (default: the notebook name)
        #[arg(long)]
        title: Option<String>,
    },

    /// Print a notebook's blocks
    Show {
        /// Path to the notebook
        notebook: String,
    },

    /// Add a block and print its id
    Add {
        notebook: String,

        /// markdown or code
        #[arg(value_name = "TYPE")]
        block_type: String,

        /// Language for code blocks (shell, python, ruby, javascript, ...)
        #[arg(short, long)]
        language: Option<String>,

        /// Insert after this block (default: at the end)
        #[arg(long)]
        after: Option<String>,

        /// Initial content
        #[arg(long)]
        content: Option<String>,
    },

    /// Replace a block's content
    Edit {
        notebook: String,

        /// Block id or unique prefix
        block: String,

        /// New content, or - to read stdin
        content: String,
    },

    /// Delete a block
    Rm { notebook: String, block: String },

    /// Move a block to a position (clamped to the end)
    Mv {
        notebook: String,
        block: String,
        index: usize,
    },

    /// Change a block's type and language
    Retype {
        notebook: String,
        block: String,

        /// markdown or code
        #[arg(value_name = "TYPE")]
        block_type: String,

        #[arg(short, long)]
        language: Option<String>,
    },

    /// Run code blocks headlessly
    Run {
        notebook: String,

        /// Run only this block
        #[arg(long)]
        block: Option<String>,

        /// Terminate a block that runs longer than this
        #[arg(long)]
        timeout_secs: Option<u64>,
    },

    /// Encrypt a block
    Encrypt { notebook: String, block: String },

    /// Print an encrypted block's plaintext
    Decrypt { notebook: String, block: String },

    /// Re-encrypt a block with the current credential
    Hide { notebook: String, block: String },

    /// Remove a block's encryption
    Unencrypt { notebook: String, block: String },

    /// Convert a Markdown note into a notebook
    Convert {
        /// Path to the note (.md file)
        note: String,
    },

    /// Export a notebook as a single Markdown file
    Export {
        notebook: String,

        /// Output path (default: <name>.export.md next to the notebook)
        #[arg(short, long)]
        output: Option<String>,
    },

    /// Re-run a block whenever the notebook changes on disk
    Watch {
        notebook: String,

        #[arg(long)]
        block: String,
    },

    /// Generate an age identity file
    Keygen {
        /// Where to write the identity
        path: String,

        /// Make it the vault's encryption credential
        #[arg(long = "use")]
        use_for_vault: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        tracing_subscriber::EnvFilter::from_default_env()
            .add_directive(tracing::Level::DEBUG.into())
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    // Helper to format quill-core errors with recovery hints
    let format_error = |err: anyhow::Error| -> anyhow::Error {
        if let Some(quill_err) = err.downcast_ref::<quill_core::Error>() {
            anyhow::anyhow!("{}", quill_err.with_hint())
        } else {
            err
        }
    };

    let opts = GlobalOpts {
        vault: cli.vault,
        save_delay: Duration::from_millis(cli.save_delay_ms),
    };

    match cli.command {
        Commands::New { path, title } => {
            notebook::create(&opts, &path, title.as_deref())
                .await
                .map_err(format_error)?;
        }

        Commands::Show { notebook } => {
            notebook::show(&opts, &notebook).await.map_err(format_error)?;
        }

        Commands::Add {
            notebook,
            block_type,
            language,
            after,
            content,
        } => {
            notebook::add(
                &opts,
                &notebook,
                &block_type,
                language.as_deref(),
                after.as_deref(),
                content.as_deref(),
            )
            .await
            .map_err(format_error)?;
        }

        Commands::Edit {
            notebook,
            block,
            content,
        } => {
            notebook::edit(&opts, &notebook, &block, &content)
                .await
                .map_err(format_error)?;
        }

        Commands::Rm { notebook, block } => {
            notebook::remove(&opts, &notebook, &block)
                .await
                .map_err(format_error)?;
        }

        Commands::Mv {
            notebook,
            block,
            index,
        } => {
            notebook::move_block(&opts, &notebook, &block, index)
                .await
                .map_err(format_error)?;
        }

        Commands::Retype {
            notebook,
            block,
            block_type,
            language,
        } => {
            notebook::retype(&opts, &notebook, &block, &block_type, language.as_deref())
                .await
                .map_err(format_error)?;
        }

        Commands::Run {
            notebook,
            block,
            timeout_secs,
        } => {
            run::execute(
                &opts,
                &notebook,
                block.as_deref(),
                timeout_secs.map(Duration::from_secs),
            )
            .await
            .map_err(format_error)?;
        }

        Commands::Encrypt { notebook, block } => {
            crypt::execute(&opts, &notebook, &block, Action::Encrypt)
                .await
                .map_err(format_error)?;
        }

        Commands::Decrypt { notebook, block } => {
            crypt::execute(&opts, &notebook, &block, Action::Decrypt)
                .await
                .map_err(format_error)?;
        }

        Commands::Hide { notebook, block } => {
            crypt::execute(&opts, &notebook, &block, Action::Hide)
                .await
                .map_err(format_error)?;
        }

        Commands::Unencrypt { notebook, block } => {
            crypt::execute(&opts, &notebook, &block, Action::Unencrypt)
                .await
                .map_err(format_error)?;
        }

        Commands::Convert { note } => {
            export::convert(&note).await.map_err(format_error)?;
        }

        Commands::Export { notebook, output } => {
            export::execute(&opts, &notebook, output.as_deref())
                .await
                .map_err(format_error)?;
        }

        Commands::Watch { notebook, block } => {
            watch::execute(&opts, &notebook, &block)
                .await
                .map_err(format_error)?;
        }

        Commands::Keygen {
            path,
            use_for_vault,
        } => {
            crypt::keygen(&opts, &path, use_for_vault).map_err(format_error)?;
        }
    }

    Ok(())
}
