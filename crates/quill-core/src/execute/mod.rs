//! Block execution.
//!
//! Code blocks run as external interpreter processes, one in flight per block.
//!
//! # Architecture
//!
//! ```text
//! NotebookEngine::run_block
//!     │
//!     ├── ExecutionCoordinator::begin     (output slot -> running)
//!     │
//!     └── ProcessRunner::spawn
//!             │
//!             ├── output: OutputChunk stream ──> ExecutionCoordinator::append
//!             │
//!             └── exit: Option<i32> ──────────> ExecutionCoordinator::finish
//!
//! NotebookEngine::terminate_block
//!     │
//!     ├── ExecutionCoordinator::begin_terminate (exit now settles as terminated)
//!     │
//!     └── ProcessRunner::terminate (SIGTERM to the process group)
//!             └── ExecutionCoordinator::mark_terminated
//! ```
//!
//! # Module Structure
//!
//! - `coordinator` - Per-block output slots and the run state machine
//! - `interpreter` - Interpreter resolution per language
//! - `process` - `CommandRunner`, the OS-process `ProcessRunner`

mod coordinator;
mod interpreter;
mod process;

use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::block::Language;
use crate::error::Result;

pub use coordinator::{
    BlockOutput, ExecutionCoordinator, ExecutionStatus, FAILED_EXIT_CODE, TERMINATED_EXIT_CODE,
    TERMINATED_MARKER,
};
pub use interpreter::InterpreterSettings;
pub use process::CommandRunner;

/// Opaque identifier of a spawned process, valid for the runner that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessHandle(pub u64);

impl fmt::Display for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "proc-{}", self.0)
    }
}

/// Which pipe a chunk of output came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// A piece of process output, delivered as produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    pub stream: OutputStream,
    pub text: String,
}

impl OutputChunk {
    pub fn stdout(text: impl Into<String>) -> Self {
        Self {
            stream: OutputStream::Stdout,
            text: text.into(),
        }
    }

    pub fn stderr(text: impl Into<String>) -> Self {
        Self {
            stream: OutputStream::Stderr,
            text: text.into(),
        }
    }
}

/// Everything a runner needs to start a block.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub language: Language,
    pub code: String,
    pub working_dir: PathBuf,
    /// Interpreter override; `None` uses the language default.
    pub interpreter: Option<String>,
}

/// A started process.
///
/// `output` closes once both pipes reach end of file. `exit` resolves to the
/// exit code, or `None` when the process was killed by a signal.
pub struct SpawnedProcess {
    pub handle: ProcessHandle,
    pub output: mpsc::UnboundedReceiver<OutputChunk>,
    pub exit: BoxFuture<'static, Result<Option<i32>>>,
}

impl fmt::Debug for SpawnedProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpawnedProcess")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

/// Process collaborator.
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    async fn spawn(&self, request: SpawnRequest) -> Result<SpawnedProcess>;

    /// Ask a running process to stop. Returns false if it is unknown or already gone.
    async fn terminate(&self, handle: ProcessHandle) -> bool;
}
