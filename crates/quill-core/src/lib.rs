//! Core engine for Quill notebooks.
//!
//! This crate provides:
//! - The notebook data model (blocks, languages, notebooks)
//! - `BlockStore` for ordered, invariant-checked block sequences
//! - `PersistenceScheduler` for per-block debounced saving
//! - `EncryptionMediator` for ciphertext/overlay views of encrypted blocks
//! - `ExecutionCoordinator` and `CommandRunner` for running code blocks
//! - `NotebookEngine`, the facade that composes all of the above
//!
//! Storage, cryptography and process spawning are reached through the
//! [`FileStore`], [`EncryptionService`] and [`ProcessRunner`] traits so the
//! engine can be driven by on-disk, in-memory or scripted collaborators.

pub mod block;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod events;
pub mod execute;
pub mod files;
pub mod memory;
pub mod persist;
pub mod store;

pub use block::{Block, BlockDef, BlockId, BlockType, Language, Notebook, notebook_title};
pub use crypto::{
    EncryptionMediator, EncryptionService, EncryptionState, PasswordIntent, PendingPasswordRequest,
    UnlockError,
};
pub use engine::{EngineConfig, NotebookEngine, RunTicket};
pub use error::{Error, Result};
pub use events::EngineEvent;
pub use execute::{
    BlockOutput, CommandRunner, ExecutionCoordinator, ExecutionStatus, InterpreterSettings,
    OutputChunk, OutputStream, ProcessHandle, ProcessRunner, SpawnRequest, SpawnedProcess,
};
pub use files::FileStore;
pub use memory::MemoryFileStore;
pub use persist::{DEFAULT_SAVE_DELAY, FlushJob, PersistenceScheduler};
pub use store::BlockStore;
