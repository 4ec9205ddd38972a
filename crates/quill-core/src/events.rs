//! Engine notifications.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::block::{BlockId, BlockType, Language};
use crate::crypto::{EncryptionState, PasswordIntent};

/// State changes broadcast to subscribers of a `NotebookEngine`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    NotebookOpened {
        path: PathBuf,
        name: String,
    },
    NotebookClosed {
        path: PathBuf,
    },
    BlockAdded {
        block_id: BlockId,
        index: usize,
    },
    BlockRemoved {
        block_id: BlockId,
    },
    BlockMoved {
        block_id: BlockId,
        index: usize,
    },
    BlockChanged {
        block_id: BlockId,
        block_type: BlockType,
        language: Option<Language>,
    },
    /// Editor-visible content changed (stored content or overlay).
    ContentChanged {
        block_id: BlockId,
    },
    Saved {
        block_id: BlockId,
    },
    SaveFailed {
        block_id: BlockId,
        message: String,
    },
    OutputChanged {
        block_id: BlockId,
    },
    ExecutionFinished {
        block_id: BlockId,
        exit_code: i32,
    },
    EncryptionChanged {
        block_id: BlockId,
        state: EncryptionState,
    },
    PasswordRequired {
        block_id: BlockId,
        intent: PasswordIntent,
    },
}

impl EngineEvent {
    /// Block the event refers to, if any.
    pub fn block_id(&self) -> Option<&BlockId> {
        match self {
            EngineEvent::NotebookOpened { .. } | EngineEvent::NotebookClosed { .. } => None,
            EngineEvent::BlockAdded { block_id, .. }
            | EngineEvent::BlockRemoved { block_id }
            | EngineEvent::BlockMoved { block_id, .. }
            | EngineEvent::BlockChanged { block_id, .. }
            | EngineEvent::ContentChanged { block_id }
            | EngineEvent::Saved { block_id }
            | EngineEvent::SaveFailed { block_id, .. }
            | EngineEvent::OutputChanged { block_id }
            | EngineEvent::ExecutionFinished { block_id, .. }
            | EngineEvent::EncryptionChanged { block_id, .. }
            | EngineEvent::PasswordRequired { block_id, .. } => Some(block_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_json_is_tagged() {
        let event = EngineEvent::ExecutionFinished {
            block_id: BlockId::new("b1"),
            exit_code: -15,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "execution_finished");
        assert_eq!(json["exit_code"], -15);
        assert_eq!(event.block_id(), Some(&BlockId::new("b1")));
    }
}
