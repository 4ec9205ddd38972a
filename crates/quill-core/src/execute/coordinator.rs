//! Per-block run state.
//!
//! Each block has at most one output slot and at most one process in flight.
//! Every run gets a number; results tagged with an older run number are
//! ignored, so a late exit from a terminated or replaced run can never
//! overwrite the current slot.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use super::{OutputChunk, OutputStream, ProcessHandle};
use crate::block::BlockId;
use crate::error::{Error, Result};

/// Exit code reported for a block stopped by `terminate` (SIGTERM).
pub const TERMINATED_EXIT_CODE: i32 = -15;

/// Exit code reported when the process could not be spawned or waited on.
pub const FAILED_EXIT_CODE: i32 = -1;

/// Appended to stderr when a run is terminated.
pub const TERMINATED_MARKER: &str = "[Terminated]";

/// Output of the latest run of a block.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` while running.
    pub exit_code: Option<i32>,
    pub running: bool,
}

impl BlockOutput {
    fn started() -> Self {
        Self {
            running: true,
            ..Self::default()
        }
    }
}

/// Run state of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Idle,
    Running,
    Completed,
    Failed,
    Terminated,
}

#[derive(Debug)]
struct Slot {
    run: u64,
    status: ExecutionStatus,
    output: BlockOutput,
    handle: Option<ProcessHandle>,
    /// Set once a terminate signal is on its way; the exit then settles as
    /// terminated no matter who observes it first.
    terminating: bool,
    waiters: Vec<oneshot::Sender<BlockOutput>>,
}

impl Slot {
    fn settle_terminated(&mut self) -> BlockOutput {
        if !self.output.stderr.is_empty() && !self.output.stderr.ends_with('\n') {
            self.output.stderr.push('\n');
        }
        self.output.stderr.push_str(TERMINATED_MARKER);
        self.output.exit_code = Some(TERMINATED_EXIT_CODE);
        self.settle(ExecutionStatus::Terminated)
    }

    fn settle(&mut self, status: ExecutionStatus) -> BlockOutput {
        self.status = status;
        self.output.running = false;
        self.handle = None;
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(self.output.clone());
        }
        self.output.clone()
    }
}

/// Output slots and in-flight processes of every block.
#[derive(Debug, Default)]
pub struct ExecutionCoordinator {
    slots: FxHashMap<BlockId, Slot>,
    next_run: u64,
}

impl ExecutionCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a run: reset the slot to `running` and return the run number plus
    /// a receiver for the final output.
    ///
    /// A block that is already running is rejected and left untouched.
    pub fn begin(&mut self, id: &BlockId) -> Result<(u64, oneshot::Receiver<BlockOutput>)> {
        if self.is_running(id) {
            return Err(Error::AlreadyRunning(id.clone()));
        }
        self.next_run += 1;
        let run = self.next_run;
        let (tx, rx) = oneshot::channel();
        self.slots.insert(
            id.clone(),
            Slot {
                run,
                status: ExecutionStatus::Running,
                output: BlockOutput::started(),
                handle: None,
                terminating: false,
                waiters: vec![tx],
            },
        );
        Ok((run, rx))
    }

    fn current(&mut self, id: &BlockId, run: u64) -> Option<&mut Slot> {
        self.slots
            .get_mut(id)
            .filter(|s| s.run == run && s.status == ExecutionStatus::Running)
    }

    /// Record the process serving `run`. Returns false if the run is no longer
    /// current or is being terminated, in which case the caller owns the
    /// process and should stop it.
    pub fn attach(&mut self, id: &BlockId, run: u64, handle: ProcessHandle) -> bool {
        match self.current(id, run) {
            Some(slot) if !slot.terminating => {
                slot.handle = Some(handle);
                true
            }
            _ => false,
        }
    }

    /// Append streamed output to a running block.
    pub fn append(&mut self, id: &BlockId, run: u64, chunk: &OutputChunk) -> bool {
        match self.current(id, run) {
            Some(slot) => {
                match chunk.stream {
                    OutputStream::Stdout => slot.output.stdout.push_str(&chunk.text),
                    OutputStream::Stderr => slot.output.stderr.push_str(&chunk.text),
                }
                true
            }
            None => false,
        }
    }

    /// Complete a run with the process exit status.
    ///
    /// `None` (killed by a signal nobody asked for) is reported as a failure.
    /// A run being terminated settles as terminated.
    pub fn finish(&mut self, id: &BlockId, run: u64, exit: Option<i32>) -> Option<BlockOutput> {
        let slot = self.current(id, run)?;
        if slot.terminating {
            return Some(slot.settle_terminated());
        }
        let code = exit.unwrap_or(FAILED_EXIT_CODE);
        slot.output.exit_code = Some(code);
        let status = if code == 0 {
            ExecutionStatus::Completed
        } else {
            ExecutionStatus::Failed
        };
        Some(slot.settle(status))
    }

    /// Complete a run that could not be spawned or waited on.
    pub fn fail(&mut self, id: &BlockId, run: u64, message: &str) -> Option<BlockOutput> {
        let slot = self.current(id, run)?;
        if slot.terminating {
            return Some(slot.settle_terminated());
        }
        if !slot.output.stderr.is_empty() && !slot.output.stderr.ends_with('\n') {
            slot.output.stderr.push('\n');
        }
        slot.output.stderr.push_str(message);
        slot.output.exit_code = Some(FAILED_EXIT_CODE);
        Some(slot.settle(ExecutionStatus::Failed))
    }

    /// Flag a running block as being terminated.
    ///
    /// Returns the run number and its process, if spawned. Nothing is settled
    /// yet; call `mark_terminated` once the signal is sent.
    pub fn begin_terminate(&mut self, id: &BlockId) -> Option<(u64, Option<ProcessHandle>)> {
        let slot = self
            .slots
            .get_mut(id)
            .filter(|s| s.status == ExecutionStatus::Running)?;
        slot.terminating = true;
        Some((slot.run, slot.handle))
    }

    /// Undo `begin_terminate` after the signal could not be sent.
    pub fn cancel_terminate(&mut self, id: &BlockId, run: u64) {
        if let Some(slot) = self.current(id, run) {
            slot.terminating = false;
        }
    }

    /// Mark a running block as terminated, keeping any partial output.
    ///
    /// Returns `None` when `run` already settled.
    pub fn mark_terminated(&mut self, id: &BlockId, run: u64) -> Option<BlockOutput> {
        Some(self.current(id, run)?.settle_terminated())
    }

    /// Whether `run` ended as terminated.
    pub fn was_terminated(&self, id: &BlockId, run: u64) -> bool {
        self.slots
            .get(id)
            .is_some_and(|s| s.run == run && s.status == ExecutionStatus::Terminated)
    }

    pub fn is_running(&self, id: &BlockId) -> bool {
        self.status(id) == ExecutionStatus::Running
    }

    pub fn status(&self, id: &BlockId) -> ExecutionStatus {
        self.slots
            .get(id)
            .map(|s| s.status)
            .unwrap_or(ExecutionStatus::Idle)
    }

    pub fn output(&self, id: &BlockId) -> Option<&BlockOutput> {
        self.slots.get(id).map(|s| &s.output)
    }

    /// Process serving a running block, once spawned.
    pub fn running_handle(&self, id: &BlockId) -> Option<ProcessHandle> {
        self.slots
            .get(id)
            .filter(|s| s.status == ExecutionStatus::Running)
            .and_then(|s| s.handle)
    }

    /// Ids of every running block.
    pub fn running_ids(&self) -> Vec<BlockId> {
        self.slots
            .iter()
            .filter(|(_, s)| s.status == ExecutionStatus::Running)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Clear a finished block's output. Running blocks cannot be cleared.
    pub fn clear_output(&mut self, id: &BlockId) -> Result<bool> {
        if self.is_running(id) {
            return Err(Error::InvalidOperation(format!(
                "block {} is still running",
                id.short()
            )));
        }
        Ok(self.slots.remove(id).is_some())
    }

    /// Drop a block's slot, returning its process if one is in flight.
    pub fn forget(&mut self, id: &BlockId) -> Option<ProcessHandle> {
        let slot = self.slots.remove(id)?;
        if slot.status == ExecutionStatus::Running {
            slot.handle
        } else {
            None
        }
    }

    /// Drop every slot, returning all in-flight processes.
    pub fn clear(&mut self) -> Vec<ProcessHandle> {
        let handles = self
            .slots
            .values()
            .filter(|s| s.status == ExecutionStatus::Running)
            .filter_map(|s| s.handle)
            .collect();
        self.slots.clear();
        handles
    }
}
