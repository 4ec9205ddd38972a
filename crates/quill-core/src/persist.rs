//! Debounced per-block persistence scheduling.
//!
//! The scheduler owns the dirty set, one cancellable timer per dirty block and
//! a revision counter per block. It never performs I/O itself: when a timer
//! expires it runs the future supplied by the engine, which claims the timer,
//! reads the block's current content and writes it to the file store.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::block::BlockId;
use crate::store::BlockStore;

/// Quiet period after the last edit before a block is written.
pub const DEFAULT_SAVE_DELAY: Duration = Duration::from_millis(1500);

/// A pending debounce timer.
#[derive(Debug)]
struct Timer {
    ticket: u64,
    handle: JoinHandle<()>,
}

/// Persistence bookkeeping for one block.
#[derive(Debug, Default)]
struct Slot {
    /// Bumped on every edit; a flush only clears `dirty` if it wrote the latest revision.
    revision: u64,
    dirty: bool,
    timer: Option<Timer>,
}

/// Snapshot of what a flush is about to write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushJob {
    pub id: BlockId,
    pub content: String,
    pub revision: u64,
    /// The block's stored `encrypted` flag at the time of the snapshot.
    pub encrypted: bool,
}

/// Tracks dirty blocks and schedules their debounced flushes.
#[derive(Debug)]
pub struct PersistenceScheduler {
    delay: Duration,
    slots: FxHashMap<BlockId, Slot>,
    flush_locks: FxHashMap<BlockId, Arc<tokio::sync::Mutex<()>>>,
    next_ticket: u64,
}

impl PersistenceScheduler {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            slots: FxHashMap::default(),
            flush_locks: FxHashMap::default(),
            next_ticket: 0,
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Mark a block dirty and (re)start its debounce timer.
    ///
    /// `on_expiry` receives the timer's ticket and builds the future that runs
    /// once the delay has elapsed without a newer edit. Without a tokio runtime
    /// the block is left dirty with no timer; an explicit save still flushes it.
    pub fn mark_dirty<F, Fut>(&mut self, id: &BlockId, on_expiry: F)
    where
        F: FnOnce(u64) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.next_ticket += 1;
        let ticket = self.next_ticket;
        let delay = self.delay;

        let slot = self.slots.entry(id.clone()).or_default();
        slot.revision += 1;
        slot.dirty = true;

        if let Some(previous) = slot.timer.take() {
            previous.handle.abort();
            debug!("Restarted save timer for block {}", id.short());
        }

        let task = on_expiry(ticket);
        match Handle::try_current() {
            Ok(runtime) => {
                let handle = runtime.spawn(async move {
                    tokio::time::sleep(delay).await;
                    task.await;
                });
                slot.timer = Some(Timer { ticket, handle });
            }
            Err(_) => {
                warn!(
                    "No async runtime; block {} stays dirty until saved explicitly",
                    id.short()
                );
            }
        }
    }

    /// Take ownership of an expired timer.
    ///
    /// Returns false when the timer was superseded or cancelled, in which case
    /// the caller must not flush. A claimed timer can no longer be aborted.
    pub fn claim_timer(&mut self, id: &BlockId, ticket: u64) -> bool {
        match self.slots.get_mut(id) {
            Some(slot) if slot.timer.as_ref().is_some_and(|t| t.ticket == ticket) => {
                slot.timer = None;
                true
            }
            _ => false,
        }
    }

    /// Cancel a block's pending timer without touching its dirty state.
    pub fn cancel_timer(&mut self, id: &BlockId) {
        if let Some(timer) = self.slots.get_mut(id).and_then(|s| s.timer.take()) {
            timer.handle.abort();
            debug!("Cancelled save timer for block {}", id.short());
        }
    }

    /// Cancel every pending timer.
    pub fn cancel_all(&mut self) {
        for slot in self.slots.values_mut() {
            if let Some(timer) = slot.timer.take() {
                timer.handle.abort();
            }
        }
    }

    /// Whether a timer is currently pending for the block.
    pub fn has_timer(&self, id: &BlockId) -> bool {
        self.slots.get(id).is_some_and(|s| s.timer.is_some())
    }

    pub fn is_dirty(&self, id: &BlockId) -> bool {
        self.slots.get(id).is_some_and(|s| s.dirty)
    }

    /// Dirty block ids in document order.
    pub fn dirty_ids(&self, store: &BlockStore) -> Vec<BlockId> {
        store
            .all()
            .iter()
            .filter(|b| self.is_dirty(&b.id))
            .map(|b| b.id.clone())
            .collect()
    }

    /// Snapshot the current content of a dirty block for writing.
    ///
    /// Content is read at flush time, never at schedule time, so a flush always
    /// writes the newest edit. Returns `None` for clean or unknown blocks.
    pub fn prepare_flush(&self, id: &BlockId, store: &BlockStore) -> Option<FlushJob> {
        let slot = self.slots.get(id).filter(|s| s.dirty)?;
        let block = store.get(id)?;
        Some(FlushJob {
            id: id.clone(),
            content: block.content.clone(),
            revision: slot.revision,
            encrypted: block.encrypted,
        })
    }

    /// Record a successful write of `revision`.
    ///
    /// Returns true when the block is now clean. A newer edit made while the
    /// write was in flight keeps the block dirty.
    pub fn confirm_flushed(&mut self, id: &BlockId, revision: u64) -> bool {
        match self.slots.get_mut(id) {
            Some(slot) if slot.revision == revision => {
                slot.dirty = false;
                true
            }
            _ => false,
        }
    }

    /// Lock serialising flushes of one block.
    pub fn flush_lock(&mut self, id: &BlockId) -> Arc<tokio::sync::Mutex<()>> {
        self.flush_locks.entry(id.clone()).or_default().clone()
    }

    /// Drop all state for a removed block, cancelling its timer.
    pub fn forget(&mut self, id: &BlockId) {
        self.cancel_timer(id);
        self.slots.remove(id);
        self.flush_locks.remove(id);
    }

    /// Cancel all timers and forget every block.
    pub fn clear(&mut self) {
        self.cancel_all();
        self.slots.clear();
        self.flush_locks.clear();
    }
}

impl Default for PersistenceScheduler {
    fn default() -> Self {
        Self::new(DEFAULT_SAVE_DELAY)
    }
}

impl Drop for PersistenceScheduler {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
