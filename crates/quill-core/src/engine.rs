//! The notebook engine facade.
//!
//! `NotebookEngine` owns the open notebook and composes the block store, the
//! persistence scheduler, the encryption mediator and the execution
//! coordinator. All of that state sits behind one mutex that is never held
//! across an `.await`: every operation validates and snapshots under the lock,
//! performs its external call unlocked, then re-locks to commit.
//!
//! Every open, create and close starts a new session. Asynchronous
//! completions (flushes, process output, crypto results) remember the session
//! they started in and are discarded if the notebook changed meanwhile.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info, warn};

use crate::block::{Block, BlockDef, BlockId, BlockType, Language, Notebook};
use crate::crypto::{
    EncryptionMediator, EncryptionService, EncryptionState, PasswordIntent,
    PendingPasswordRequest, ensure_unlocked,
};
use crate::error::{Error, Result};
use crate::events::EngineEvent;
use crate::execute::{
    BlockOutput, ExecutionCoordinator, ExecutionStatus, FAILED_EXIT_CODE, ProcessHandle,
    ProcessRunner, SpawnRequest, SpawnedProcess,
};
use crate::files::FileStore;
use crate::persist::{DEFAULT_SAVE_DELAY, PersistenceScheduler};
use crate::store::BlockStore;

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Quiet period before a dirty block is written.
    pub save_delay: Duration,
    /// Directory used to look up interpreter settings. Defaults to the
    /// notebook's parent directory.
    pub vault_root: Option<PathBuf>,
    /// Capacity of the event broadcast channel.
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            save_delay: DEFAULT_SAVE_DELAY,
            vault_root: None,
            event_capacity: 256,
        }
    }
}

/// Handle to a started run. Resolves once the run completes, fails or is terminated.
#[derive(Debug)]
pub struct RunTicket {
    block_id: BlockId,
    rx: oneshot::Receiver<BlockOutput>,
}

impl RunTicket {
    pub fn block_id(&self) -> &BlockId {
        &self.block_id
    }

    /// Wait for the final output. `None` if the block or notebook went away first.
    pub async fn wait(self) -> Option<BlockOutput> {
        self.rx.await.ok()
    }
}

struct EngineState {
    session: u64,
    notebook: Option<BlockStore>,
    scheduler: PersistenceScheduler,
    crypto: EncryptionMediator,
    execution: ExecutionCoordinator,
}

impl EngineState {
    fn store(&self) -> Result<&BlockStore> {
        self.notebook.as_ref().ok_or(Error::NoNotebook)
    }

    fn block(&self, id: &BlockId) -> Result<&Block> {
        self.store()?
            .get(id)
            .ok_or_else(|| Error::BlockNotFound(id.clone()))
    }

    /// Fail if the notebook changed since `session` began.
    fn ensure_session(&self, session: u64) -> Result<()> {
        if self.session != session || self.notebook.is_none() {
            warn!("Discarding result from a previous notebook session");
            return Err(Error::InvalidOperation(
                "the notebook changed while the operation was in flight".to_string(),
            ));
        }
        Ok(())
    }

    /// Drop everything tied to the open notebook and start a new session.
    fn reset(&mut self) -> (Option<PathBuf>, Vec<ProcessHandle>) {
        if let Some(store) = &self.notebook {
            let dirty = self.scheduler.dirty_ids(store).len();
            if dirty > 0 {
                warn!(
                    "Closing {} with {} unsaved block(s)",
                    store.path().display(),
                    dirty
                );
            }
        }
        self.scheduler.clear();
        self.crypto.clear();
        let handles = self.execution.clear();
        self.session += 1;
        let previous = self.notebook.take().map(|s| s.path().to_path_buf());
        (previous, handles)
    }
}

struct EngineInner {
    files: Arc<dyn FileStore>,
    encryption: Arc<dyn EncryptionService>,
    runner: Arc<dyn ProcessRunner>,
    config: EngineConfig,
    events: broadcast::Sender<EngineEvent>,
    state: Mutex<EngineState>,
}

impl EngineInner {
    fn state(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: EngineEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

/// A single-document notebook engine.
///
/// Cloning yields another handle to the same engine.
#[derive(Clone)]
pub struct NotebookEngine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for NotebookEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotebookEngine")
            .field("notebook", &self.notebook_path())
            .field("config", &self.inner.config)
            .finish()
    }
}

impl NotebookEngine {
    pub fn new(
        files: Arc<dyn FileStore>,
        encryption: Arc<dyn EncryptionService>,
        runner: Arc<dyn ProcessRunner>,
        config: EngineConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let state = EngineState {
            session: 0,
            notebook: None,
            scheduler: PersistenceScheduler::new(config.save_delay),
            crypto: EncryptionMediator::new(),
            execution: ExecutionCoordinator::new(),
        };
        Self {
            inner: Arc::new(EngineInner {
                files,
                encryption,
                runner,
                config,
                events,
                state: Mutex::new(state),
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Subscribe to engine events.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.events.subscribe()
    }

    /// Session number and path of the open notebook.
    fn context(&self) -> Result<(u64, PathBuf)> {
        let state = self.inner.state();
        let store = state.store()?;
        Ok((state.session, store.path().to_path_buf()))
    }

    /// Like `context`, additionally checking the block exists.
    fn block_context(&self, id: &BlockId) -> Result<(u64, PathBuf)> {
        let state = self.inner.state();
        let store = state.store()?;
        if !store.contains(id) {
            return Err(Error::BlockNotFound(id.clone()));
        }
        Ok((state.session, store.path().to_path_buf()))
    }

    // ---------------------------------------------------------------------
    // Lifecycle
    // ---------------------------------------------------------------------

    /// Open a notebook, closing any notebook that is currently open.
    ///
    /// A notebook with no blocks on disk gets one empty markdown block.
    pub async fn open(&self, path: &Path) -> Result<()> {
        let mut notebook = self.inner.files.read_notebook(path).await?;
        if notebook.blocks.is_empty() {
            debug!("{} has no blocks; adding one", path.display());
            let block = self
                .inner
                .files
                .add_block(path, BlockType::Markdown, None, None)
                .await?;
            notebook.blocks.push(block);
        }
        self.install(notebook).await
    }

    /// Create a notebook seeded with a titled markdown block and open it.
    pub async fn create(&self, path: &Path, title: Option<&str>) -> Result<()> {
        let notebook = self.inner.files.create_notebook(path, title).await?;
        self.install(notebook).await
    }

    /// Create a notebook from predefined blocks and open it.
    pub async fn create_from_template(&self, path: &Path, blocks: &[BlockDef]) -> Result<()> {
        let notebook = self
            .inner
            .files
            .create_notebook_with_blocks(path, blocks)
            .await?;
        self.install(notebook).await
    }

    async fn install(&self, notebook: Notebook) -> Result<()> {
        let store = BlockStore::new(notebook)?;
        let path = store.path().to_path_buf();
        let name = store.name().to_string();

        let (previous, handles) = {
            let mut state = self.inner.state();
            let reset = state.reset();
            state.notebook = Some(store);
            reset
        };
        self.stop_processes(handles).await;

        if let Some(previous) = previous {
            self.inner.emit(EngineEvent::NotebookClosed { path: previous });
        }
        info!("Opened notebook {}", path.display());
        self.inner.emit(EngineEvent::NotebookOpened { path, name });
        Ok(())
    }

    /// Close the open notebook.
    ///
    /// Pending save timers are cancelled without flushing; call
    /// [`save_all`](Self::save_all) first when durability matters. Running
    /// processes are terminated and all outputs and overlays are dropped.
    pub async fn close(&self) {
        let (previous, handles) = self.inner.state().reset();
        self.stop_processes(handles).await;
        if let Some(path) = previous {
            info!("Closed notebook {}", path.display());
            self.inner.emit(EngineEvent::NotebookClosed { path });
        }
    }

    async fn stop_processes(&self, handles: Vec<ProcessHandle>) {
        for handle in handles {
            if !self.inner.runner.terminate(handle).await {
                warn!("Failed to terminate {}", handle);
            }
        }
    }

    // ---------------------------------------------------------------------
    // Structure and content
    // ---------------------------------------------------------------------

    /// Add an empty block after `after` (or at the end when absent or unknown).
    pub async fn add_block(
        &self,
        block_type: BlockType,
        language: Option<Language>,
        after: Option<&BlockId>,
    ) -> Result<BlockId> {
        let (session, path) = self.context()?;
        let block = self
            .inner
            .files
            .add_block(&path, block_type, language, after)
            .await?;
        let id = block.id.clone();

        let index = {
            let mut guard = self.inner.state();
            let state = &mut *guard;
            state.ensure_session(session)?;
            let store = state.notebook.as_mut().ok_or(Error::NoNotebook)?;
            store.insert_block(block, after);
            store.position(&id).unwrap_or(store.len() - 1)
        };
        debug!("Added block {} at {}", id.short(), index);
        self.inner.emit(EngineEvent::BlockAdded {
            block_id: id.clone(),
            index,
        });
        Ok(id)
    }

    /// Replace a block's editor content.
    ///
    /// With a decrypted overlay visible the edit goes to the overlay and is not
    /// persisted. Otherwise the block is marked dirty and its save timer restarts.
    pub fn update_content(&self, id: &BlockId, text: &str) -> Result<()> {
        let changed = {
            let mut guard = self.inner.state();
            let state = &mut *guard;
            let store = state.notebook.as_mut().ok_or(Error::NoNotebook)?;
            if !store.contains(id) {
                return Err(Error::BlockNotFound(id.clone()));
            }
            match state.crypto.edit_overlay(id, text) {
                Some(changed) => changed,
                None => {
                    let changed = store.set_content(id, text)?;
                    if changed {
                        self.schedule_flush(state, id);
                    }
                    changed
                }
            }
        };
        if changed {
            self.inner.emit(EngineEvent::ContentChanged {
                block_id: id.clone(),
            });
        }
        Ok(())
    }

    /// Delete a block. The last block of a notebook cannot be deleted.
    ///
    /// Also cancels the block's save timer, drops its overlay, output and any
    /// password request for it, and terminates its running process.
    pub async fn delete_block(&self, id: &BlockId) -> Result<()> {
        let (session, path, lock) = {
            let mut guard = self.inner.state();
            let state = &mut *guard;
            let store = state.notebook.as_ref().ok_or(Error::NoNotebook)?;
            if !store.contains(id) {
                return Err(Error::BlockNotFound(id.clone()));
            }
            if store.len() == 1 {
                return Err(Error::LastBlock);
            }
            let path = store.path().to_path_buf();
            (state.session, path, state.scheduler.flush_lock(id))
        };

        // An in-flight flush of this block must land before its file goes away.
        let _serial = lock.lock().await;
        self.inner.files.delete_block(&path, id).await?;

        let handle = {
            let mut guard = self.inner.state();
            let state = &mut *guard;
            state.ensure_session(session)?;
            let store = state.notebook.as_mut().ok_or(Error::NoNotebook)?;
            store.remove(id)?;
            state.scheduler.forget(id);
            state.crypto.clear_overlay(id);
            if state.crypto.drop_pending_for(id) {
                debug!("Dropped password request for deleted block {}", id.short());
            }
            state.execution.forget(id)
        };
        if let Some(handle) = handle {
            self.stop_processes(vec![handle]).await;
        }

        debug!("Deleted block {}", id.short());
        self.inner.emit(EngineEvent::BlockRemoved {
            block_id: id.clone(),
        });
        Ok(())
    }

    /// Move a block to `new_index`, clamped to the last position.
    ///
    /// Returns the block's final index.
    pub async fn move_block(&self, id: &BlockId, new_index: usize) -> Result<usize> {
        let (session, path) = self.block_context(id)?;
        self.inner.files.move_block(&path, id, new_index).await?;

        let index = {
            let mut guard = self.inner.state();
            let state = &mut *guard;
            state.ensure_session(session)?;
            let store = state.notebook.as_mut().ok_or(Error::NoNotebook)?;
            store.move_block(id, new_index)?
        };
        self.inner.emit(EngineEvent::BlockMoved {
            block_id: id.clone(),
            index,
        });
        Ok(index)
    }

    /// Change a block's type and language. Content is kept.
    pub async fn change_type(
        &self,
        id: &BlockId,
        block_type: BlockType,
        language: Option<Language>,
    ) -> Result<()> {
        let (session, path) = self.block_context(id)?;
        let lock = self.inner.state().scheduler.flush_lock(id);
        let _serial = lock.lock().await;
        let updated = self
            .inner
            .files
            .change_block_type(&path, id, block_type, language)
            .await?;

        {
            let mut guard = self.inner.state();
            let state = &mut *guard;
            state.ensure_session(session)?;
            let store = state.notebook.as_mut().ok_or(Error::NoNotebook)?;
            store.set_type(id, updated.block_type, updated.language)?;
        }
        self.inner.emit(EngineEvent::BlockChanged {
            block_id: id.clone(),
            block_type: updated.block_type,
            language: updated.language,
        });
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Persistence
    // ---------------------------------------------------------------------

    fn schedule_flush(&self, state: &mut EngineState, id: &BlockId) {
        let weak = Arc::downgrade(&self.inner);
        let session = state.session;
        let block_id = id.clone();
        state.scheduler.mark_dirty(id, move |ticket| async move {
            if let Some(inner) = weak.upgrade() {
                NotebookEngine { inner }
                    .flush_on_timer(session, block_id, ticket)
                    .await;
            }
        });
        debug!("Scheduled save of block {}", id.short());
    }

    async fn flush_on_timer(&self, session: u64, id: BlockId, ticket: u64) {
        {
            let mut state = self.inner.state();
            if state.session != session || !state.scheduler.claim_timer(&id, ticket) {
                return;
            }
        }
        if let Err(e) = self.flush_block(session, &id).await {
            debug!("Timed save of block {} failed: {}", id.short(), e);
        }
    }

    /// Write a dirty block's current content. Returns whether the block is now clean.
    async fn flush_block(&self, session: u64, id: &BlockId) -> Result<bool> {
        let lock = {
            let mut state = self.inner.state();
            state.ensure_session(session)?;
            state.scheduler.flush_lock(id)
        };
        let _serial = lock.lock().await;

        let (path, job) = {
            let state = self.inner.state();
            state.ensure_session(session)?;
            let store = state.store()?;
            match state.scheduler.prepare_flush(id, store) {
                Some(job) => (store.path().to_path_buf(), job),
                None => return Ok(true),
            }
        };

        let encrypted = self.inner.encryption.is_content_encrypted(&job.content);
        let written = async {
            self.inner.files.write_block(&path, id, &job.content).await?;
            if encrypted != job.encrypted {
                self.inner
                    .files
                    .set_block_encrypted(&path, id, encrypted)
                    .await?;
            }
            Ok::<_, Error>(())
        }
        .await;

        if let Err(e) = written {
            warn!("Failed to save block {}: {}", id.short(), e);
            self.inner.emit(EngineEvent::SaveFailed {
                block_id: id.clone(),
                message: e.to_string(),
            });
            return Err(Error::Persist {
                block: id.clone(),
                message: e.to_string(),
            });
        }

        let clean = {
            let mut guard = self.inner.state();
            let state = &mut *guard;
            if state.session != session {
                warn!("Notebook closed while saving block {}", id.short());
                return Ok(false);
            }
            if encrypted != job.encrypted {
                if let Some(store) = state.notebook.as_mut() {
                    if let Err(e) = store.set_encrypted_flag(id, encrypted) {
                        debug!("Skipped encrypted flag of block {}: {}", id.short(), e);
                    }
                }
            }
            state.scheduler.confirm_flushed(id, job.revision)
        };
        info!("Saved block {}", id.short());
        self.inner.emit(EngineEvent::Saved {
            block_id: id.clone(),
        });
        Ok(clean)
    }

    /// Save one block now, bypassing its timer. Clean blocks are not rewritten.
    pub async fn save_block(&self, id: &BlockId) -> Result<()> {
        let session = {
            let mut state = self.inner.state();
            state.block(id)?;
            state.scheduler.cancel_timer(id);
            state.session
        };
        self.flush_block(session, id).await.map(|_| ())
    }

    /// Save every dirty block now.
    ///
    /// All blocks are attempted even if some fail; the first failure is returned.
    pub async fn save_all(&self) -> Result<()> {
        let (session, ids) = {
            let mut guard = self.inner.state();
            let state = &mut *guard;
            let store = state.notebook.as_ref().ok_or(Error::NoNotebook)?;
            let ids = state.scheduler.dirty_ids(store);
            for id in &ids {
                state.scheduler.cancel_timer(id);
            }
            (state.session, ids)
        };
        if ids.is_empty() {
            return Ok(());
        }

        let results = join_all(ids.iter().map(|id| self.flush_block(session, id))).await;
        let mut failures = results.into_iter().filter_map(|r| r.err());
        match failures.next() {
            None => {
                debug!("Saved {} block(s)", ids.len());
                Ok(())
            }
            Some(first) => {
                warn!(
                    "{} of {} block(s) failed to save",
                    failures.count() + 1,
                    ids.len()
                );
                Err(first)
            }
        }
    }

    // ---------------------------------------------------------------------
    // Execution
    // ---------------------------------------------------------------------

    /// Run a code block.
    ///
    /// The block's output slot switches to running before this returns.
    /// Encrypted blocks run their decrypted overlay and cannot run while
    /// hidden. Spawn failures are recorded in the output (stderr and exit code
    /// -1) rather than returned.
    pub async fn run_block(&self, id: &BlockId) -> Result<RunTicket> {
        let (session, run, rx, language, code, working_dir) = {
            let mut guard = self.inner.state();
            let state = &mut *guard;
            let store = state.notebook.as_ref().ok_or(Error::NoNotebook)?;
            let block = store
                .get(id)
                .ok_or_else(|| Error::BlockNotFound(id.clone()))?;
            if block.block_type != BlockType::Code {
                return Err(Error::NotExecutable {
                    block: id.clone(),
                    reason: "markdown blocks cannot run".to_string(),
                });
            }
            let language = block.language.unwrap_or(Language::Text);
            if !language.is_executable() {
                return Err(Error::NotExecutable {
                    block: id.clone(),
                    reason: format!("{} is not an executable language", language),
                });
            }
            let code = if self.inner.encryption.is_content_encrypted(&block.content) {
                state
                    .crypto
                    .overlay(id)
                    .map(str::to_string)
                    .ok_or_else(|| Error::NotExecutable {
                        block: id.clone(),
                        reason: "block is encrypted; decrypt it first".to_string(),
                    })?
            } else {
                block.content.clone()
            };
            let working_dir = store
                .path()
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(Path::to_path_buf)
                .unwrap_or_else(std::env::temp_dir);
            let (run, rx) = state.execution.begin(id)?;
            (state.session, run, rx, language, code, working_dir)
        };
        self.inner.emit(EngineEvent::OutputChanged {
            block_id: id.clone(),
        });

        let vault = self
            .inner
            .config
            .vault_root
            .clone()
            .unwrap_or_else(|| working_dir.clone());
        let interpreter = match self.inner.files.interpreter_settings(&vault).await {
            Ok(settings) => settings.configured(language).map(str::to_string),
            Err(e) => {
                warn!("Could not read interpreter settings: {}", e);
                None
            }
        };

        let request = SpawnRequest {
            language,
            code,
            working_dir,
            interpreter,
        };
        match self.inner.runner.spawn(request).await {
            Ok(process) => self.attach_process(session, id, run, process).await,
            Err(e) => {
                let output = {
                    let mut state = self.inner.state();
                    if state.session == session {
                        state.execution.fail(id, run, &e.to_string())
                    } else {
                        None
                    }
                };
                if output.is_some() {
                    debug!("Block {} failed to start: {}", id.short(), e);
                    self.emit_finished(id, FAILED_EXIT_CODE);
                }
            }
        }

        Ok(RunTicket {
            block_id: id.clone(),
            rx,
        })
    }

    async fn attach_process(&self, session: u64, id: &BlockId, run: u64, process: SpawnedProcess) {
        let attached = {
            let mut state = self.inner.state();
            state.session == session && state.execution.attach(id, run, process.handle)
        };
        if !attached {
            // Terminated or closed while spawning; nobody owns this process.
            debug!("Run of block {} was cancelled during spawn", id.short());
            self.stop_processes(vec![process.handle]).await;
            tokio::spawn(async move {
                let _ = process.exit.await;
            });
            return;
        }

        let engine = self.clone();
        let id = id.clone();
        tokio::spawn(async move {
            engine.drive_process(session, id, run, process).await;
        });
    }

    async fn drive_process(&self, session: u64, id: BlockId, run: u64, mut process: SpawnedProcess) {
        while let Some(chunk) = process.output.recv().await {
            let accepted = {
                let mut state = self.inner.state();
                state.session == session && state.execution.append(&id, run, &chunk)
            };
            if accepted {
                self.inner.emit(EngineEvent::OutputChanged {
                    block_id: id.clone(),
                });
            }
        }

        let exit = process.exit.await;
        let output = {
            let mut state = self.inner.state();
            if state.session != session {
                None
            } else {
                match &exit {
                    Ok(code) => state.execution.finish(&id, run, *code),
                    Err(e) => state.execution.fail(&id, run, &e.to_string()),
                }
            }
        };
        match output {
            Some(output) => {
                let code = output.exit_code.unwrap_or(FAILED_EXIT_CODE);
                debug!("Block {} exited with {}", id.short(), code);
                self.emit_finished(&id, code);
            }
            None => debug!("Ignoring exit of superseded run of block {}", id.short()),
        }
    }

    fn emit_finished(&self, id: &BlockId, exit_code: i32) {
        self.inner.emit(EngineEvent::OutputChanged {
            block_id: id.clone(),
        });
        self.inner.emit(EngineEvent::ExecutionFinished {
            block_id: id.clone(),
            exit_code,
        });
    }

    /// Terminate a block's running process.
    ///
    /// Returns false when nothing was running. Partial output is kept and
    /// `[Terminated]` is appended to stderr.
    pub async fn terminate_block(&self, id: &BlockId) -> Result<bool> {
        let (run, handle) = {
            let mut state = self.inner.state();
            state.block(id)?;
            match state.execution.begin_terminate(id) {
                Some(target) => target,
                None => return Ok(false),
            }
        };

        // A run still spawning has no handle yet; its process is stopped once
        // the spawn notices the run is being terminated.
        let stopped = match handle {
            Some(handle) => self.inner.runner.terminate(handle).await,
            None => true,
        };

        let (output, terminated) = {
            let mut state = self.inner.state();
            if !stopped {
                state.execution.cancel_terminate(id, run);
            }
            let output = if stopped {
                state.execution.mark_terminated(id, run)
            } else {
                None
            };
            let terminated = output.is_some() || state.execution.was_terminated(id, run);
            (output, terminated)
        };
        if !stopped && !terminated {
            warn!("Failed to terminate block {}", id.short());
        }
        // When the exit was handled first, the process driver already
        // settled the run and announced it.
        if let Some(output) = output {
            info!("Terminated block {}", id.short());
            self.emit_finished(id, output.exit_code.unwrap_or(FAILED_EXIT_CODE));
        }
        Ok(terminated)
    }

    /// Clear a block's output. Rejected while the block is running.
    pub fn clear_output(&self, id: &BlockId) -> Result<()> {
        let cleared = {
            let mut state = self.inner.state();
            state.block(id)?;
            state.execution.clear_output(id)?
        };
        if cleared {
            self.inner.emit(EngineEvent::OutputChanged {
                block_id: id.clone(),
            });
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Encryption
    // ---------------------------------------------------------------------

    /// Make sure the encryption service is unlocked for an operation on `id`.
    ///
    /// When a password is needed the operation is recorded as pending, a
    /// `PasswordRequired` event is emitted and the `EncryptionLocked` error is
    /// returned. [`supply_password`](Self::supply_password) resumes it.
    async fn unlock_or_request(&self, id: &BlockId, intent: PasswordIntent) -> Result<()> {
        self.inner.state().block(id)?;
        match ensure_unlocked(self.inner.encryption.as_ref()).await {
            Ok(()) => Ok(()),
            Err(e) if e.needs_password() => {
                self.inner.state().crypto.set_pending(id, intent);
                debug!("Waiting for password to {} block {}", intent, id.short());
                self.inner.emit(EngineEvent::PasswordRequired {
                    block_id: id.clone(),
                    intent,
                });
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Encrypt a plaintext block in place and schedule it for saving.
    pub async fn encrypt_block(&self, id: &BlockId) -> Result<()> {
        self.unlock_or_request(id, PasswordIntent::Encrypt).await?;

        let (session, plaintext) = {
            let state = self.inner.state();
            let block = state.block(id)?;
            let plaintext = state
                .crypto
                .encrypt_source(block, self.inner.encryption.as_ref())?;
            (state.session, plaintext)
        };

        let ciphertext = self.inner.encryption.encrypt(&plaintext).await?;

        {
            let mut guard = self.inner.state();
            let state = &mut *guard;
            state.ensure_session(session)?;
            let store = state.notebook.as_mut().ok_or(Error::NoNotebook)?;
            let current = store
                .get(id)
                .ok_or_else(|| Error::BlockNotFound(id.clone()))?;
            if current.content != plaintext {
                return Err(changed_during(id));
            }
            store.set_content(id, &ciphertext)?;
            state.crypto.clear_overlay(id);
            self.schedule_flush(state, id);
        }
        info!("Encrypted block {}", id.short());
        self.emit_encryption(id, EncryptionState::Hidden);
        Ok(())
    }

    /// Show an encrypted block's plaintext in a transient overlay.
    ///
    /// Stored content is not touched.
    pub async fn decrypt_block(&self, id: &BlockId) -> Result<()> {
        self.unlock_or_request(id, PasswordIntent::Decrypt).await?;

        let (session, ciphertext) = {
            let state = self.inner.state();
            if state.crypto.has_overlay(id) {
                return Ok(());
            }
            let block = state.block(id)?;
            let ciphertext = state
                .crypto
                .decrypt_source(block, self.inner.encryption.as_ref())?;
            (state.session, ciphertext)
        };

        let plaintext = self.inner.encryption.decrypt(&ciphertext).await?;

        {
            let mut state = self.inner.state();
            state.ensure_session(session)?;
            if state.block(id)?.content != ciphertext {
                return Err(changed_during(id));
            }
            state.crypto.set_overlay(id, plaintext);
        }
        debug!("Decrypted block {} for viewing", id.short());
        self.emit_encryption(id, EncryptionState::Visible);
        Ok(())
    }

    /// Re-encrypt a visible overlay (including edits made to it) and hide it.
    pub async fn hide_block(&self, id: &BlockId) -> Result<()> {
        self.unlock_or_request(id, PasswordIntent::Hide).await?;

        let (session, plaintext) = {
            let state = self.inner.state();
            state.block(id)?;
            (state.session, state.crypto.hide_source(id)?)
        };

        let ciphertext = self.inner.encryption.encrypt(&plaintext).await?;

        {
            let mut guard = self.inner.state();
            let state = &mut *guard;
            state.ensure_session(session)?;
            if state.crypto.overlay(id) != Some(plaintext.as_str()) {
                return Err(changed_during(id));
            }
            let store = state.notebook.as_mut().ok_or(Error::NoNotebook)?;
            if store.set_content(id, &ciphertext)? {
                self.schedule_flush(state, id);
            }
            state.crypto.clear_overlay(id);
        }
        info!("Re-encrypted block {}", id.short());
        self.emit_encryption(id, EncryptionState::Hidden);
        Ok(())
    }

    /// Store an encrypted block's plaintext permanently.
    ///
    /// Uses the visible overlay when present, otherwise decrypts first.
    pub async fn remove_block_encryption(&self, id: &BlockId) -> Result<()> {
        let (session, overlay, content) = {
            let state = self.inner.state();
            let block = state.block(id)?;
            (
                state.session,
                state.crypto.overlay(id).map(str::to_string),
                block.content.clone(),
            )
        };

        let plaintext = match &overlay {
            Some(plaintext) => plaintext.clone(),
            None => {
                if !self.inner.encryption.is_content_encrypted(&content) {
                    return Err(Error::InvalidOperation(format!(
                        "block {} is not encrypted",
                        id.short()
                    )));
                }
                self.unlock_or_request(id, PasswordIntent::RemoveEncryption)
                    .await?;
                self.inner.encryption.decrypt(&content).await?
            }
        };

        {
            let mut guard = self.inner.state();
            let state = &mut *guard;
            state.ensure_session(session)?;
            let unchanged = state.crypto.overlay(id) == overlay.as_deref()
                && state.block(id)?.content == content;
            if !unchanged {
                return Err(changed_during(id));
            }
            let store = state.notebook.as_mut().ok_or(Error::NoNotebook)?;
            if store.set_content(id, &plaintext)? {
                self.schedule_flush(state, id);
            }
            state.crypto.clear_overlay(id);
        }
        info!("Removed encryption from block {}", id.short());
        self.emit_encryption(id, EncryptionState::Plain);
        Ok(())
    }

    fn emit_encryption(&self, id: &BlockId, state: EncryptionState) {
        self.inner.emit(EngineEvent::ContentChanged {
            block_id: id.clone(),
        });
        self.inner.emit(EngineEvent::EncryptionChanged {
            block_id: id.clone(),
            state,
        });
    }

    /// Unlock with a password and resume the pending encryption operation.
    ///
    /// On a wrong password the request stays pending so the user can retry.
    pub async fn supply_password(&self, password: &str) -> Result<()> {
        let pending = self.inner.state().crypto.take_pending();

        if let Err(e) = self.inner.encryption.unlock_with_password(password).await {
            if let Some(request) = pending {
                let mut state = self.inner.state();
                if state.crypto.pending().is_none() {
                    state.crypto.set_pending(&request.block_id, request.intent);
                }
            }
            return Err(e);
        }

        let Some(request) = pending else {
            return Ok(());
        };
        debug!(
            "Resuming {} of block {} after password",
            request.intent,
            request.block_id.short()
        );
        let id = &request.block_id;
        match request.intent {
            PasswordIntent::Encrypt => self.encrypt_block(id).await,
            PasswordIntent::Decrypt => self.decrypt_block(id).await,
            PasswordIntent::Hide => self.hide_block(id).await,
            PasswordIntent::RemoveEncryption => self.remove_block_encryption(id).await,
        }
    }

    /// Abandon the pending password request.
    pub fn cancel_password_request(&self) -> Option<PendingPasswordRequest> {
        self.inner.state().crypto.take_pending()
    }

    /// Lock the encryption service. Visible overlays stay until hidden or closed.
    pub async fn lock_encryption(&self) {
        self.inner.encryption.lock().await;
    }

    // ---------------------------------------------------------------------
    // Views
    // ---------------------------------------------------------------------

    pub fn is_open(&self) -> bool {
        self.inner.state().notebook.is_some()
    }

    pub fn notebook_path(&self) -> Option<PathBuf> {
        self.inner
            .state()
            .notebook
            .as_ref()
            .map(|s| s.path().to_path_buf())
    }

    pub fn notebook_name(&self) -> Option<String> {
        self.inner
            .state()
            .notebook
            .as_ref()
            .map(|s| s.name().to_string())
    }

    /// All blocks in document order, with stored (possibly encrypted) content.
    pub fn blocks(&self) -> Vec<Block> {
        self.inner
            .state()
            .notebook
            .as_ref()
            .map(|s| s.all().to_vec())
            .unwrap_or_default()
    }

    pub fn get_block(&self, id: &BlockId) -> Option<Block> {
        self.inner.state().block(id).ok().cloned()
    }

    /// What the editor should show: the overlay when visible, else stored content.
    pub fn display_content(&self, id: &BlockId) -> Option<String> {
        let state = self.inner.state();
        let block = state.block(id).ok()?;
        Some(state.crypto.display_content(block).to_string())
    }

    /// Whether stored content is ciphertext, judged by content alone.
    pub fn is_encrypted(&self, id: &BlockId) -> bool {
        self.inner
            .state()
            .block(id)
            .is_ok_and(|b| self.inner.encryption.is_content_encrypted(&b.content))
    }

    pub fn encryption_state(&self, id: &BlockId) -> Option<EncryptionState> {
        let state = self.inner.state();
        let block = state.block(id).ok()?;
        Some(state.crypto.state(block, self.inner.encryption.as_ref()))
    }

    pub fn is_dirty(&self, id: &BlockId) -> bool {
        self.inner.state().scheduler.is_dirty(id)
    }

    /// Dirty blocks in document order.
    pub fn dirty_blocks(&self) -> Vec<BlockId> {
        let state = self.inner.state();
        match state.notebook.as_ref() {
            Some(store) => state.scheduler.dirty_ids(store),
            None => Vec::new(),
        }
    }

    pub fn get_output(&self, id: &BlockId) -> Option<BlockOutput> {
        self.inner.state().execution.output(id).cloned()
    }

    pub fn execution_status(&self, id: &BlockId) -> ExecutionStatus {
        self.inner.state().execution.status(id)
    }

    pub fn pending_password_request(&self) -> Option<PendingPasswordRequest> {
        self.inner.state().crypto.pending().cloned()
    }
}

fn changed_during(id: &BlockId) -> Error {
    Error::InvalidOperation(format!(
        "block {} changed while the operation was in flight",
        id.short()
    ))
}
