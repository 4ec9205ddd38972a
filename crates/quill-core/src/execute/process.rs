//! OS-process runner.
//!
//! Runs `<interpreter> <flag> <code>` with piped output. On Unix the child is
//! placed in its own process group so termination also reaches anything the
//! script started.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use super::{
    InterpreterSettings, OutputChunk, OutputStream, ProcessHandle, ProcessRunner, SpawnRequest,
    SpawnedProcess,
};
use crate::error::{Error, Result};

const READ_BUFFER_SIZE: usize = 4096;

/// A process that has not exited yet.
#[derive(Debug)]
struct Live {
    pid: Option<u32>,
    kill: Option<oneshot::Sender<()>>,
}

/// `ProcessRunner` backed by `tokio::process`.
#[derive(Debug, Clone, Default)]
pub struct CommandRunner {
    live: Arc<Mutex<FxHashMap<u64, Live>>>,
    next_handle: Arc<AtomicU64>,
}

impl CommandRunner {
    pub fn new() -> Self {
        Self::default()
    }

    fn live(&self) -> MutexGuard<'_, FxHashMap<u64, Live>> {
        self.live.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of processes spawned by this runner that are still alive.
    pub fn live_count(&self) -> usize {
        self.live().len()
    }
}

/// Find the interpreter executable: explicit paths are used as-is, bare names
/// are looked up on `PATH`.
fn resolve_interpreter(name: &str) -> Result<PathBuf> {
    let candidate = Path::new(name);
    if candidate.components().count() > 1 {
        if candidate.exists() {
            return Ok(candidate.to_path_buf());
        }
        return Err(Error::Execution(format!("interpreter not found: {}", name)));
    }
    which::which(name).map_err(|_| Error::Execution(format!("interpreter not found: {}", name)))
}

/// Decode as much of `pending` as forms complete UTF-8, leaving a trailing
/// partial sequence for the next read. Invalid bytes are replaced.
fn decode_available(pending: &mut Vec<u8>) -> String {
    let mut out = String::new();
    loop {
        match std::str::from_utf8(pending) {
            Ok(s) => {
                out.push_str(s);
                pending.clear();
                return out;
            }
            Err(e) => {
                let valid = e.valid_up_to();
                out.push_str(&String::from_utf8_lossy(&pending[..valid]));
                match e.error_len() {
                    Some(bad) => {
                        out.push(char::REPLACEMENT_CHARACTER);
                        pending.drain(..valid + bad);
                    }
                    None => {
                        pending.drain(..valid);
                        return out;
                    }
                }
            }
        }
    }
}

/// Forward a pipe to the output channel until end of file.
async fn pump<R>(mut reader: R, stream: OutputStream, tx: mpsc::UnboundedSender<OutputChunk>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; READ_BUFFER_SIZE];
    let mut pending = Vec::new();
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                pending.extend_from_slice(&buf[..n]);
                let text = decode_available(&mut pending);
                if !text.is_empty() && tx.send(OutputChunk { stream, text }).is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!("Output pipe closed with error: {}", e);
                break;
            }
        }
    }
    if !pending.is_empty() {
        let _ = tx.send(OutputChunk {
            stream,
            text: String::from_utf8_lossy(&pending).into_owned(),
        });
    }
}

#[cfg(unix)]
fn signal_group(pid: u32) -> bool {
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    // SAFETY: kill(2) has no memory-safety preconditions.
    unsafe { libc::kill(-pid, libc::SIGTERM) == 0 || libc::kill(pid, libc::SIGTERM) == 0 }
}

#[async_trait]
impl ProcessRunner for CommandRunner {
    async fn spawn(&self, request: SpawnRequest) -> Result<SpawnedProcess> {
        let language = request.language;
        let flag = InterpreterSettings::script_flag(language).ok_or_else(|| {
            Error::Execution(format!("{} blocks cannot be executed", language))
        })?;
        let interpreter = match request.interpreter {
            Some(path) => path,
            None => InterpreterSettings::default_for(language)
                .map(str::to_string)
                .ok_or_else(|| Error::Execution(format!("no interpreter for {}", language)))?,
        };
        let program = resolve_interpreter(&interpreter)?;

        let mut cmd = Command::new(&program);
        cmd.arg(flag)
            .arg(&request.code)
            .current_dir(&request.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|e| {
            Error::Execution(format!("failed to start {}: {}", program.display(), e))
        })?;

        let handle = ProcessHandle(self.next_handle.fetch_add(1, Ordering::SeqCst) + 1);
        let pid = child.id();
        let (kill_tx, mut kill_rx) = oneshot::channel();
        self.live().insert(
            handle.0,
            Live {
                pid,
                kill: Some(kill_tx),
            },
        );
        debug!(
            "Spawned {} for {} block as {} (pid {:?})",
            program.display(),
            language,
            handle,
            pid
        );

        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump(stdout, OutputStream::Stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump(stderr, OutputStream::Stderr, tx));
        }

        let live = self.live.clone();
        let exit = Box::pin(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                Ok(()) = &mut kill_rx => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            };
            live.lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&handle.0);
            let status = status?;
            debug!("{} exited with {}", handle, status);
            Ok::<_, Error>(status.code())
        });

        Ok(SpawnedProcess {
            handle,
            output: rx,
            exit,
        })
    }

    async fn terminate(&self, handle: ProcessHandle) -> bool {
        let mut live = self.live();
        let Some(entry) = live.get_mut(&handle.0) else {
            return false;
        };

        #[cfg(unix)]
        if let Some(pid) = entry.pid {
            if signal_group(pid) {
                debug!("Sent SIGTERM to {} (pid {})", handle, pid);
                return true;
            }
            warn!("Failed to signal {} (pid {})", handle, pid);
        }

        match entry.kill.take() {
            Some(kill) => kill.send(()).is_ok(),
            None => false,
        }
    }
}
