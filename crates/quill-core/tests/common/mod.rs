//! Scriptable collaborators shared by the engine integration tests.

#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use quill_core::{
    EncryptionService, EngineConfig, Error, MemoryFileStore, NotebookEngine, OutputChunk,
    ProcessHandle, ProcessRunner, Result, SpawnRequest, SpawnedProcess, UnlockError,
};
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, oneshot};

pub const PASSWORD: &str = "correct horse";

/// Encryption that reverses text inside an `ENC[...]` wrapper.
#[derive(Debug, Default)]
pub struct FakeCipher {
    unlocked: AtomicBool,
    stored_credentials: AtomicBool,
    pub encrypt_calls: AtomicUsize,
}

impl FakeCipher {
    /// A locked service with no stored credentials.
    pub fn locked() -> Self {
        Self::default()
    }

    /// A locked service that auto-unlocks from stored credentials.
    pub fn with_stored_credentials() -> Self {
        let cipher = Self::default();
        cipher.stored_credentials.store(true, Ordering::SeqCst);
        cipher
    }

    pub fn seal(plaintext: &str) -> String {
        format!("ENC[{}]", plaintext.chars().rev().collect::<String>())
    }
}

#[async_trait]
impl EncryptionService for FakeCipher {
    fn is_content_encrypted(&self, content: &str) -> bool {
        content.trim().starts_with("ENC[")
    }

    fn is_unlocked(&self) -> bool {
        self.unlocked.load(Ordering::SeqCst)
    }

    async fn try_auto_unlock(&self) -> std::result::Result<(), UnlockError> {
        if self.stored_credentials.load(Ordering::SeqCst) {
            self.unlocked.store(true, Ordering::SeqCst);
            Ok(())
        } else {
            Err(UnlockError::NeedsPassword)
        }
    }

    async fn unlock_with_password(&self, password: &str) -> Result<()> {
        if password != PASSWORD {
            return Err(Error::Encryption("invalid password".to_string()));
        }
        self.unlocked.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn lock(&self) {
        self.unlocked.store(false, Ordering::SeqCst);
    }

    async fn encrypt(&self, plaintext: &str) -> Result<String> {
        if !self.is_unlocked() {
            return Err(Error::EncryptionLocked {
                needs_password: true,
                message: "locked".to_string(),
            });
        }
        self.encrypt_calls.fetch_add(1, Ordering::SeqCst);
        Ok(Self::seal(plaintext))
    }

    async fn decrypt(&self, ciphertext: &str) -> Result<String> {
        if !self.is_unlocked() {
            return Err(Error::EncryptionLocked {
                needs_password: true,
                message: "locked".to_string(),
            });
        }
        let inner = ciphertext
            .trim()
            .strip_prefix("ENC[")
            .and_then(|s| s.strip_suffix(']'))
            .ok_or_else(|| Error::Encryption("not encrypted".to_string()))?;
        Ok(inner.chars().rev().collect())
    }
}

/// Process runner driven by the block's code:
///
/// - `fail-spawn` fails to spawn
/// - `hang` prints `started` and runs until terminated
/// - `exit:N` exits with code N
/// - anything else is echoed to stdout and exits 0
#[derive(Debug, Default)]
pub struct ScriptedRunner {
    next: AtomicU64,
    kills: Mutex<FxHashMap<u64, oneshot::Sender<()>>>,
    pub requests: Mutex<Vec<SpawnRequest>>,
    /// Keep `terminate` from returning until well after the kill lands.
    pub slow_terminate: AtomicBool,
}

impl ScriptedRunner {
    pub fn live(&self) -> usize {
        self.kills.lock().unwrap().len()
    }
}

#[async_trait]
impl ProcessRunner for ScriptedRunner {
    async fn spawn(&self, request: SpawnRequest) -> Result<SpawnedProcess> {
        self.requests.lock().unwrap().push(request.clone());
        if request.code == "fail-spawn" {
            return Err(Error::Execution("interpreter not found: fake".to_string()));
        }

        let handle = ProcessHandle(self.next.fetch_add(1, Ordering::SeqCst) + 1);
        let (tx, rx) = mpsc::unbounded_channel();

        let exit: futures::future::BoxFuture<'static, Result<Option<i32>>> =
            if request.code == "hang" {
                tx.send(OutputChunk::stdout("started\n")).unwrap();
                let (kill_tx, kill_rx) = oneshot::channel();
                self.kills.lock().unwrap().insert(handle.0, kill_tx);
                Box::pin(async move {
                    let _ = kill_rx.await;
                    Ok(None)
                })
            } else if let Some(code) = request.code.strip_prefix("exit:") {
                let code: i32 = code.parse().unwrap();
                tx.send(OutputChunk::stderr(format!("exiting with {}\n", code)))
                    .unwrap();
                Box::pin(async move { Ok(Some(code)) })
            } else {
                tx.send(OutputChunk::stdout(format!("{}\n", request.code)))
                    .unwrap();
                Box::pin(async move { Ok(Some(0)) })
            };
        drop(tx);

        Ok(SpawnedProcess {
            handle,
            output: rx,
            exit,
        })
    }

    async fn terminate(&self, handle: ProcessHandle) -> bool {
        let kill = self.kills.lock().unwrap().remove(&handle.0);
        let Some(kill) = kill else {
            return false;
        };
        let sent = kill.send(()).is_ok();
        if self.slow_terminate.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        sent
    }
}

pub struct Harness {
    pub engine: NotebookEngine,
    pub files: Arc<MemoryFileStore>,
    pub cipher: Arc<FakeCipher>,
    pub runner: Arc<ScriptedRunner>,
}

pub fn harness(cipher: FakeCipher) -> Harness {
    harness_with_delay(cipher, Duration::from_millis(1500))
}

pub fn harness_with_delay(cipher: FakeCipher, save_delay: Duration) -> Harness {
    let files = Arc::new(MemoryFileStore::new());
    let cipher = Arc::new(cipher);
    let runner = Arc::new(ScriptedRunner::default());
    let engine = NotebookEngine::new(
        files.clone(),
        cipher.clone(),
        runner.clone(),
        EngineConfig {
            save_delay,
            ..Default::default()
        },
    );
    Harness {
        engine,
        files,
        cipher,
        runner,
    }
}

pub fn notebook_path() -> &'static Path {
    Path::new("/vault/Scratch.md")
}
