//! File watcher for detecting notebook changes made outside the engine.
//!
//! Watches a notebook directory and reports changes to block files and the
//! index. Temporary files from atomic writes are ignored.

use std::path::{Path, PathBuf};
use std::time::Duration;

use notify_debouncer_mini::{DebounceEventResult, new_debouncer, notify::RecursiveMode};
use tokio::sync::mpsc;

use crate::error::{VaultError, VaultResult};
use crate::index::INDEX_FILE;

const DEBOUNCE: Duration = Duration::from_millis(200);

/// File change event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileEvent {
    /// File was created or modified.
    Modified(PathBuf),
    /// File was removed.
    Removed(PathBuf),
}

impl FileEvent {
    pub fn path(&self) -> &Path {
        match self {
            FileEvent::Modified(p) | FileEvent::Removed(p) => p,
        }
    }
}

/// Whether a changed path is part of the notebook's persisted state.
fn is_tracked(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    if name.ends_with(".tmp") || name.ends_with('~') {
        return false;
    }
    name == INDEX_FILE || !name.starts_with('.')
}

/// File watcher handle.
pub struct FileWatcher {
    /// Debouncer handle (kept alive to maintain watcher).
    _debouncer: notify_debouncer_mini::Debouncer<notify::RecommendedWatcher>,
    /// Receiver for file events.
    rx: mpsc::UnboundedReceiver<FileEvent>,
}

impl FileWatcher {
    /// Watch a notebook directory.
    pub fn new(notebook: impl AsRef<Path>) -> VaultResult<Self> {
        let notebook = notebook.as_ref().to_path_buf();
        if !notebook.is_dir() {
            return Err(VaultError::NotANotebook(notebook));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let mut debouncer = new_debouncer(DEBOUNCE, move |result: DebounceEventResult| {
            let events = match result {
                Ok(events) => events,
                Err(e) => {
                    tracing::warn!("File watch error: {}", e);
                    return;
                }
            };
            for event in events {
                let path = event.path;
                if !is_tracked(&path) {
                    continue;
                }
                let file_event = if path.exists() {
                    FileEvent::Modified(path)
                } else {
                    FileEvent::Removed(path)
                };
                let _ = tx.send(file_event);
            }
        })
        .map_err(|e| VaultError::Watch(e.to_string()))?;

        debouncer
            .watcher()
            .watch(&notebook, RecursiveMode::NonRecursive)
            .map_err(|e| VaultError::Watch(e.to_string()))?;

        tracing::debug!("Watching {}", notebook.display());
        Ok(Self {
            _debouncer: debouncer,
            rx,
        })
    }

    /// Receive the next file event.
    pub async fn recv(&mut self) -> Option<FileEvent> {
        self.rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_tracked_paths() {
        assert!(is_tracked(Path::new("/n.md/abc.py")));
        assert!(is_tracked(Path::new("/n.md/.index.json")));
        assert!(!is_tracked(Path::new("/n.md/.index.json.tmp")));
        assert!(!is_tracked(Path::new("/n.md/.DS_Store")));
        assert!(!is_tracked(Path::new("/n.md/abc.py~")));
    }

    #[tokio::test]
    async fn test_watcher_creation() {
        let temp = TempDir::new().unwrap();
        let notebook = temp.path().join("test.md");
        fs::create_dir(&notebook).unwrap();

        assert!(FileWatcher::new(&notebook).is_ok());
        assert!(FileWatcher::new(temp.path().join("missing.md")).is_err());
    }

    #[tokio::test]
    async fn test_reports_block_file_changes() {
        let temp = TempDir::new().unwrap();
        let notebook = temp.path().join("test.md");
        fs::create_dir(&notebook).unwrap();
        let mut watcher = FileWatcher::new(&notebook).unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        fs::write(notebook.join("abc.sh"), "echo hi").unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), watcher.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            event.path().file_name().and_then(|n| n.to_str()),
            Some("abc.sh")
        );
    }
}
