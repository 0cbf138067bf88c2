use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;

pub mod reconcile;
pub mod watcher;

pub const DEFAULT_RECENTLY_WRITTEN_TTL: Duration = Duration::from_secs(5);
pub const DEFAULT_DEBOUNCE_WINDOW: Duration = Duration::from_millis(500);

/// Process-wide coordination between the document engine and the filesystem
/// watcher. Engine-originating disk writes are marked here *before* the
/// writer yields, so the watcher can tell the engine's own renames apart
/// from external edits and drop them instead of replaying them.
pub struct SyncCoordinator {
    recently_written: Mutex<HashMap<PathBuf, Instant>>,
    debounce: Mutex<HashMap<PathBuf, JoinHandle<()>>>,
    ttl: Duration,
    window: Duration,
}

impl SyncCoordinator {
    pub fn new(ttl: Duration, window: Duration) -> Self {
        Self {
            recently_written: Mutex::new(HashMap::new()),
            debounce: Mutex::new(HashMap::new()),
            ttl,
            window,
        }
    }

    pub fn debounce_window(&self) -> Duration {
        self.window
    }

    /// Record that the engine itself just mutated `abs`. Synchronous: the
    /// marker is visible before the caller reaches its next await point.
    pub fn mark_written(&self, abs: &Path) {
        let mut map = self.recently_written.lock().expect("coordinator lock");
        map.insert(abs.to_path_buf(), Instant::now());
    }

    /// Single-consumption check used by the watcher: returns true (and
    /// clears the marker) when `abs` was written by the engine within the
    /// TTL. Stale markers count as absent.
    pub fn consume_written(&self, abs: &Path) -> bool {
        let mut map = self.recently_written.lock().expect("coordinator lock");
        match map.remove(abs) {
            Some(marked) => marked.elapsed() <= self.ttl,
            None => false,
        }
    }

    /// Schedule `action` to run after the debounce window of quiescence for
    /// `abs`. A newer event for the same path replaces (aborts) the pending
    /// one, so only the final event of a burst is processed.
    pub fn debounce<F>(&self, abs: PathBuf, action: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let window = self.window;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(window).await;
            action.await;
        });

        let mut map = self.debounce.lock().expect("coordinator lock");
        if let Some(previous) = map.insert(abs, handle) {
            previous.abort();
        }
    }

    /// Cancel every pending debounce callback. Called on teardown.
    pub fn shutdown(&self) {
        let mut map = self.debounce.lock().expect("coordinator lock");
        for (_, handle) in map.drain() {
            handle.abort();
        }
    }
}

impl Default for SyncCoordinator {
    fn default() -> Self {
        Self::new(DEFAULT_RECENTLY_WRITTEN_TTL, DEFAULT_DEBOUNCE_WINDOW)
    }
}

impl Drop for SyncCoordinator {
    fn drop(&mut self) {
        self.shutdown();
    }
}
