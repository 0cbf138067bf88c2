use std::path::{Path, PathBuf};

use notify::RecursiveMode;
use notify_debouncer_full::{new_debouncer, DebounceEventResult, Debouncer, RecommendedCache};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::engine::DocumentEngine;
use crate::error::{EngineError, EngineResult};
use crate::models::SOURCE_WEBDAV;

/// Recursive DATA_DIR watcher. notify's debouncer provides the stability
/// window (partial writes are not reported); the coordinator's per-path
/// debounce then coalesces bursts, and its recently-written map filters out
/// the engine's own disk activity.
pub struct VaultWatcher {
    // Held for its Drop: dropping stops the underlying notify watcher.
    _debouncer: Debouncer<notify::RecommendedWatcher, RecommendedCache>,
    handle: tokio::task::JoinHandle<()>,
}

impl VaultWatcher {
    pub fn spawn(engine: DocumentEngine) -> EngineResult<Self> {
        let data_dir = engine.config().data_dir.clone();
        let stability = engine.config().watch_stability;

        let (tx, rx) = mpsc::unbounded_channel();
        let mut debouncer = new_debouncer(stability, None, move |result: DebounceEventResult| {
            let _ = tx.send(result);
        })
        .map_err(|err| EngineError::Upstream(format!("failed to create watcher: {err}")))?;

        std::fs::create_dir_all(&data_dir)
            .map_err(|err| EngineError::Upstream(format!("failed to create data dir: {err}")))?;
        debouncer
            .watch(&data_dir, RecursiveMode::Recursive)
            .map_err(|err| {
                EngineError::Upstream(format!("failed to watch {}: {err}", data_dir.display()))
            })?;

        info!(data_dir = %data_dir.display(), "filesystem watcher started");
        let handle = tokio::spawn(event_loop(engine, data_dir, rx));

        Ok(Self {
            _debouncer: debouncer,
            handle,
        })
    }

    pub fn shutdown(self) {
        self.handle.abort();
    }
}

async fn event_loop(
    engine: DocumentEngine,
    data_dir: PathBuf,
    mut rx: mpsc::UnboundedReceiver<DebounceEventResult>,
) {
    while let Some(result) = rx.recv().await {
        let events = match result {
            Ok(events) => events,
            Err(errors) => {
                for err in errors {
                    warn!(error = %err, "watch error");
                }
                continue;
            }
        };
        for event in events {
            for path in &event.paths {
                if !watchable(&data_dir, path) {
                    continue;
                }
                schedule(&engine, path.clone());
            }
        }
    }
}

/// Per-path debounce; the handler itself decides add/change vs unlink from
/// the state of the filesystem at fire time.
fn schedule(engine: &DocumentEngine, abs: PathBuf) {
    let coordinator = engine.coordinator().clone();
    let engine = engine.clone();
    let key = abs.clone();
    coordinator.debounce(key, async move {
        handle_event(&engine, &abs).await;
    });
}

async fn handle_event(engine: &DocumentEngine, abs: &Path) {
    if engine.coordinator().consume_written(abs) {
        debug!(path = %abs.display(), "ignoring engine-originated event");
        return;
    }

    let Some((user_id, slug, doc_path)) = parse_data_path(&engine.config().data_dir, abs) else {
        return;
    };

    let vault = match engine.load_vault_by_slug(user_id, &slug) {
        Ok(vault) => vault,
        // Vault may be mid-delete; nothing to sync against.
        Err(EngineError::NotFound) => return,
        Err(err) => {
            warn!(error = %err, path = %abs.display(), "failed to resolve vault for event");
            return;
        }
    };

    if abs.is_file() {
        let content = match tokio::fs::read(abs).await {
            Ok(bytes) => match String::from_utf8(bytes) {
                Ok(content) => content,
                Err(_) => {
                    warn!(path = %abs.display(), "ignoring non-UTF-8 file");
                    return;
                }
            },
            Err(err) => {
                warn!(error = %err, path = %abs.display(), "failed to read changed file");
                return;
            }
        };
        match engine
            .put_in_vault(user_id, &vault, &doc_path, &content, SOURCE_WEBDAV)
            .await
        {
            Ok((_, true)) => info!(vault = %slug, path = %doc_path, "synced external change"),
            Ok((_, false)) => {}
            Err(err) => warn!(error = %err, path = %doc_path, "failed to sync external change"),
        }
    } else {
        match engine.delete_row(vault.id, &doc_path) {
            Ok(0) => {}
            Ok(_) => info!(vault = %slug, path = %doc_path, "removed document for deleted file"),
            Err(err) => warn!(error = %err, path = %doc_path, "failed to remove document row"),
        }
    }
}

/// Only plain `.md` files below `DATA_DIR` are synced: no dotfiles or
/// dot-directories (`.obsidian` stays client-private), no `.tmp-*`
/// atomic-write leftovers.
fn watchable(data_dir: &Path, abs: &Path) -> bool {
    let Ok(rel) = abs.strip_prefix(data_dir) else {
        return false;
    };
    for component in rel.components() {
        let Some(name) = component.as_os_str().to_str() else {
            return false;
        };
        if name.starts_with('.') {
            return false;
        }
    }
    abs.extension().and_then(|e| e.to_str()) == Some("md")
}

/// `DATA_DIR/{userId}/{vaultSlug}/{docPath…}` → its three parts.
fn parse_data_path(data_dir: &Path, abs: &Path) -> Option<(Uuid, String, String)> {
    let rel = abs.strip_prefix(data_dir).ok()?;
    let mut components = rel.components().filter_map(|c| c.as_os_str().to_str());
    let user_id = Uuid::parse_str(components.next()?).ok()?;
    let slug = components.next()?.to_string();
    let doc_path = components.collect::<Vec<_>>().join("/");
    if doc_path.is_empty() {
        return None;
    }
    Some((user_id, slug, doc_path))
}
