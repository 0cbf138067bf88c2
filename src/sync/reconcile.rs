use std::collections::HashSet;
use std::time::Duration;

use tracing::{info, warn};
use uuid::Uuid;

use crate::engine::{vault_root, DocumentEngine};
use crate::error::EngineResult;
use crate::fs;
use crate::models::SOURCE_WEBDAV;

#[derive(Debug, Default, Clone, Copy)]
pub struct ReconcileStats {
    pub vaults: usize,
    pub synced: usize,
    pub removed: usize,
}

/// Full disk-vs-database sweep. Disk is the source of truth: files missing
/// a row get one (through the engine, so hashes short-circuit unchanged
/// content), rows missing a file are dropped. One pass over a drift-free
/// tree is a no-op, which is what makes the sweep safe to run on a timer.
pub async fn reconcile_all(engine: &DocumentEngine) -> EngineResult<ReconcileStats> {
    let data_dir = engine.config().data_dir.clone();
    let mut stats = ReconcileStats::default();

    let user_dirs = match std::fs::read_dir(&data_dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(stats),
        Err(err) => return Err(err.into()),
    };

    for user_entry in user_dirs.flatten() {
        if !user_entry.path().is_dir() {
            continue;
        }
        let Some(name) = user_entry.file_name().to_str().map(str::to_owned) else {
            continue;
        };
        let Ok(user_id) = Uuid::parse_str(&name) else {
            continue;
        };
        if !engine.user_exists(user_id)? {
            continue;
        }

        let Ok(vault_dirs) = std::fs::read_dir(user_entry.path()) else {
            continue;
        };
        for vault_entry in vault_dirs.flatten() {
            if !vault_entry.path().is_dir() {
                continue;
            }
            let Some(slug) = vault_entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            let vault = match engine.load_vault_by_slug(user_id, &slug) {
                Ok(vault) => vault,
                Err(_) => continue,
            };

            stats.vaults += 1;
            if let Err(err) = reconcile_vault(engine, user_id, &vault, &mut stats).await {
                // A vault deleted mid-scan lands here; the next pass sees
                // the final state.
                warn!(error = %err, %slug, "vault reconciliation aborted");
            }
        }
    }

    info!(
        vaults = stats.vaults,
        synced = stats.synced,
        removed = stats.removed,
        "reconciliation pass complete"
    );
    Ok(stats)
}

async fn reconcile_vault(
    engine: &DocumentEngine,
    user_id: Uuid,
    vault: &crate::models::Vault,
    stats: &mut ReconcileStats,
) -> EngineResult<()> {
    let root = vault_root(&engine.config().data_dir, user_id, &vault.slug);
    let disk_paths = fs::list_markdown_files(&root)?;
    let disk_set: HashSet<&str> = disk_paths.iter().map(String::as_str).collect();

    for rel in &disk_paths {
        let bytes = fs::read_file(&root, rel).await?;
        let Ok(content) = String::from_utf8(bytes) else {
            warn!(path = %rel, "skipping non-UTF-8 file during reconcile");
            continue;
        };
        let (_, changed) = engine
            .put_in_vault(user_id, vault, rel, &content, SOURCE_WEBDAV)
            .await?;
        if changed {
            stats.synced += 1;
        }
    }

    let db_docs = engine.list(user_id, vault.id, None)?;
    for doc in db_docs {
        if !disk_set.contains(doc.path.as_str()) {
            engine.delete_row(vault.id, &doc.path)?;
            stats.removed += 1;
        }
    }

    Ok(())
}

/// Startup pass plus a fixed-interval loop; errors are logged, never fatal.
pub async fn run_periodic(engine: DocumentEngine, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if let Err(err) = reconcile_all(&engine).await {
            warn!(error = %err, "reconciliation pass failed");
        }
    }
}
