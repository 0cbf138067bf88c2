use std::sync::Arc;

use anyhow::Result;
use tracing_subscriber::EnvFilter;

use mdvault::config::AppConfig;
use mdvault::db;
use mdvault::engine::DocumentEngine;
use mdvault::sync::{reconcile, SyncCoordinator};

/// Operator-triggered full disk-vs-database reconciliation.
#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    let config = AppConfig::from_env()?;
    tracing::info!(
        database_url = %config.redacted_database_url(),
        data_dir = %config.data_dir.display(),
        "starting on-demand reconciliation"
    );

    let pool = db::init_pool_with_size(&config.database_url, config.database_max_pool_size)?;
    let sync = Arc::new(SyncCoordinator::new(
        config.recently_written_ttl,
        config.debounce_window,
    ));
    let engine = DocumentEngine::new(pool, Arc::new(config), sync);

    let stats = reconcile::reconcile_all(&engine)
        .await
        .map_err(|err| anyhow::anyhow!("reconciliation failed: {err}"))?;

    println!(
        "Reconciled {} vault(s): {} synced, {} removed.",
        stats.vaults, stats.synced, stats.removed
    );
    Ok(())
}
