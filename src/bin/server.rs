use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use mdvault::auth::jwt::JwtService;
use mdvault::config::AppConfig;
use mdvault::db;
use mdvault::routes;
use mdvault::state::AppState;
use mdvault::sync::{reconcile, watcher::VaultWatcher, SyncCoordinator};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let config = AppConfig::from_env()?;
    tracing::info!(
        database_url = %config.redacted_database_url(),
        pool_size = config.database_max_pool_size,
        server_host = %config.server_host,
        server_port = config.server_port,
        data_dir = %config.data_dir.display(),
        reconcile_interval_secs = config.reconcile_interval.as_secs(),
        "loaded configuration"
    );

    let pool = db::init_pool_with_size(&config.database_url, config.database_max_pool_size)?;
    let sync = Arc::new(SyncCoordinator::new(
        config.recently_written_ttl,
        config.debounce_window,
    ));
    let jwt = JwtService::from_config(&config)?;
    let state = AppState::new(pool, config, sync, jwt);

    let engine = state.engine();
    let _watcher = VaultWatcher::spawn(engine.clone())
        .map_err(|err| anyhow::anyhow!("failed to start watcher: {err}"))?;
    tokio::spawn(reconcile::run_periodic(
        engine,
        state.config.reconcile_interval,
    ));

    let listen_addr: SocketAddr =
        format!("{}:{}", state.config.server_host, state.config.server_port).parse()?;
    let router = routes::create_router(state);

    let listener = TcpListener::bind(listen_addr).await?;
    tracing::info!("listening on {}", listen_addr);

    axum::serve(listener, router).await?;
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}
