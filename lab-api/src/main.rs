use anyhow::Result;
use lab_api::{create_app, AppState, Config};
use lab_orchestrator::db::{backup_database, create_pool, run_migrations};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let _log_guard = lab_logging::init_subscriber()?;

    info!("Starting lab-api service...");

    let config = Config::from_env();
    info!(
        "Configuration loaded: bind_addr={}, db_path={}, work_root={}",
        config.bind_addr,
        config.db_path.display(),
        config.work_root.display()
    );

    let db_path = &config.db_path;
    if db_path.exists() {
        let backup_path = backup_database(db_path)?;
        info!("Database backed up to: {}", backup_path.display());
    }

    let pool = create_pool(db_path).await?;
    info!("Running database migrations...");
    run_migrations(&pool).await?;
    info!("Migrations complete");

    let state = AppState::from_config(pool, &config).await?;

    // No pipeline survives a restart.
    let interrupted = state.store.reset_interrupted_deployments().await?;
    if !interrupted.is_empty() {
        warn!(labs = ?interrupted, "Marked interrupted deployments as failed");
    }

    let tunnel = state.tunnel.clone();
    let app = create_app(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    info!("Listening on http://{}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            let closed = tunnel.registry().close_all();
            info!(sessions = closed, "Shutdown requested; closing remote access sessions");
        })
        .await?;

    Ok(())
}
