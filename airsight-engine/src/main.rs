//! airsight-engine - air-quality harmonization and forecasting service
//!
//! Serves forecasts and current confidence over HTTP and exposes the
//! scheduler jobs as POST endpoints. Scheduling itself is external: a cron
//! job or orchestrator calls `/jobs/*`.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

use airsight_common::config::{
    locate_config_file, load_toml, RootFolderInitializer, RootFolderResolver, TomlConfig,
};
use airsight_common::events::EventBus;
use airsight_engine::config::PipelineConfig;
use airsight_engine::{build_router, AppState, Pipeline};

const MODULE_NAME: &str = "airsight-engine";

/// Command-line arguments for airsight-engine
#[derive(Parser, Debug)]
#[command(name = "airsight-engine")]
#[command(about = "Air-quality harmonization and forecasting service")]
#[command(version)]
struct Args {
    /// Root folder holding the database
    #[arg(short, long)]
    root_folder: Option<PathBuf>,

    /// Pipeline TOML configuration file
    #[arg(short, long, env = "AIRSIGHT_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on (overrides `[server] bind_address`)
    #[arg(short, long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config_path = args.config.clone().or_else(|| locate_config_file(MODULE_NAME));

    // RUST_LOG wins over `[logging] level`
    let log_level = config_path
        .as_deref()
        .and_then(|p| load_toml::<TomlConfig>(p).ok())
        .map(|c| c.logging.level)
        .unwrap_or_else(|| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level)),
        )
        .init();

    info!(
        "Starting airsight-engine v{} [{}] built {} ({})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH"),
        env!("BUILD_TIMESTAMP"),
        env!("BUILD_PROFILE")
    );

    let config = PipelineConfig::load(config_path.as_deref())
        .context("Invalid pipeline configuration")?;

    let root_folder = RootFolderResolver::new(MODULE_NAME)
        .with_cli_arg(args.root_folder)
        .resolve();
    let initializer = RootFolderInitializer::new(root_folder);
    initializer
        .ensure_directory_exists()
        .context("Failed to initialize root folder")?;

    let db_path = initializer.database_path();
    info!("Database: {}", db_path.display());
    let db_pool = airsight_engine::db::init_database_pool(&db_path)
        .await
        .context("Failed to open database")?;

    let events = EventBus::new(100);
    let bind_address = args
        .bind
        .unwrap_or_else(|| config.server.bind_address.clone());
    let pipeline = Arc::new(Pipeline::new(db_pool, config, events)?);

    match pipeline.registry().load_persisted().await {
        Ok(0) => warn!("No persisted models; forecasts are unavailable until the first retrain"),
        Ok(count) => info!(count, "Restored persisted models"),
        Err(e) => error!(error = %e, "Failed to restore persisted models"),
    }

    let app = build_router(AppState::new(pipeline));

    let listener = tokio::net::TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("Failed to bind to {}", bind_address))?;
    info!("Listening on http://{}", bind_address);
    info!("Health check: http://{}/health", bind_address);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Server shutdown complete");
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
