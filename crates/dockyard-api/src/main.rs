//! dockyard API server

use clap::Parser;
use dockyard_api::{AppState, routes};
use dockyard_builder::LocalBuildBackend;
use dockyard_config::{LogFormat, SystemConfig};
use dockyard_db::{MemoryStore, PgStore, Store, create_pool, run_migrations};
use dockyard_deployer::SwarmOrchestrator;
use dockyard_scheduler::Context;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "dockyard-server")]
#[command(about = "dockyard deployment API server", long_about = None)]
struct Args {
    /// Path to the system configuration (defaults to ./dockyard.kdl)
    #[arg(short, long, env = "DOCKYARD_CONFIG")]
    config: Option<PathBuf>,

    /// Keep records in memory instead of PostgreSQL
    #[arg(long)]
    memory_store: bool,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

async fn connect_store(config: &SystemConfig, memory: bool) -> anyhow::Result<Arc<dyn Store>> {
    if memory {
        warn!("Using the in-memory store; records are lost on restart");
        return Ok(Arc::new(MemoryStore::new()));
    }
    info!("Connecting to database...");
    let pool = create_pool(&config.database.url, config.database.max_connections).await?;
    run_migrations(&pool).await?;
    info!("Database connected");
    Ok(Arc::new(PgStore::new(pool)))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = SystemConfig::load(args.config.as_deref())?;
    init_tracing(config.logging.format);

    let store = connect_store(&config, args.memory_store).await?;
    let orchestrator = Arc::new(SwarmOrchestrator::connect(
        config.orchestrator.docker_socket.clone(),
    )?);
    let backend = Arc::new(LocalBuildBackend::new(config.builds.clone()));

    tokio::fs::create_dir_all(&config.builds.work_dir).await?;
    tokio::fs::create_dir_all(&config.builds.logs_dir).await?;

    let listen = config.server.listen.clone();
    let context = Context::new(config, store, backend, orchestrator);
    // Nothing from a previous run is still building or applying.
    context.coordinator.recover_interrupted().await?;
    let state = AppState::new(context);

    let app = routes::router(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    info!("Starting server on {}", listen);
    let listener = TcpListener::bind(&listen).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}
