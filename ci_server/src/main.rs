//! Sea CI Server — standalone binary.
//!
//! Receives git hooks, runs build scripts and serves build status and live
//! output over HTTP.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use sea_ci::config::CiConfig;
use sea_ci::routes::{self, CiRouterState};
use sea_ci::services::build_service::BuildService;
use sea_ci::services::checkout::GitCheckout;
use sea_ci::services::store::JsonFileStore;

#[derive(Parser)]
#[command(name = "sea-ci", about = "Sea CI build runner")]
struct Cli {
    /// Server port
    #[arg(short, long, env = "SEA_PORT", default_value = "8080")]
    port: u16,

    /// Persistence file (overrides SEA_DATA_FILE)
    #[arg(long)]
    data_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    if log_format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info".into()),
            )
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info".into()),
            )
            .init();
    }

    let cli = Cli::parse();

    tracing::info!("Starting Sea CI Server...");

    let mut config = CiConfig::from_env();
    if let Some(data_file) = cli.data_file {
        config.data_file = data_file;
    }
    config.prepare_dirs()?;

    let store = JsonFileStore::open(&config.data_file).await?;
    let checkout = GitCheckout::new(&config.repos_dir);
    let service = Arc::new(BuildService::new(
        config,
        Arc::new(store),
        Arc::new(checkout),
    ));
    service.recover().await?;

    // Initialize metrics
    sea_ci::metrics::init_metrics();

    let app = routes::ci_router(CiRouterState {
        service: Arc::clone(&service),
    });

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], cli.port));
    tracing::info!("Sea CI Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            // Open output streams only end once their builds do.
            tracing::info!(
                running = service.registry().len(),
                "Canceling running builds..."
            );
            service.shutdown().await;
        })
        .await?;

    tracing::info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT, shutting down..."),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down..."),
    }
}
