mod handlers;
mod metrics;
mod routes;

use anyhow::{Context, Result};
use codepad_common::config::{LogFormat, ServiceConfig};
use codepad_engine::Coordinator;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<Coordinator>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = ServiceConfig::from_env().context("Failed to load service configuration")?;

    init_tracing(config.log_format);

    info!("Codepad API booting...");

    let coordinator = Coordinator::from_config(&config)
        .await
        .context("Failed to initialize execution engine")?;

    info!(
        "Loaded language configurations for: {:?}",
        coordinator.registry().list_languages()
    );
    info!(
        workspace_root = %coordinator.workspace_root().display(),
        max_concurrent = config.max_concurrent,
        run_timeout_ms = config.run_timeout.as_millis() as u64,
        compile_timeout_ms = config.compile_timeout.as_millis() as u64,
        "Execution engine ready"
    );

    let state = Arc::new(AppState {
        coordinator: Arc::new(coordinator),
    });

    // Build router
    let app = routes::routes(state);

    // Start server
    let listener = TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.bind_addr))?;

    info!("HTTP server listening on {}", config.bind_addr);
    info!("Ready to accept code");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("API shutdown complete");
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    match format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init(),
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init(),
    }
}

/// Resolves on Ctrl+C or SIGTERM. In-flight requests finish (and clean up
/// their workspaces) before the server exits.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    warn!("Received shutdown signal, draining in-flight executions...");
}
