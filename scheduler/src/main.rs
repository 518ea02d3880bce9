// Scheduler node entry point

use anyhow::{anyhow, Context, Result};
use common::bootstrap::init_node_services;
use common::config::Settings;
use common::node::Node;
use common::telemetry::{init_logging, shutdown_tracer};
use std::collections::HashMap;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::load().context("Failed to load configuration")?;
    settings
        .validate()
        .map_err(|e| anyhow!("Invalid configuration: {}", e))?;

    init_logging(
        &settings.observability.log_level,
        settings.observability.tracing_endpoint.as_deref(),
    )?;

    info!(
        backend = ?settings.node.backend,
        redis_url = %settings.redis.url,
        jobs = settings.jobs.len(),
        "Configuration loaded"
    );

    let services = init_node_services(&settings).await?;

    // every configured job runs its command
    let node = Node::build(&settings, services, HashMap::new())
        .await
        .context("Failed to register jobs")?;

    node.start().await;
    info!(node_id = %node.node_id(), "Scheduler node running");

    shutdown_signal().await;

    node.shutdown().await;
    shutdown_tracer();

    info!("Scheduler node stopped");
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received SIGTERM signal");
        },
    }

    info!("Initiating graceful shutdown");
}
