// Bootstrap utilities for binary initialization

use crate::config::{CoordinationBackend, Settings};
use crate::coordination::{InMemoryCoordinationService, RedisCoordinationService};
use crate::db::RedisPool;
use crate::node::NodeServices;
use crate::status::{RedisStatusChannel, StatusBoard};
use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{info, warn};

/// Initialize the Redis pool shared by leadership and the status channel
///
/// # Errors
/// Returns error if the client cannot be created or Redis is unreachable
#[tracing::instrument(skip(settings))]
pub async fn init_redis_pool(settings: &Settings) -> Result<RedisPool> {
    info!("Initializing Redis pool");

    let redis_pool = RedisPool::new(&settings.redis)
        .await
        .context("Failed to initialize Redis pool")?;

    redis_pool
        .health_check()
        .await
        .context("Redis health check failed")?;

    info!("Redis pool initialized");
    Ok(redis_pool)
}

/// Build the coordination and status services for the configured backend
///
/// # Errors
/// Returns error if the Redis backend is selected and cannot be reached
#[tracing::instrument(skip(settings), fields(backend = ?settings.node.backend))]
pub async fn init_node_services(settings: &Settings) -> Result<NodeServices> {
    let node_id = settings.node.node_id();

    let services = match settings.node.backend {
        CoordinationBackend::Redis => {
            let pool = init_redis_pool(settings).await?;
            let channel = Arc::new(RedisStatusChannel::new(pool.clone()));
            NodeServices {
                coordination: Arc::new(RedisCoordinationService::new(
                    pool,
                    node_id.clone(),
                    settings.leader.lease_ttl(),
                    settings.leader.retry_interval(),
                )),
                status_channel: channel.clone(),
                status_reporter: channel,
                node_id,
            }
        }
        CoordinationBackend::Memory => {
            warn!("In-memory coordination only excludes jobs within this process");
            let board = Arc::new(StatusBoard::new());
            NodeServices {
                coordination: Arc::new(InMemoryCoordinationService::new(
                    node_id.clone(),
                    settings.leader.lease_ttl(),
                )),
                status_channel: board.clone(),
                status_reporter: board,
                node_id,
            }
        }
    };

    info!(node_id = %services.node_id, "Node services initialized");
    Ok(services)
}
