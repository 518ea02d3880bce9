// Shared Redis connection for leadership leases and the status hash
//
// Every key this cluster touches lives under `<key_prefix>:`, so several
// clusters can share one Redis without seeing each other's leases.

use crate::config::RedisConfig;
use crate::errors::StorageError;
use redis::aio::ConnectionManager;
use redis::Client;
use tokio::time::Instant;
use tracing::{debug, info, instrument};

fn namespaced(prefix: &str, suffix: &str) -> String {
    format!("{}:{}", prefix, suffix)
}

/// Reconnecting multiplexed connection plus the cluster key namespace
#[derive(Clone)]
pub struct RedisPool {
    manager: ConnectionManager,
    key_prefix: String,
}

impl RedisPool {
    #[instrument(skip(config), fields(redis_url = %config.url, key_prefix = %config.key_prefix))]
    pub async fn new(config: &RedisConfig) -> Result<Self, StorageError> {
        let client = Client::open(config.url.as_str())
            .map_err(|e| StorageError::ConnectionFailed(format!("invalid Redis URL: {}", e)))?;
        let manager = ConnectionManager::new(client)
            .await
            .map_err(|e| StorageError::ConnectionFailed(format!("cannot reach Redis: {}", e)))?;

        info!("Coordination store connected");
        Ok(Self {
            manager,
            key_prefix: config.key_prefix.clone(),
        })
    }

    /// Handle onto the shared connection; cloning is cheap
    pub fn get_connection(&self) -> ConnectionManager {
        self.manager.clone()
    }

    pub fn key(&self, suffix: &str) -> String {
        namespaced(&self.key_prefix, suffix)
    }

    /// PING the store; startup refuses to continue without a PONG
    pub async fn health_check(&self) -> Result<(), StorageError> {
        let started = Instant::now();
        let reply: String = redis::cmd("PING")
            .query_async(&mut self.get_connection())
            .await
            .map_err(|e| StorageError::RedisError(format!("PING failed: {}", e)))?;

        match reply.as_str() {
            "PONG" => {
                let latency_ms = started.elapsed().as_millis() as u64;
                debug!(latency_ms, "Coordination store healthy");
                Ok(())
            }
            other => Err(StorageError::RedisError(format!("PING answered {}", other))),
        }
    }
}
