use super::{StatusChannel, StatusReporter};
use crate::db::RedisPool;
use crate::errors::StatusError;
use crate::models::ExecutionStatus;
use async_trait::async_trait;
use redis::AsyncCommands;
use std::collections::HashMap;
use tracing::{instrument, warn};

/// Cluster-wide status channel kept in one Redis hash (`<prefix>:status`)
#[derive(Clone)]
pub struct RedisStatusChannel {
    pool: RedisPool,
    key: String,
}

impl RedisStatusChannel {
    pub fn new(pool: RedisPool) -> Self {
        let key = pool.key("status");
        Self { pool, key }
    }
}

#[async_trait]
impl StatusChannel for RedisStatusChannel {
    #[instrument(skip(self), fields(key = %self.key))]
    async fn last_known(&self) -> Result<HashMap<String, ExecutionStatus>, StatusError> {
        let mut conn = self.pool.get_connection();
        let raw: HashMap<String, String> = conn.hgetall(&self.key).await?;

        let mut statuses = HashMap::with_capacity(raw.len());
        for (job_name, value) in raw {
            match value.parse::<ExecutionStatus>() {
                Ok(status) => {
                    statuses.insert(job_name, status);
                }
                Err(e) => warn!(job_name = %job_name, error = %e, "Ignoring unreadable status"),
            }
        }
        Ok(statuses)
    }
}

#[async_trait]
impl StatusReporter for RedisStatusChannel {
    #[instrument(skip(self), fields(key = %self.key))]
    async fn report(&self, job_name: &str, status: ExecutionStatus) -> Result<(), StatusError> {
        let mut conn = self.pool.get_connection();
        let _: () = conn.hset(&self.key, job_name, status.as_str()).await?;
        Ok(())
    }
}
