use super::{StatusChannel, StatusReporter};
use crate::errors::StatusError;
use crate::models::ExecutionStatus;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// In-process status channel shared by reporter and waiter
#[derive(Debug, Clone, Default)]
pub struct StatusBoard {
    statuses: Arc<RwLock<HashMap<String, ExecutionStatus>>>,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, job_name: &str) -> Option<ExecutionStatus> {
        self.statuses.read().await.get(job_name).copied()
    }

    pub async fn set(&self, job_name: impl Into<String>, status: ExecutionStatus) {
        self.statuses.write().await.insert(job_name.into(), status);
    }
}

#[async_trait]
impl StatusChannel for StatusBoard {
    async fn last_known(&self) -> Result<HashMap<String, ExecutionStatus>, StatusError> {
        Ok(self.statuses.read().await.clone())
    }
}

#[async_trait]
impl StatusReporter for StatusBoard {
    async fn report(&self, job_name: &str, status: ExecutionStatus) -> Result<(), StatusError> {
        self.set(job_name, status).await;
        Ok(())
    }
}
