// Node-local registry of scheduled jobs
//
// Maps a job's logical name to the scheduler engine that owns it. The job's
// trigger is resolved once, at registration, so queries are a map lookup.
// Only jobs hosted on this node are known here.

use super::trigger::Trigger;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, instrument, warn};

/// Scheduler engine as seen by the repository
#[async_trait]
pub trait SchedulerHandle: Send + Sync {
    /// Canonical names of every job the engine holds
    async fn job_names(&self) -> Vec<String>;

    /// Trigger of the job whose canonical name is `job_name`
    async fn trigger(&self, job_name: &str) -> Option<Arc<dyn Trigger>>;
}

#[derive(Clone)]
struct ScheduleEntry {
    handle: Arc<dyn SchedulerHandle>,
    trigger: Option<Arc<dyn Trigger>>,
}

#[derive(Default)]
pub struct ScheduleRepository {
    entries: RwLock<HashMap<String, ScheduleEntry>>,
}

impl ScheduleRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or overwrite) the engine owning `job_name`
    #[instrument(skip(self, handle))]
    pub async fn add_scheduler(&self, job_name: &str, handle: Arc<dyn SchedulerHandle>) {
        let trigger = handle.trigger(job_name).await;
        if trigger.is_none() {
            warn!("Registered scheduler holds no trigger for this job");
        }

        let previous = self
            .entries
            .write()
            .await
            .insert(job_name.to_string(), ScheduleEntry { handle, trigger });
        if previous.is_some() {
            debug!("Replaced existing scheduler registration");
        }
    }

    pub async fn remove_scheduler(&self, job_name: &str) -> bool {
        self.entries.write().await.remove(job_name).is_some()
    }

    /// Drop every registration; called at node shutdown
    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }

    pub async fn does_job_exist(&self, job_name: &str) -> bool {
        self.entries.read().await.contains_key(job_name)
    }

    pub async fn job_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn get_scheduler(&self, job_name: &str) -> Option<Arc<dyn SchedulerHandle>> {
        self.entries
            .read()
            .await
            .get(job_name)
            .map(|entry| entry.handle.clone())
    }

    pub async fn get_cron_expression(&self, job_name: &str) -> Option<String> {
        self.trigger(job_name)
            .await
            .and_then(|trigger| trigger.cron_expression().map(str::to_string))
    }

    pub async fn get_next_fire_date(&self, job_name: &str) -> Option<DateTime<Utc>> {
        // resolved outside the lock: chained triggers query the repository again
        let trigger = self.trigger(job_name).await?;
        trigger.next_fire_time().await
    }

    async fn trigger(&self, job_name: &str) -> Option<Arc<dyn Trigger>> {
        self.entries
            .read()
            .await
            .get(job_name)
            .and_then(|entry| entry.trigger.clone())
    }
}
