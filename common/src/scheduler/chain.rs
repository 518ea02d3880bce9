// Completion-driven job chaining
//
// A ChainTrigger never fires on its own: the engine sees a first fire time a
// millennium away. Its dependent job is launched by the ChainCoordinator when
// the followed job reports a terminal status.

use super::repository::ScheduleRepository;
use super::trigger::{far_future, Trigger};
use crate::errors::{ExecutionError, RegistrationError};
use crate::models::{CompletionEvent, ExecutionStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Something that can start a job right now, bypassing its schedule
#[async_trait]
pub trait JobLauncher: Send + Sync {
    async fn fire_now(&self, job_name: &str) -> Result<(), ExecutionError>;
}

/// Virtual trigger: metadata plus a chaining anchor
pub struct ChainTrigger {
    owner_job: String,
    follow_job: String,
    start_delay: Duration,
    repository: Arc<ScheduleRepository>,
}

impl std::fmt::Debug for ChainTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainTrigger")
            .field("owner_job", &self.owner_job)
            .field("follow_job", &self.follow_job)
            .field("start_delay", &self.start_delay)
            .finish()
    }
}

impl ChainTrigger {
    /// Fails fast when `follow_job` is missing or blank
    pub fn new(
        owner_job: impl Into<String>,
        follow_job: Option<&str>,
        start_delay: Duration,
        repository: Arc<ScheduleRepository>,
    ) -> Result<Self, RegistrationError> {
        let owner_job = owner_job.into();
        let follow_job = match follow_job.map(str::trim) {
            Some(follow) if !follow.is_empty() => follow.to_string(),
            _ => return Err(RegistrationError::MissingFollowJob(owner_job)),
        };

        Ok(Self {
            owner_job,
            follow_job,
            start_delay,
            repository,
        })
    }

    pub fn owner_job(&self) -> &str {
        &self.owner_job
    }

    pub fn follow_job(&self) -> &str {
        &self.follow_job
    }

    pub fn start_delay(&self) -> Duration {
        self.start_delay
    }

    /// Start of the (never used) repeat schedule
    pub fn start_time(&self) -> DateTime<Utc> {
        DateTime::UNIX_EPOCH
    }

    /// Effectively infinite repeat interval
    pub fn repeat_interval(&self) -> Duration {
        Duration::MAX
    }
}

#[async_trait]
impl Trigger for ChainTrigger {
    fn job_name(&self) -> &str {
        &self.owner_job
    }

    fn compute_first_fire_time(&self, _now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        Some(far_future())
    }

    fn fire_time_after(&self, _after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        Some(far_future())
    }

    /// Predecessor's next fire time plus the start delay; advisory only
    async fn next_fire_time(&self) -> Option<DateTime<Utc>> {
        let advisory = self
            .repository
            .get_next_fire_date(&self.follow_job)
            .await
            .and_then(|next| {
                let delay = chrono::Duration::from_std(self.start_delay).ok()?;
                next.checked_add_signed(delay)
            });
        Some(advisory.unwrap_or_else(far_future))
    }
}

/// Launches dependents when the job they follow completes
pub struct ChainCoordinator {
    triggers: RwLock<HashMap<String, Vec<Arc<ChainTrigger>>>>,
    launcher: Arc<dyn JobLauncher>,
}

impl ChainCoordinator {
    pub fn new(launcher: Arc<dyn JobLauncher>) -> Self {
        Self {
            triggers: RwLock::new(HashMap::new()),
            launcher,
        }
    }

    #[instrument(skip(self, trigger), fields(job = %trigger.owner_job(), follow_job = %trigger.follow_job()))]
    pub async fn add_job_completion_trigger(&self, trigger: Arc<ChainTrigger>) {
        self.triggers
            .write()
            .await
            .entry(trigger.follow_job().to_string())
            .or_default()
            .push(trigger);
        debug!("Chain trigger registered");
    }

    /// Jobs launched when `job_name` completes, in registration order
    pub async fn dependents_of(&self, job_name: &str) -> Vec<String> {
        self.triggers
            .read()
            .await
            .get(job_name)
            .map(|triggers| {
                triggers
                    .iter()
                    .map(|trigger| trigger.owner_job().to_string())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Launch every job following `job_name`. Any terminal status counts as
    /// completion. Returns how many launches were requested; failed ones are
    /// logged.
    #[instrument(skip(self), fields(status = %status))]
    pub async fn on_job_completion(&self, job_name: &str, status: ExecutionStatus) -> usize {
        if !status.is_terminal() {
            debug!("Ignoring non-terminal status");
            return 0;
        }

        let dependents = self.dependents_of(job_name).await;
        for dependent in &dependents {
            match self.launcher.fire_now(dependent).await {
                Ok(()) => info!(dependent = %dependent, "Launched chained job"),
                Err(e) => error!(dependent = %dependent, error = %e, "Failed to launch chained job"),
            }
        }
        dependents.len()
    }

    /// Consume completion events until `shutdown` is cancelled
    pub async fn run(
        &self,
        mut events: broadcast::Receiver<CompletionEvent>,
        shutdown: CancellationToken,
    ) {
        info!("Chain coordinator listening for completions");

        loop {
            tokio::select! {
                received = events.recv() => match received {
                    Ok(event) => {
                        self.on_job_completion(&event.job_name, event.status).await;
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Completion events dropped, chained jobs may not run");
                    }
                    Err(RecvError::Closed) => {
                        debug!("Completion event source closed");
                        break;
                    }
                },
                _ = shutdown.cancelled() => break,
            }
        }

        info!("Chain coordinator stopped");
    }
}
