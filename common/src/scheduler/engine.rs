// Node-local scheduler engine
//
// Every node runs one engine with identical job definitions. A due trigger
// fires on every node at once; the leader election gate lets exactly one of
// them run the job body.

use super::chain::JobLauncher;
use super::repository::SchedulerHandle;
use super::runner::{JobContext, JobRunner};
use super::trigger::Trigger;
use crate::config::Settings;
use crate::errors::ExecutionError;
use crate::gate::{GateOutcome, JobInvocation, LeaderElectionGate, DEFAULT_ACQUIRE_TIMEOUT};
use crate::models::{
    CompletionEvent, ExecutionStatus, JobCompletion, JobParameters, PARAM_JOB_NAME,
};
use crate::status::StatusReporter;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Configuration for the scheduler engine
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often due triggers are evaluated
    pub tick_interval: Duration,
    /// Upper bound on concurrently executing jobs on this node
    pub max_concurrent_jobs: usize,
    /// How long `stop` waits for in-flight executions
    pub shutdown_grace: Duration,
    /// Acquisition timeout for jobs that do not override it
    pub default_acquire_timeout: Duration,
    /// Buffer of the completion event channel
    pub event_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            max_concurrent_jobs: 10,
            shutdown_grace: Duration::from_secs(30),
            default_acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
            event_capacity: 256,
        }
    }
}

impl From<&Settings> for SchedulerConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            tick_interval: Duration::from_millis(settings.engine.tick_interval_ms),
            max_concurrent_jobs: settings.engine.max_concurrent_jobs,
            shutdown_grace: Duration::from_millis(settings.engine.shutdown_grace_ms),
            default_acquire_timeout: settings.leader.acquire_timeout(),
            ..Self::default()
        }
    }
}

/// A job as known to the engine
#[derive(Debug, Clone)]
pub struct JobDefinition {
    pub name: String,
    pub parameters: JobParameters,
    pub acquire_timeout: Option<Duration>,
}

impl JobDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            parameters: JobParameters::new(name.clone()),
            name,
            acquire_timeout: None,
        }
    }

    /// Replace the parameters; `jobName` always stays this job's name
    pub fn with_parameters(mut self, parameters: JobParameters) -> Self {
        self.parameters = parameters.with(PARAM_JOB_NAME, self.name.as_str());
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = Some(timeout);
        self
    }
}

struct ScheduledJob {
    definition: Arc<JobDefinition>,
    trigger: Arc<dyn Trigger>,
    runner: Arc<dyn JobRunner>,
    next_fire: Option<DateTime<Utc>>,
}

/// Scheduler trait for job scheduling operations
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Run the trigger loop until stopped
    async fn start(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;

    /// Stop the scheduler gracefully
    async fn stop(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;

    /// Fire every trigger due at `now`; returns how many fired
    async fn process_due_jobs(&self, now: DateTime<Utc>) -> usize;
}

pub struct SchedulerEngine {
    config: SchedulerConfig,
    jobs: RwLock<HashMap<String, ScheduledJob>>,
    gate: Arc<LeaderElectionGate>,
    reporter: Arc<dyn StatusReporter>,
    events: broadcast::Sender<CompletionEvent>,
    permits: Arc<Semaphore>,
    shutdown: CancellationToken,
}

impl SchedulerEngine {
    pub fn new(
        config: SchedulerConfig,
        gate: Arc<LeaderElectionGate>,
        reporter: Arc<dyn StatusReporter>,
        shutdown: CancellationToken,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let permits = Arc::new(Semaphore::new(config.max_concurrent_jobs.max(1)));

        Self {
            config,
            jobs: RwLock::new(HashMap::new()),
            gate,
            reporter,
            events,
            permits,
            shutdown,
        }
    }

    /// Completion hook: one event per execution that reached a terminal status
    pub fn subscribe(&self) -> broadcast::Receiver<CompletionEvent> {
        self.events.subscribe()
    }

    /// Register a job; re-registering a name replaces the previous job
    #[instrument(skip(self, definition, trigger, runner), fields(job_name = %definition.name))]
    pub async fn schedule_job(
        &self,
        definition: JobDefinition,
        trigger: Arc<dyn Trigger>,
        runner: Arc<dyn JobRunner>,
    ) {
        let next_fire = trigger.compute_first_fire_time(Utc::now());
        let job = ScheduledJob {
            definition: Arc::new(definition),
            trigger,
            runner,
            next_fire,
        };

        let name = job.definition.name.clone();
        if self.jobs.write().await.insert(name, job).is_some() {
            debug!("Replaced existing job definition");
        }
        info!(next_fire = ?next_fire, "Job scheduled");
    }

    pub async fn unschedule_job(&self, job_name: &str) -> bool {
        self.jobs.write().await.remove(job_name).is_some()
    }

    /// Next time the engine itself will fire `job_name`
    pub async fn scheduled_fire_time(&self, job_name: &str) -> Option<DateTime<Utc>> {
        self.jobs
            .read()
            .await
            .get(job_name)
            .and_then(|job| job.next_fire)
    }

    /// Launch `job_name` immediately, ignoring its trigger.
    /// The handle resolves once the execution has left the gate.
    pub async fn launch_now(&self, job_name: &str) -> Result<JoinHandle<GateOutcome>, ExecutionError> {
        let task = {
            let jobs = self.jobs.read().await;
            let job = jobs
                .get(job_name)
                .ok_or_else(|| ExecutionError::JobNotFound(job_name.to_string()))?;
            self.task_for(job, Utc::now())
        };
        Ok(self.spawn(task))
    }

    fn task_for(&self, job: &ScheduledJob, fired_at: DateTime<Utc>) -> JobTask {
        JobTask {
            definition: job.definition.clone(),
            runner: job.runner.clone(),
            reporter: self.reporter.clone(),
            gate: self.gate.clone(),
            events: self.events.clone(),
            acquire_timeout: job
                .definition
                .acquire_timeout
                .unwrap_or(self.config.default_acquire_timeout),
            fired_at,
        }
    }

    fn spawn(&self, task: JobTask) -> JoinHandle<GateOutcome> {
        let permits = self.permits.clone();
        tokio::spawn(async move {
            let _permit = match permits.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    warn!(job_name = %task.definition.name, "Engine stopped, dropping fire");
                    return GateOutcome::Skipped;
                }
            };
            task.execute().await
        })
    }
}

#[async_trait]
impl Scheduler for SchedulerEngine {
    #[instrument(skip(self))]
    async fn start(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        info!(
            tick_interval_ms = self.config.tick_interval.as_millis() as u64,
            max_concurrent_jobs = self.config.max_concurrent_jobs,
            "Starting scheduler engine"
        );

        let mut ticker = interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let fired = self.process_due_jobs(Utc::now()).await;
                    if fired > 0 {
                        debug!(fired, "Fired due triggers");
                    }
                }
                _ = self.shutdown.cancelled() => {
                    info!("Shutdown signal received, stopping scheduler");
                    break;
                }
            }
        }

        info!("Scheduler engine stopped");
        Ok(())
    }

    /// Cancels the trigger loop and pending completion waits, then waits up to
    /// the grace period for in-flight executions to release leadership
    #[instrument(skip(self))]
    async fn stop(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        info!("Stopping scheduler engine");
        self.shutdown.cancel();

        let capacity = u32::try_from(self.config.max_concurrent_jobs.max(1)).unwrap_or(u32::MAX);
        match tokio::time::timeout(self.config.shutdown_grace, self.permits.acquire_many(capacity))
            .await
        {
            Ok(Ok(_idle)) => info!("Scheduler engine stopped gracefully"),
            Ok(Err(_)) => debug!("Engine permits already closed"),
            Err(_) => warn!(
                grace_ms = self.config.shutdown_grace.as_millis() as u64,
                "In-flight jobs still running after grace period"
            ),
        }
        self.permits.close();
        Ok(())
    }

    async fn process_due_jobs(&self, now: DateTime<Utc>) -> usize {
        let due: Vec<JobTask> = {
            let mut jobs = self.jobs.write().await;
            jobs.values_mut()
                .filter(|job| job.next_fire.is_some_and(|next| next <= now))
                .map(|job| {
                    job.next_fire = job.trigger.fire_time_after(now);
                    self.task_for(job, now)
                })
                .collect()
        };

        let fired = due.len();
        for task in due {
            self.spawn(task);
        }
        fired
    }
}

#[async_trait]
impl JobLauncher for SchedulerEngine {
    async fn fire_now(&self, job_name: &str) -> Result<(), ExecutionError> {
        self.launch_now(job_name).await.map(|_| ())
    }
}

#[async_trait]
impl SchedulerHandle for SchedulerEngine {
    async fn job_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .jobs
            .read()
            .await
            .values()
            .map(|job| job.definition.name.clone())
            .collect();
        names.sort();
        names
    }

    async fn trigger(&self, job_name: &str) -> Option<Arc<dyn Trigger>> {
        self.jobs
            .read()
            .await
            .values()
            .find(|job| job.definition.name == job_name)
            .map(|job| job.trigger.clone())
    }
}

/// One execution of a job, from fire to completion event
struct JobTask {
    definition: Arc<JobDefinition>,
    runner: Arc<dyn JobRunner>,
    reporter: Arc<dyn StatusReporter>,
    gate: Arc<LeaderElectionGate>,
    events: broadcast::Sender<CompletionEvent>,
    acquire_timeout: Duration,
    fired_at: DateTime<Utc>,
}

impl JobTask {
    async fn execute(self) -> GateOutcome {
        let shard_key = self.definition.parameters.shard_key(&self.definition.name);
        let outcome = self
            .gate
            .execute(&self, &shard_key, self.acquire_timeout)
            .await;

        if let GateOutcome::Executed { status: Some(status) } = outcome {
            let event = CompletionEvent::new(self.definition.name.as_str(), status);
            if self.events.send(event).is_err() {
                debug!(job_name = %self.definition.name, "No completion listeners");
            }
        }
        outcome
    }

    async fn report(&self, status: ExecutionStatus) {
        if let Err(e) = self
            .reporter
            .report(&self.definition.name, status)
            .await
        {
            warn!(status = %status, error = %e, "Failed to report job status");
        }
    }
}

#[async_trait]
impl JobInvocation for JobTask {
    fn job_name(&self) -> &str {
        &self.definition.name
    }

    async fn invoke(&self) -> Result<(), ExecutionError> {
        // overwrite whatever the previous run left behind before polling starts
        self.report(ExecutionStatus::Running).await;

        let ctx = JobContext {
            job_name: self.definition.name.clone(),
            parameters: self.definition.parameters.clone(),
            fired_at: self.fired_at,
            reporter: self.reporter.clone(),
        };

        match AssertUnwindSafe(self.runner.run(&ctx)).catch_unwind().await {
            Ok(Ok(JobCompletion::Finished(status))) => {
                self.report(status).await;
                Ok(())
            }
            Ok(Ok(JobCompletion::Detached)) => Ok(()),
            Ok(Err(e)) => {
                self.report(ExecutionStatus::Failed).await;
                Err(e)
            }
            Err(_) => {
                error!("Job runner panicked");
                self.report(ExecutionStatus::Failed).await;
                Err(ExecutionError::Panicked(ctx.job_name))
            }
        }
    }
}
