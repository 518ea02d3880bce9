// Node: wires coordination, status, engine and chaining from Settings
//
// Registries live exactly as long as the Node. `build` validates every job
// before anything is scheduled, `start` spawns the trigger loop and the chain
// coordinator, `shutdown` stops both and clears the repository.

use crate::config::{JobConfig, Settings};
use crate::coordination::CoordinationService;
use crate::errors::RegistrationError;
use crate::gate::{GateConfig, LeaderElectionGate};
use crate::models::{JobParameters, PARAM_JOB_NAME};
use crate::scheduler::{
    ChainCoordinator, ChainTrigger, CommandRunner, CronTrigger, JobDefinition, JobRunner,
    ScheduleRepository, Scheduler, SchedulerConfig, SchedulerEngine, SchedulerHandle, Trigger,
};
use crate::status::{CompletionWaiter, StatusChannel, StatusReporter};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

/// Cluster-facing services a node is built on
#[derive(Clone)]
pub struct NodeServices {
    pub node_id: String,
    pub coordination: Arc<dyn CoordinationService>,
    pub status_channel: Arc<dyn StatusChannel>,
    pub status_reporter: Arc<dyn StatusReporter>,
}

pub struct Node {
    node_id: String,
    engine: Arc<SchedulerEngine>,
    repository: Arc<ScheduleRepository>,
    coordinator: Arc<ChainCoordinator>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

enum TriggerKind<'a> {
    Cron(&'a str),
    Chain(&'a str),
}

fn trigger_kind(job: &JobConfig) -> Result<TriggerKind<'_>, RegistrationError> {
    match (job.cron.as_deref(), job.follow_job.as_deref()) {
        (Some(cron), None) => Ok(TriggerKind::Cron(cron)),
        (None, Some(follow)) if follow.trim().is_empty() => {
            Err(RegistrationError::MissingFollowJob(job.name.clone()))
        }
        (None, Some(follow)) => Ok(TriggerKind::Chain(follow.trim())),
        (Some(_), Some(_)) => Err(RegistrationError::InvalidTrigger {
            job: job.name.clone(),
            reason: "cron and follow_job are mutually exclusive".to_string(),
        }),
        (None, None) => Err(RegistrationError::InvalidTrigger {
            job: job.name.clone(),
            reason: "either cron or follow_job is required".to_string(),
        }),
    }
}

/// Check trigger kinds, predecessors and chain cycles for a set of jobs
pub fn validate_job_graph(jobs: &[JobConfig]) -> Result<(), RegistrationError> {
    let mut names = HashSet::new();
    for job in jobs {
        if !names.insert(job.name.as_str()) {
            return Err(RegistrationError::DuplicateJob(job.name.clone()));
        }
        // status, chaining and the shard fallback all key on the job name
        if let Some(parameter) = job.parameters.get(PARAM_JOB_NAME) {
            if *parameter != job.name {
                return Err(RegistrationError::ConflictingJobName {
                    job: job.name.clone(),
                    parameter: parameter.clone(),
                });
            }
        }
    }

    // each chained job has exactly one predecessor
    let mut follows: HashMap<&str, &str> = HashMap::new();
    for job in jobs {
        if let TriggerKind::Chain(follow) = trigger_kind(job)? {
            if !names.contains(follow) {
                return Err(RegistrationError::UnknownPredecessor {
                    job: job.name.clone(),
                    follow_job: follow.to_string(),
                });
            }
            follows.insert(job.name.as_str(), follow);
        }
    }

    for start in follows.keys() {
        let mut path = vec![*start];
        let mut current = *start;
        while let Some(&next) = follows.get(current) {
            if let Some(pos) = path.iter().position(|name| *name == next) {
                let mut cycle: Vec<&str> = path[pos..].to_vec();
                cycle.push(next);
                return Err(RegistrationError::ChainCycle(cycle.join(" -> ")));
            }
            path.push(next);
            current = next;
        }
    }

    Ok(())
}

fn job_parameters(job: &JobConfig) -> JobParameters {
    let mut parameters = JobParameters::new(job.name.as_str());
    for (key, value) in &job.parameters {
        parameters = parameters.with(key.as_str(), value.as_str());
    }
    match &job.shard {
        Some(shard) => parameters.with_shard(shard.as_str()),
        None => parameters,
    }
}

impl Node {
    /// Build a node hosting `settings.jobs`.
    ///
    /// `runners` supplies job bodies by job name; jobs without an entry run
    /// their configured command.
    #[instrument(skip_all, fields(node_id = %services.node_id, jobs = settings.jobs.len()))]
    pub async fn build(
        settings: &Settings,
        services: NodeServices,
        mut runners: HashMap<String, Arc<dyn JobRunner>>,
    ) -> Result<Self, RegistrationError> {
        validate_job_graph(&settings.jobs)?;

        let shutdown = CancellationToken::new();
        let waiter = CompletionWaiter::new(
            services.status_channel.clone(),
            settings.completion.wait_timeout(),
        )
        .with_shutdown(shutdown.clone());
        let gate = LeaderElectionGate::new(
            services.coordination.clone(),
            waiter,
            GateConfig {
                poll_interval: settings.completion.poll_interval(),
                renew_interval: settings.leader.renew_interval(),
            },
        );
        let engine = Arc::new(SchedulerEngine::new(
            SchedulerConfig::from(settings),
            Arc::new(gate),
            services.status_reporter.clone(),
            shutdown.clone(),
        ));
        let repository = Arc::new(ScheduleRepository::new());
        let coordinator = Arc::new(ChainCoordinator::new(engine.clone()));

        for job in &settings.jobs {
            let runner = match runners.remove(&job.name) {
                Some(runner) => runner,
                None => CommandRunner::from_command(&job.command)
                    .map(|runner| Arc::new(runner) as Arc<dyn JobRunner>)
                    .ok_or_else(|| RegistrationError::MissingRunner(job.name.clone()))?,
            };

            let trigger: Arc<dyn Trigger> = match trigger_kind(job)? {
                TriggerKind::Cron(expression) => Arc::new(CronTrigger::new(
                    job.name.as_str(),
                    expression,
                    job.timezone.as_deref(),
                )?),
                TriggerKind::Chain(follow) => {
                    let chain = Arc::new(ChainTrigger::new(
                        job.name.as_str(),
                        Some(follow),
                        Duration::from_millis(job.start_delay_ms),
                        repository.clone(),
                    )?);
                    coordinator.add_job_completion_trigger(chain.clone()).await;
                    chain
                }
            };

            let mut definition =
                JobDefinition::new(job.name.as_str()).with_parameters(job_parameters(job));
            if let Some(ms) = job.acquire_timeout_ms {
                definition = definition.with_acquire_timeout(Duration::from_millis(ms));
            }
            engine.schedule_job(definition, trigger, runner).await;
        }

        // index triggers only once every job is loaded
        let handle: Arc<dyn SchedulerHandle> = engine.clone();
        for job_name in engine.job_names().await {
            repository.add_scheduler(&job_name, handle.clone()).await;
        }

        info!("Node built");
        Ok(Self {
            node_id: services.node_id,
            engine,
            repository,
            coordinator,
            shutdown,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Spawn the trigger loop and the chain coordinator
    #[instrument(skip(self), fields(node_id = %self.node_id))]
    pub async fn start(&self) {
        // subscribe before the engine can fire anything
        let events = self.engine.subscribe();

        let coordinator = self.coordinator.clone();
        let shutdown = self.shutdown.clone();
        let chain_task = tokio::spawn(async move { coordinator.run(events, shutdown).await });

        let engine = self.engine.clone();
        let engine_task = tokio::spawn(async move {
            if let Err(e) = engine.start().await {
                error!(error = %e, "Scheduler engine exited with error");
            }
        });

        self.tasks.lock().await.extend([chain_task, engine_task]);
        info!("Node started");
    }

    /// Stop firing, let in-flight jobs release leadership, then drop registries
    #[instrument(skip(self), fields(node_id = %self.node_id))]
    pub async fn shutdown(&self) {
        info!("Shutting down node");
        if let Err(e) = self.engine.stop().await {
            error!(error = %e, "Scheduler engine did not stop cleanly");
        }
        self.shutdown.cancel();

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                error!(error = %e, "Node task ended abnormally");
            }
        }

        self.repository.clear().await;
        debug!("Schedule repository cleared");
        info!("Node shut down");
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn engine(&self) -> &Arc<SchedulerEngine> {
        &self.engine
    }

    pub fn repository(&self) -> &Arc<ScheduleRepository> {
        &self.repository
    }

    pub fn coordinator(&self) -> &Arc<ChainCoordinator> {
        &self.coordinator
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}
