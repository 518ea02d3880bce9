// Job bodies

use crate::errors::ExecutionError;
use crate::models::{ExecutionStatus, JobCompletion, JobParameters};
use crate::status::StatusReporter;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::process::Command;
use tracing::{info, instrument, warn};

/// Everything a job body gets to see about the current run
#[derive(Clone)]
pub struct JobContext {
    pub job_name: String,
    pub parameters: JobParameters,
    pub fired_at: DateTime<Utc>,
    /// For bodies that complete out of band (`JobCompletion::Detached`)
    pub reporter: Arc<dyn StatusReporter>,
}

#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn run(&self, ctx: &JobContext) -> Result<JobCompletion, ExecutionError>;
}

/// Runs an external program; exit code 0 is `COMPLETED`, anything else `FAILED`.
/// Job parameters are exported as `JOB_PARAM_<NAME>` environment variables.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    program: String,
    args: Vec<String>,
}

impl CommandRunner {
    /// `None` when `command` is empty
    pub fn from_command(command: &[String]) -> Option<Self> {
        let (program, args) = command.split_first()?;
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }
}

fn env_name(key: &str) -> String {
    let sanitized: String = key
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect();
    format!("JOB_PARAM_{}", sanitized)
}

#[async_trait]
impl JobRunner for CommandRunner {
    #[instrument(skip(self, ctx), fields(job_name = %ctx.job_name, program = %self.program))]
    async fn run(&self, ctx: &JobContext) -> Result<JobCompletion, ExecutionError> {
        let mut command = Command::new(&self.program);
        command.args(&self.args).kill_on_drop(true);
        for (key, value) in ctx.parameters.iter() {
            command.env(env_name(key), value);
        }

        let status = command
            .status()
            .await
            .map_err(|e| ExecutionError::SpawnFailed {
                job_name: ctx.job_name.clone(),
                reason: e.to_string(),
            })?;

        if status.success() {
            info!("Command finished successfully");
            Ok(JobCompletion::Finished(ExecutionStatus::Completed))
        } else {
            warn!(exit_code = ?status.code(), "Command exited with failure");
            Ok(JobCompletion::Finished(ExecutionStatus::Failed))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::StatusBoard;

    fn context(params: JobParameters) -> JobContext {
        JobContext {
            job_name: "ingest".to_string(),
            parameters: params,
            fired_at: Utc::now(),
            reporter: Arc::new(StatusBoard::new()),
        }
    }

    #[test]
    fn test_empty_command_has_no_runner() {
        assert!(CommandRunner::from_command(&[]).is_none());
    }

    #[test]
    fn test_env_name_sanitizes_keys() {
        assert_eq!(env_name("jobShard"), "JOB_PARAM_JOBSHARD");
        assert_eq!(env_name("batch.size"), "JOB_PARAM_BATCH_SIZE");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exit_code_maps_to_status() {
        let ok = CommandRunner::from_command(&["true".to_string()]).unwrap();
        assert_eq!(
            ok.run(&context(JobParameters::new("ingest"))).await.unwrap(),
            JobCompletion::Finished(ExecutionStatus::Completed)
        );

        let failing = CommandRunner::from_command(&["false".to_string()]).unwrap();
        assert_eq!(
            failing
                .run(&context(JobParameters::new("ingest")))
                .await
                .unwrap(),
            JobCompletion::Finished(ExecutionStatus::Failed)
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_parameters_are_exported() {
        let runner = CommandRunner::from_command(&[
            "sh".to_string(),
            "-c".to_string(),
            "test \"$JOB_PARAM_JOBSHARD\" = ingest-shard-1".to_string(),
        ])
        .unwrap();
        let params = JobParameters::new("ingest").with_shard("ingest-shard-1");

        assert_eq!(
            runner.run(&context(params)).await.unwrap(),
            JobCompletion::Finished(ExecutionStatus::Completed)
        );
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let runner =
            CommandRunner::from_command(&["definitely-not-a-real-binary-xyz".to_string()]).unwrap();
        let err = runner
            .run(&context(JobParameters::new("ingest")))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::SpawnFailed { .. }));
    }
}
