// Error handling framework for job coordination

use thiserror::Error;

/// Schedule-related errors
#[derive(Error, Debug)]
pub enum ScheduleError {
    #[error("Invalid cron expression '{expression}': {reason}")]
    InvalidCronExpression { expression: String, reason: String },

    #[error("Invalid timezone: {0}")]
    InvalidTimezone(String),
}

/// Leadership (distributed mutual exclusion) errors
#[derive(Error, Debug)]
pub enum LeadershipError {
    #[error("Leadership for '{resource}' not granted within {timeout_ms} ms")]
    AcquisitionTimeout { resource: String, timeout_ms: u64 },

    #[error("Leadership for '{0}' is not held by this node")]
    NotHeld(String),

    #[error("Failed to release leadership for '{resource}': {reason}")]
    ReleaseFailed { resource: String, reason: String },

    #[error("Redis error: {0}")]
    Redis(String),
}

/// Job execution errors
#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Job '{job_name}' failed: {reason}")]
    JobFailed { job_name: String, reason: String },

    #[error("Job '{0}' panicked")]
    Panicked(String),

    #[error("Failed to spawn command for job '{job_name}': {reason}")]
    SpawnFailed { job_name: String, reason: String },
}

/// Errors raised while loading job definitions and wiring triggers.
/// All of them are fatal at startup.
#[derive(Error, Debug)]
pub enum RegistrationError {
    #[error("Chain trigger for job '{0}' requires a followJob")]
    MissingFollowJob(String),

    #[error("Job '{job}' follows unknown job '{follow_job}'")]
    UnknownPredecessor { job: String, follow_job: String },

    #[error("Job chain contains a cycle: {0}")]
    ChainCycle(String),

    #[error("Job '{job}' has an invalid trigger: {reason}")]
    InvalidTrigger { job: String, reason: String },

    #[error("Job '{0}' is defined more than once")]
    DuplicateJob(String),

    #[error("Job '{job}' sets jobName parameter to '{parameter}'")]
    ConflictingJobName { job: String, parameter: String },

    #[error("No runner available for job '{0}'")]
    MissingRunner(String),

    #[error(transparent)]
    Schedule(#[from] ScheduleError),
}

/// Status channel errors
#[derive(Error, Debug)]
pub enum StatusError {
    #[error("Unknown execution status: {0}")]
    UnknownStatus(String),

    #[error("Status channel unavailable: {0}")]
    Unavailable(String),
}

/// Completion wait errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum WaitError {
    #[error("Job '{job_name}' did not reach a terminal status within {timeout_ms} ms")]
    Timeout { job_name: String, timeout_ms: u64 },

    #[error("Wait for job '{0}' cancelled by shutdown")]
    Cancelled(String),
}

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Redis error: {0}")]
    RedisError(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
}

impl From<redis::RedisError> for StorageError {
    fn from(err: redis::RedisError) -> Self {
        StorageError::RedisError(err.to_string())
    }
}

impl From<redis::RedisError> for LeadershipError {
    fn from(err: redis::RedisError) -> Self {
        LeadershipError::Redis(err.to_string())
    }
}

impl From<redis::RedisError> for StatusError {
    fn from(err: redis::RedisError) -> Self {
        StatusError::Unavailable(err.to_string())
    }
}
