use crate::errors::StatusError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Job parameter carrying the optional shard hint
pub const PARAM_JOB_SHARD: &str = "jobShard";

/// Job parameter carrying the canonical job name
pub const PARAM_JOB_NAME: &str = "jobName";

// ============================================================================
// Execution status
// ============================================================================

/// ExecutionStatus as reported by the execution framework
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
    Stopped,
    Abandoned,
}

impl ExecutionStatus {
    /// Every status except `Running` is terminal
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Running => "RUNNING",
            ExecutionStatus::Completed => "COMPLETED",
            ExecutionStatus::Failed => "FAILED",
            ExecutionStatus::Stopped => "STOPPED",
            ExecutionStatus::Abandoned => "ABANDONED",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = StatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "RUNNING" => Ok(ExecutionStatus::Running),
            "COMPLETED" => Ok(ExecutionStatus::Completed),
            "FAILED" => Ok(ExecutionStatus::Failed),
            "STOPPED" => Ok(ExecutionStatus::Stopped),
            "ABANDONED" => Ok(ExecutionStatus::Abandoned),
            other => Err(StatusError::UnknownStatus(other.to_string())),
        }
    }
}

// ============================================================================
// Shard key & parameters
// ============================================================================

/// Resource name used for the distributed lock of a job (or job shard)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobShardKey(String);

impl JobShardKey {
    /// Explicit shard hint if present and non-blank, otherwise the job name.
    /// The fallback makes the whole job single-instance across the cluster.
    pub fn resolve(job_name: &str, shard_hint: Option<&str>) -> Self {
        match shard_hint.map(str::trim) {
            Some(hint) if !hint.is_empty() => Self(hint.to_string()),
            _ => Self(job_name.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobShardKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Parameters handed to a job definition by the scheduler engine
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobParameters {
    values: HashMap<String, String>,
}

impl JobParameters {
    pub fn new(job_name: impl Into<String>) -> Self {
        let mut values = HashMap::new();
        values.insert(PARAM_JOB_NAME.to_string(), job_name.into());
        Self { values }
    }

    pub fn with_shard(mut self, shard: impl Into<String>) -> Self {
        self.values.insert(PARAM_JOB_SHARD.to_string(), shard.into());
        self
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Canonical job name
    pub fn job_name(&self) -> Option<&str> {
        self.get(PARAM_JOB_NAME)
    }

    pub fn job_shard(&self) -> Option<&str> {
        self.get(PARAM_JOB_SHARD)
    }

    /// Shard key for leadership, falling back to `fallback_name` when neither
    /// a shard hint nor a canonical name is present
    pub fn shard_key(&self, fallback_name: &str) -> JobShardKey {
        let name = self.job_name().unwrap_or(fallback_name);
        JobShardKey::resolve(name, self.job_shard())
    }
}

// ============================================================================
// Completion
// ============================================================================

/// Emitted by the execution framework when a job reaches a terminal status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionEvent {
    pub job_name: String,
    pub status: ExecutionStatus,
}

impl CompletionEvent {
    pub fn new(job_name: impl Into<String>, status: ExecutionStatus) -> Self {
        Self {
            job_name: job_name.into(),
            status,
        }
    }
}

/// What a job body reports once it returns control
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobCompletion {
    /// The body ran to the given status; the engine reports it
    Finished(ExecutionStatus),
    /// Execution continues out of band and the body reports its own status
    Detached,
}
