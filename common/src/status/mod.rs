// Out-of-band job status channel
//
// The execution framework writes the last known status of each job; the
// completion waiter polls it. Reads are pull-based, there is no push.

pub mod board;
pub mod redis_channel;
pub mod waiter;

pub use self::board::StatusBoard;
pub use self::redis_channel::RedisStatusChannel;
pub use self::waiter::CompletionWaiter;

use crate::errors::StatusError;
use crate::models::ExecutionStatus;
use async_trait::async_trait;
use std::collections::HashMap;

/// Read side: last known `(job_name, status)` pairs
#[async_trait]
pub trait StatusChannel: Send + Sync {
    async fn last_known(&self) -> Result<HashMap<String, ExecutionStatus>, StatusError>;
}

/// Write side, used by the execution path
#[async_trait]
pub trait StatusReporter: Send + Sync {
    async fn report(&self, job_name: &str, status: ExecutionStatus) -> Result<(), StatusError>;
}
