// Blocks the leader until the job it launched reaches a terminal status

use super::StatusChannel;
use crate::errors::WaitError;
use crate::models::ExecutionStatus;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace, warn};

/// Polls a [`StatusChannel`] until a job reports a terminal status.
///
/// The wait is bounded by `wait_timeout` when set and always ends early when
/// the shutdown token is cancelled.
#[derive(Clone)]
pub struct CompletionWaiter {
    channel: Arc<dyn StatusChannel>,
    wait_timeout: Option<Duration>,
    shutdown: CancellationToken,
}

impl CompletionWaiter {
    pub fn new(channel: Arc<dyn StatusChannel>, wait_timeout: Option<Duration>) -> Self {
        Self {
            channel,
            wait_timeout,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn wait_timeout(&self) -> Option<Duration> {
        self.wait_timeout
    }

    /// Sleep `poll_interval`, check the channel, repeat until `job_name` is
    /// terminal. Channel read failures are logged and polling continues.
    #[instrument(skip(self), fields(poll_interval_ms = poll_interval.as_millis() as u64))]
    pub async fn await_terminal(
        &self,
        job_name: &str,
        poll_interval: Duration,
    ) -> Result<ExecutionStatus, WaitError> {
        let poll = self.poll_until_terminal(job_name, poll_interval);

        let bounded = async {
            match self.wait_timeout {
                Some(limit) => tokio::time::timeout(limit, poll).await.map_err(|_| {
                    WaitError::Timeout {
                        job_name: job_name.to_string(),
                        timeout_ms: limit.as_millis() as u64,
                    }
                }),
                None => Ok(poll.await),
            }
        };

        tokio::select! {
            result = bounded => {
                if let Err(e) = &result {
                    warn!(error = %e, "Gave up waiting for terminal status");
                }
                result
            }
            _ = self.shutdown.cancelled() => {
                warn!("Completion wait cancelled by shutdown");
                Err(WaitError::Cancelled(job_name.to_string()))
            }
        }
    }

    async fn poll_until_terminal(&self, job_name: &str, poll_interval: Duration) -> ExecutionStatus {
        let mut checks = 0u32;
        loop {
            sleep(poll_interval).await;
            checks += 1;

            match self.channel.last_known().await {
                Ok(statuses) => match statuses.get(job_name) {
                    Some(status) if status.is_terminal() => {
                        debug!(checks, status = %status, "Terminal status observed");
                        return *status;
                    }
                    Some(status) => trace!(checks, status = %status, "Job still running"),
                    None => trace!(checks, "No status reported yet"),
                },
                Err(e) => warn!(checks, error = %e, "Status channel read failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::StatusError;
    use crate::status::StatusBoard;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Status channel that starts failing and recovers after `failures` reads
    struct FlakyChannel {
        inner: StatusBoard,
        failures: u32,
        reads: AtomicU32,
    }

    #[async_trait]
    impl StatusChannel for FlakyChannel {
        async fn last_known(&self) -> Result<HashMap<String, ExecutionStatus>, StatusError> {
            let read = self.reads.fetch_add(1, Ordering::SeqCst);
            if read < self.failures {
                return Err(StatusError::Unavailable("connection reset".into()));
            }
            self.inner.last_known().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_returns_terminal_status() {
        let board = StatusBoard::new();
        board.set("ingest", ExecutionStatus::Failed).await;
        let waiter = CompletionWaiter::new(Arc::new(board), None);

        let status = waiter
            .await_terminal("ingest", Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(status, ExecutionStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ignores_other_jobs_and_running() {
        let board = StatusBoard::new();
        board.set("ingest", ExecutionStatus::Running).await;
        board.set("other", ExecutionStatus::Completed).await;
        let waiter = CompletionWaiter::new(Arc::new(board.clone()), None);

        let writer = board.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(2500)).await;
            writer.set("ingest", ExecutionStatus::Stopped).await;
        });

        let started = tokio::time::Instant::now();
        let status = waiter
            .await_terminal("ingest", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(status, ExecutionStatus::Stopped);
        assert_eq!(started.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out_when_never_terminal() {
        let board = StatusBoard::new();
        board.set("ingest", ExecutionStatus::Running).await;
        let waiter = CompletionWaiter::new(Arc::new(board), Some(Duration::from_secs(5)));

        let err = waiter
            .await_terminal("ingest", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            WaitError::Timeout {
                job_name: "ingest".to_string(),
                timeout_ms: 5000
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_by_shutdown() {
        let shutdown = CancellationToken::new();
        let waiter = CompletionWaiter::new(Arc::new(StatusBoard::new()), None)
            .with_shutdown(shutdown.clone());

        let handle = tokio::spawn(async move {
            waiter
                .await_terminal("ingest", Duration::from_secs(1))
                .await
        });
        sleep(Duration::from_secs(3)).await;
        shutdown.cancel();

        assert_eq!(
            handle.await.unwrap(),
            Err(WaitError::Cancelled("ingest".to_string()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_keeps_polling_through_channel_errors() {
        let board = StatusBoard::new();
        board.set("ingest", ExecutionStatus::Completed).await;
        let channel = Arc::new(FlakyChannel {
            inner: board,
            failures: 3,
            reads: AtomicU32::new(0),
        });
        let waiter = CompletionWaiter::new(channel.clone(), None);

        let status = waiter
            .await_terminal("ingest", Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(status, ExecutionStatus::Completed);
        assert_eq!(channel.reads.load(Ordering::SeqCst), 4);
    }
}
