// Leader election gate: acquire → run → await terminal status → release

use crate::coordination::{CoordinationService, Lease};
use crate::errors::{ExecutionError, LeadershipError};
use crate::models::{ExecutionStatus, JobShardKey};
use crate::status::CompletionWaiter;
use async_trait::async_trait;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

/// Default leadership acquisition timeout
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_millis(60_000);

/// A single job invocation guarded by the gate
#[async_trait]
pub trait JobInvocation: Send + Sync {
    fn job_name(&self) -> &str;

    async fn invoke(&self) -> Result<(), ExecutionError>;
}

/// What happened to one pass through the gate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateOutcome {
    /// Leadership not granted; another node owns this cycle
    Skipped,
    /// Ran as leader. `status` is the observed terminal status, or `None`
    /// when the completion wait timed out or was cancelled.
    Executed { status: Option<ExecutionStatus> },
}

#[derive(Debug, Clone)]
pub struct GateConfig {
    pub poll_interval: Duration,
    pub renew_interval: Duration,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1_000),
            renew_interval: Duration::from_millis(10_000),
        }
    }
}

/// Wraps job invocations with distributed mutual exclusion keyed by shard
pub struct LeaderElectionGate {
    service: Arc<dyn CoordinationService>,
    waiter: CompletionWaiter,
    config: GateConfig,
}

impl LeaderElectionGate {
    pub fn new(
        service: Arc<dyn CoordinationService>,
        waiter: CompletionWaiter,
        config: GateConfig,
    ) -> Self {
        Self {
            service,
            waiter,
            config,
        }
    }

    /// Run `invocation` only if this node obtains leadership for `shard_key`
    /// within `acquire_timeout`.
    ///
    /// Never returns an error: a missed acquisition is skipped until the next
    /// fire, body failures and release failures are logged. Leadership is
    /// released exactly once per successful acquisition.
    #[instrument(
        skip(self, invocation),
        fields(job_name = %invocation.job_name(), shard_key = %shard_key, acquire_timeout_ms = acquire_timeout.as_millis() as u64)
    )]
    pub async fn execute(
        &self,
        invocation: &dyn JobInvocation,
        shard_key: &JobShardKey,
        acquire_timeout: Duration,
    ) -> GateOutcome {
        let granted = match self
            .service
            .acquire_leadership(shard_key.as_str(), acquire_timeout)
            .await
        {
            Ok(granted) => granted,
            Err(e) => {
                warn!(error = %e, "Leadership request failed, skipping this cycle");
                None
            }
        };

        let Some(lease) = granted else {
            let reason = LeadershipError::AcquisitionTimeout {
                resource: shard_key.to_string(),
                timeout_ms: acquire_timeout.as_millis() as u64,
            };
            info!(reason = %reason, "Skipping this cycle");
            return GateOutcome::Skipped;
        };

        let guard = LeadershipGuard::new(self.service.clone(), lease, self.config.renew_interval);

        match AssertUnwindSafe(invocation.invoke()).catch_unwind().await {
            Ok(Ok(())) => debug!("Job body returned"),
            Ok(Err(e)) => error!(error = %e, "Job body failed"),
            Err(_) => error!("Job body panicked"),
        }

        let status = self
            .waiter
            .await_terminal(invocation.job_name(), self.config.poll_interval)
            .await
            .ok();

        guard.release().await;

        GateOutcome::Executed { status }
    }
}

/// Holds one term of leadership and keeps its lease alive.
///
/// `release` is the normal path; if the owning future is dropped before
/// that, the drop handler releases in the background.
struct LeadershipGuard {
    service: Arc<dyn CoordinationService>,
    lease: Lease,
    renewal: Option<JoinHandle<()>>,
    released: bool,
}

impl LeadershipGuard {
    fn new(service: Arc<dyn CoordinationService>, lease: Lease, renew_interval: Duration) -> Self {
        let renewal = (!renew_interval.is_zero()).then(|| {
            let service = service.clone();
            let lease = lease.clone();
            tokio::spawn(async move {
                let mut ticker = interval_at(Instant::now() + renew_interval, renew_interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    if let Err(e) = service.renew(&lease).await {
                        warn!(shard_key = %lease, error = %e, "Failed to renew leadership lease");
                    }
                }
            })
        });

        Self {
            service,
            lease,
            renewal,
            released: false,
        }
    }

    fn stop_renewal(&mut self) {
        if let Some(renewal) = self.renewal.take() {
            renewal.abort();
        }
    }

    async fn release(mut self) {
        self.released = true;
        self.stop_renewal();

        match self.service.release(&self.lease).await {
            Ok(()) => debug!("Leadership released"),
            Err(e) => warn!(
                error = %e,
                "Failed to release leadership; lease expiry will reclaim it"
            ),
        }
    }
}

impl Drop for LeadershipGuard {
    fn drop(&mut self) {
        self.stop_renewal();
        if self.released {
            return;
        }

        let service = self.service.clone();
        let lease = self.lease.clone();
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                if let Err(e) = service.release(&lease).await {
                    warn!(shard_key = %lease, error = %e, "Failed to release leadership on drop");
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::MockCoordinationService;
    use crate::status::StatusBoard;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingJob {
        name: String,
        board: StatusBoard,
        calls: AtomicU32,
        fail: bool,
    }

    impl CountingJob {
        fn new(name: &str, board: StatusBoard, fail: bool) -> Self {
            Self {
                name: name.to_string(),
                board,
                calls: AtomicU32::new(0),
                fail,
            }
        }
    }

    #[async_trait]
    impl JobInvocation for CountingJob {
        fn job_name(&self) -> &str {
            &self.name
        }

        async fn invoke(&self) -> Result<(), ExecutionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                self.board.set(&self.name, ExecutionStatus::Failed).await;
                return Err(ExecutionError::JobFailed {
                    job_name: self.name.clone(),
                    reason: "boom".to_string(),
                });
            }
            self.board.set(&self.name, ExecutionStatus::Completed).await;
            Ok(())
        }
    }

    struct PanickingJob;

    #[async_trait]
    impl JobInvocation for PanickingJob {
        fn job_name(&self) -> &str {
            "panics"
        }

        async fn invoke(&self) -> Result<(), ExecutionError> {
            panic!("job body exploded");
        }
    }

    fn gate(service: MockCoordinationService, board: &StatusBoard) -> LeaderElectionGate {
        LeaderElectionGate::new(
            Arc::new(service),
            CompletionWaiter::new(Arc::new(board.clone()), Some(Duration::from_secs(5))),
            GateConfig {
                poll_interval: Duration::from_millis(100),
                renew_interval: Duration::ZERO,
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_granted_runs_job_and_releases_once() {
        let mut service = MockCoordinationService::new();
        service
            .expect_acquire_leadership()
            .withf(|resource, timeout| {
                resource == "ingest-shard-1" && *timeout == DEFAULT_ACQUIRE_TIMEOUT
            })
            .times(1)
            .returning(|resource, _| Ok(Some(Lease::new(resource, "node-a:1"))));
        service
            .expect_release()
            .withf(|lease| lease.resource() == "ingest-shard-1" && lease.token() == "node-a:1")
            .times(1)
            .returning(|_| Ok(()));

        let board = StatusBoard::new();
        let job = CountingJob::new("ingest", board.clone(), false);
        let outcome = gate(service, &board)
            .execute(
                &job,
                &JobShardKey::resolve("ingest", Some("ingest-shard-1")),
                DEFAULT_ACQUIRE_TIMEOUT,
            )
            .await;

        assert_eq!(
            outcome,
            GateOutcome::Executed {
                status: Some(ExecutionStatus::Completed)
            }
        );
        assert_eq!(job.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_granted_skips_without_invoking() {
        let mut service = MockCoordinationService::new();
        service
            .expect_acquire_leadership()
            .times(1)
            .returning(|_, _| Ok(None));
        service.expect_release().never();

        let board = StatusBoard::new();
        let job = CountingJob::new("ingest", board.clone(), false);
        let outcome = gate(service, &board)
            .execute(
                &job,
                &JobShardKey::resolve("ingest", None),
                Duration::from_millis(10),
            )
            .await;

        assert_eq!(outcome, GateOutcome::Skipped);
        assert_eq!(job.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_error_is_treated_as_skip() {
        let mut service = MockCoordinationService::new();
        service
            .expect_acquire_leadership()
            .returning(|_, _| Err(LeadershipError::Redis("connection refused".into())));
        service.expect_release().never();

        let board = StatusBoard::new();
        let job = CountingJob::new("ingest", board.clone(), false);
        let outcome = gate(service, &board)
            .execute(&job, &JobShardKey::resolve("ingest", None), Duration::ZERO)
            .await;

        assert_eq!(outcome, GateOutcome::Skipped);
        assert_eq!(job.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_job_still_releases() {
        let mut service = MockCoordinationService::new();
        service
            .expect_acquire_leadership()
            .returning(|resource, _| Ok(Some(Lease::new(resource, "node-a:1"))));
        service.expect_release().times(1).returning(|_| Ok(()));

        let board = StatusBoard::new();
        let job = CountingJob::new("ingest", board.clone(), true);
        let outcome = gate(service, &board)
            .execute(&job, &JobShardKey::resolve("ingest", None), Duration::ZERO)
            .await;

        assert_eq!(
            outcome,
            GateOutcome::Executed {
                status: Some(ExecutionStatus::Failed)
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_job_still_releases() {
        let mut service = MockCoordinationService::new();
        service
            .expect_acquire_leadership()
            .returning(|resource, _| Ok(Some(Lease::new(resource, "node-a:1"))));
        service.expect_release().times(1).returning(|_| Ok(()));

        let board = StatusBoard::new();
        let outcome = gate(service, &board)
            .execute(
                &PanickingJob,
                &JobShardKey::resolve("panics", None),
                Duration::ZERO,
            )
            .await;

        // nobody reported a status, so the bounded wait gives up
        assert_eq!(outcome, GateOutcome::Executed { status: None });
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_failure_is_not_retried() {
        let mut service = MockCoordinationService::new();
        service
            .expect_acquire_leadership()
            .returning(|resource, _| Ok(Some(Lease::new(resource, "node-a:1"))));
        service.expect_release().times(1).returning(|lease| {
            Err(LeadershipError::ReleaseFailed {
                resource: lease.resource().to_string(),
                reason: "connection reset".to_string(),
            })
        });

        let board = StatusBoard::new();
        let job = CountingJob::new("ingest", board.clone(), false);
        let outcome = gate(service, &board)
            .execute(&job, &JobShardKey::resolve("ingest", None), Duration::ZERO)
            .await;

        assert_eq!(
            outcome,
            GateOutcome::Executed {
                status: Some(ExecutionStatus::Completed)
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_renewed_while_job_runs() {
        let mut service = MockCoordinationService::new();
        service
            .expect_acquire_leadership()
            .returning(|resource, _| Ok(Some(Lease::new(resource, "node-a:1"))));
        service.expect_renew().times(2..).returning(|_| Ok(()));
        service.expect_release().times(1).returning(|_| Ok(()));

        let board = StatusBoard::new();
        let writer = board.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(3500)).await;
            writer.set("slow", ExecutionStatus::Completed).await;
        });

        let gate = LeaderElectionGate::new(
            Arc::new(service),
            CompletionWaiter::new(Arc::new(board.clone()), None),
            GateConfig {
                poll_interval: Duration::from_millis(500),
                renew_interval: Duration::from_secs(1),
            },
        );

        let job = CountingJob::new("slow", StatusBoard::new(), false);
        let outcome = gate
            .execute(&job, &JobShardKey::resolve("slow", None), Duration::ZERO)
            .await;

        assert_eq!(
            outcome,
            GateOutcome::Executed {
                status: Some(ExecutionStatus::Completed)
            }
        );
    }
}
