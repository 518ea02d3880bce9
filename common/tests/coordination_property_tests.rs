// Property-based tests for leadership coordination and the leader election gate

use async_trait::async_trait;
use common::coordination::{CoordinationService, InMemoryCoordinationService, LeaderRegistry};
use common::errors::ExecutionError;
use common::gate::{GateConfig, GateOutcome, JobInvocation, LeaderElectionGate};
use common::models::{ExecutionStatus, JobShardKey};
use common::status::{CompletionWaiter, StatusBoard};
use futures::future::join_all;
use proptest::prelude::*;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn paused_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .start_paused(true)
        .build()
        .unwrap()
}

fn contenders(
    registry: &LeaderRegistry,
    count: usize,
    ttl: Duration,
) -> Vec<Arc<InMemoryCoordinationService>> {
    (0..count)
        .map(|i| {
            Arc::new(InMemoryCoordinationService::with_registry(
                registry.clone(),
                format!("node-{}", i),
                ttl,
            ))
        })
        .collect()
}

#[derive(Debug, Clone, Copy)]
enum BodyOutcome {
    Completes,
    Fails,
    Panics,
    NeverReports,
}

fn body_outcome() -> impl Strategy<Value = BodyOutcome> {
    prop_oneof![
        Just(BodyOutcome::Completes),
        Just(BodyOutcome::Fails),
        Just(BodyOutcome::Panics),
        Just(BodyOutcome::NeverReports),
    ]
}

struct ScriptedJob {
    board: StatusBoard,
    outcome: BodyOutcome,
    calls: AtomicU32,
}

#[async_trait]
impl JobInvocation for ScriptedJob {
    fn job_name(&self) -> &str {
        "ingest"
    }

    async fn invoke(&self) -> Result<(), ExecutionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.outcome {
            BodyOutcome::Completes => {
                self.board.set("ingest", ExecutionStatus::Completed).await;
                Ok(())
            }
            BodyOutcome::Fails => {
                self.board.set("ingest", ExecutionStatus::Failed).await;
                Err(ExecutionError::JobFailed {
                    job_name: "ingest".to_string(),
                    reason: "upstream unavailable".to_string(),
                })
            }
            BodyOutcome::Panics => panic!("ingest body panicked"),
            BodyOutcome::NeverReports => Ok(()),
        }
    }
}

fn gate(service: Arc<InMemoryCoordinationService>, board: &StatusBoard) -> LeaderElectionGate {
    LeaderElectionGate::new(
        service,
        CompletionWaiter::new(Arc::new(board.clone()), Some(Duration::from_secs(10))),
        GateConfig {
            poll_interval: Duration::from_millis(1_000),
            renew_interval: Duration::from_millis(5_000),
        },
    )
}

/// **Property: Mutual exclusion**
///
/// *For any* number of nodes racing for the same shard key, exactly one of
/// them is granted leadership.
#[test]
fn property_mutual_exclusion_single_grant() {
    proptest!(|(
        count in 2usize..8,
        ttl_ms in 1_000u64..60_000u64
    )| {
        let granted = paused_runtime().block_on(async {
            let registry = LeaderRegistry::new();
            let services = contenders(&registry, count, Duration::from_millis(ttl_ms));

            let results = join_all(
                services
                    .iter()
                    .map(|s| s.acquire_leadership("ingest-shard-1", Duration::ZERO)),
            )
            .await;

            results.into_iter().filter(|r| matches!(r, Ok(Some(_)))).count()
        });

        prop_assert_eq!(granted, 1);
    });
}

/// **Property: One grant per cycle**
///
/// *For any* set of nodes queueing on one shard key with a timeout long
/// enough to outlast the leader's term, only the leader runs: once its term
/// is released, every node that was already waiting is refused.
#[test]
fn property_waiting_contenders_refused_after_release() {
    proptest!(|(
        count in 2usize..6,
        hold_ms in 10u64..2_000u64
    )| {
        let (grants, holder_after) = paused_runtime().block_on(async {
            let registry = LeaderRegistry::new();
            let services = contenders(&registry, count, Duration::from_secs(600));
            let timeout = Duration::from_millis(hold_ms * count as u64 * 2);

            let runs = services.into_iter().map(|service| async move {
                let Some(lease) = service
                    .acquire_leadership("ingest-shard-1", timeout)
                    .await
                    .unwrap()
                else {
                    return false;
                };
                tokio::time::sleep(Duration::from_millis(hold_ms)).await;
                service.release(&lease).await.unwrap();
                true
            });

            let grants = join_all(runs).await.into_iter().filter(|g| *g).count();
            (grants, registry.holder("ingest-shard-1").await)
        });

        prop_assert_eq!(grants, 1);
        prop_assert_eq!(holder_after, None);
    });
}

/// **Property: A dead leader is replaced**
///
/// *For any* lease TTL shorter than the waiting timeout, a contender takes
/// over once the leader's lease expires without a release.
#[test]
fn property_expired_term_is_taken_over() {
    proptest!(|(ttl_ms in 100u64..5_000u64)| {
        let (taken_over, holder) = paused_runtime().block_on(async {
            let registry = LeaderRegistry::new();
            let services = contenders(&registry, 2, Duration::from_millis(ttl_ms));
            let _abandoned = services[0]
                .acquire_leadership("ingest-shard-1", Duration::ZERO)
                .await
                .unwrap();

            let lease = services[1]
                .acquire_leadership("ingest-shard-1", Duration::from_millis(ttl_ms * 2))
                .await
                .unwrap();
            (lease.is_some(), registry.holder("ingest-shard-1").await)
        });

        prop_assert!(taken_over);
        prop_assert_eq!(holder.as_deref(), Some("node-1"));
    });
}

/// **Property: Release always**
///
/// *For any* outcome of the job body (success, error, panic, or no terminal
/// status before the wait times out), leadership is released once the gate
/// returns and another node can take it immediately.
#[test]
fn property_release_always() {
    proptest!(|(outcome in body_outcome())| {
        let (result, holder, next_granted, calls) = paused_runtime().block_on(async {
            let registry = LeaderRegistry::new();
            let services = contenders(&registry, 2, Duration::from_secs(30));
            let board = StatusBoard::new();
            let job = ScriptedJob {
                board: board.clone(),
                outcome,
                calls: AtomicU32::new(0),
            };

            let result = gate(services[0].clone(), &board)
                .execute(
                    &job,
                    &JobShardKey::resolve("ingest", Some("ingest-shard-1")),
                    Duration::from_secs(60),
                )
                .await;

            let holder = registry.holder("ingest-shard-1").await;
            let next_granted = services[1]
                .acquire_leadership("ingest-shard-1", Duration::ZERO)
                .await
                .unwrap();
            (result, holder, next_granted, job.calls.load(Ordering::SeqCst))
        });

        prop_assert!(matches!(result, GateOutcome::Executed { .. }), "expected GateOutcome::Executed, got {:?}", result);
        prop_assert_eq!(holder, None);
        prop_assert!(next_granted.is_some());
        prop_assert_eq!(calls, 1);

        let expected = match outcome {
            BodyOutcome::Completes => Some(ExecutionStatus::Completed),
            BodyOutcome::Fails => Some(ExecutionStatus::Failed),
            BodyOutcome::Panics | BodyOutcome::NeverReports => None,
        };
        prop_assert_eq!(result, GateOutcome::Executed { status: expected });
    });
}

/// **Property: Self-healing skip**
///
/// *For any* acquisition timeout shorter than the current holder's lease, the
/// gate skips the cycle without invoking the job and without disturbing the
/// holder.
#[test]
fn property_skip_when_leadership_held_elsewhere() {
    proptest!(|(timeout_ms in 0u64..5_000u64)| {
        let (result, calls, holder) = paused_runtime().block_on(async {
            let registry = LeaderRegistry::new();
            let services = contenders(&registry, 2, Duration::from_secs(30));
            services[1]
                .acquire_leadership("ingest-shard-1", Duration::ZERO)
                .await
                .unwrap();

            let board = StatusBoard::new();
            let job = ScriptedJob {
                board: board.clone(),
                outcome: BodyOutcome::Completes,
                calls: AtomicU32::new(0),
            };
            let result = gate(services[0].clone(), &board)
                .execute(
                    &job,
                    &JobShardKey::resolve("ingest", Some("ingest-shard-1")),
                    Duration::from_millis(timeout_ms),
                )
                .await;

            (
                result,
                job.calls.load(Ordering::SeqCst),
                registry.holder("ingest-shard-1").await,
            )
        });

        prop_assert_eq!(result, GateOutcome::Skipped);
        prop_assert_eq!(calls, 0);
        prop_assert_eq!(holder.as_deref(), Some("node-1"));
    });
}

/// **Property: Shard keys are independent**
///
/// *For any* two distinct shard keys, leadership of one does not block the
/// other.
#[test]
fn property_distinct_shards_do_not_contend() {
    proptest!(|(
        first in "[a-z]{1,8}-shard-[0-9]",
        second in "[a-z]{1,8}-shard-[0-9]"
    )| {
        prop_assume!(first != second);
        let (a, b) = paused_runtime().block_on(async {
            let registry = LeaderRegistry::new();
            let services = contenders(&registry, 2, Duration::from_secs(30));
            let a = services[0].acquire_leadership(&first, Duration::ZERO).await.unwrap();
            let b = services[1].acquire_leadership(&second, Duration::ZERO).await.unwrap();
            (a, b)
        });
        prop_assert!(a.is_some() && b.is_some());
    });
}
