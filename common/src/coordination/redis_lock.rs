// Redis-backed leadership leases
//
// A term is a key `<prefix>:leader:<resource>` set with NX and a millisecond
// TTL, holding a per-acquisition token. Releasing deletes the key and bumps
// `<prefix>:leader:<resource>:released`; a contender that sees that counter
// move while it waits gives up. The TTL is the backstop when a node dies
// while holding leadership, and expiry does not bump the counter.

use super::{CoordinationService, Lease};
use crate::db::RedisPool;
use crate::errors::LeadershipError;
use async_trait::async_trait;
use rand::Rng;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Returns `{outcome, releases}`; outcome is 1 granted, 0 held, -1 refused.
/// An empty ARGV[3] records the release count on the first attempt.
const ACQUIRE_SCRIPT: &str = r#"
    local releases = redis.call("get", KEYS[2]) or "0"
    if ARGV[3] ~= "" and releases ~= ARGV[3] then
        return {-1, releases}
    end
    if redis.call("set", KEYS[1], ARGV[1], "NX", "PX", ARGV[2]) then
        return {1, releases}
    end
    return {0, releases}
"#;

const RELEASE_SCRIPT: &str = r#"
    if redis.call("get", KEYS[1]) == ARGV[1] then
        redis.call("del", KEYS[1])
        redis.call("incr", KEYS[2])
        return 1
    else
        return 0
    end
"#;

const RENEW_SCRIPT: &str = r#"
    if redis.call("get", KEYS[1]) == ARGV[1] then
        return redis.call("pexpire", KEYS[1], ARGV[2])
    else
        return 0
    end
"#;

pub struct RedisCoordinationService {
    pool: RedisPool,
    node_id: String,
    lease_ttl: Duration,
    retry_interval: Duration,
}

impl RedisCoordinationService {
    pub fn new(
        pool: RedisPool,
        node_id: impl Into<String>,
        lease_ttl: Duration,
        retry_interval: Duration,
    ) -> Self {
        Self {
            pool,
            node_id: node_id.into(),
            lease_ttl,
            retry_interval,
        }
    }

    fn lease_key(&self, resource: &str) -> String {
        self.pool.key(&format!("leader:{}", resource))
    }

    fn releases_key(&self, resource: &str) -> String {
        self.pool.key(&format!("leader:{}:released", resource))
    }

    fn lease_ttl_ms(&self) -> u64 {
        self.lease_ttl.as_millis().max(1) as u64
    }

    /// Retry pause with up to 20% jitter so contenders do not retry in lockstep
    fn retry_pause(&self) -> Duration {
        let base = self.retry_interval.as_millis() as u64;
        let jitter = rand::thread_rng().gen_range(0..=base / 5);
        Duration::from_millis(base + jitter)
    }

    async fn try_acquire_once(
        &self,
        resource: &str,
        token: &str,
        seen_releases: &mut Option<String>,
    ) -> Result<i64, LeadershipError> {
        let mut conn = self.pool.get_connection();

        let (outcome, releases): (i64, String) = redis::Script::new(ACQUIRE_SCRIPT)
            .key(self.lease_key(resource))
            .key(self.releases_key(resource))
            .arg(token)
            .arg(self.lease_ttl_ms())
            .arg(seen_releases.as_deref().unwrap_or(""))
            .invoke_async(&mut conn)
            .await?;

        seen_releases.get_or_insert(releases);
        Ok(outcome)
    }
}

#[async_trait]
impl CoordinationService for RedisCoordinationService {
    #[instrument(skip(self), fields(node_id = %self.node_id, timeout_ms = timeout.as_millis() as u64))]
    async fn acquire_leadership(
        &self,
        resource: &str,
        timeout: Duration,
    ) -> Result<Option<Lease>, LeadershipError> {
        let token = format!("{}:{}", self.node_id, Uuid::new_v4());
        let deadline = Instant::now() + timeout;
        let mut seen_releases = None;
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            match self
                .try_acquire_once(resource, &token, &mut seen_releases)
                .await?
            {
                1 => {
                    info!(attempts, "Leadership acquired");
                    return Ok(Some(Lease::new(resource, token)));
                }
                -1 => {
                    debug!(attempts, "Term released while waiting, cycle already served");
                    return Ok(None);
                }
                _ => {}
            }

            let now = Instant::now();
            if now >= deadline {
                debug!(attempts, "Leadership not granted before timeout");
                return Ok(None);
            }

            sleep(self.retry_pause().min(deadline - now)).await;
        }
    }

    #[instrument(skip(self), fields(node_id = %self.node_id, resource = %lease.resource()))]
    async fn release(&self, lease: &Lease) -> Result<(), LeadershipError> {
        let mut conn = self.pool.get_connection();
        let deleted: i32 = redis::Script::new(RELEASE_SCRIPT)
            .key(self.lease_key(lease.resource()))
            .key(self.releases_key(lease.resource()))
            .arg(lease.token())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| LeadershipError::ReleaseFailed {
                resource: lease.resource().to_string(),
                reason: e.to_string(),
            })?;

        if deleted == 1 {
            debug!("Leadership released");
            Ok(())
        } else {
            Err(LeadershipError::ReleaseFailed {
                resource: lease.resource().to_string(),
                reason: "lease expired or owned by another term".to_string(),
            })
        }
    }

    #[instrument(skip(self), fields(node_id = %self.node_id, resource = %lease.resource()))]
    async fn renew(&self, lease: &Lease) -> Result<(), LeadershipError> {
        let mut conn = self.pool.get_connection();
        let renewed: i32 = redis::Script::new(RENEW_SCRIPT)
            .key(self.lease_key(lease.resource()))
            .arg(lease.token())
            .arg(self.lease_ttl_ms())
            .invoke_async(&mut conn)
            .await?;

        if renewed == 1 {
            debug!(lease_ttl_ms = self.lease_ttl_ms(), "Leadership lease renewed");
            Ok(())
        } else {
            warn!("Lease no longer owned by this term");
            Err(LeadershipError::NotHeld(lease.resource().to_string()))
        }
    }
}
