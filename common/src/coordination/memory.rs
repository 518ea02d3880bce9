// In-process leadership registry
//
// Used for single-node deployments and for simulating several nodes inside
// one process: every `InMemoryCoordinationService` built from the same
// `LeaderRegistry` contends for the same leases under its own node id.

use super::{CoordinationService, Lease};
use crate::errors::LeadershipError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, instrument};
use uuid::Uuid;

#[derive(Debug, Clone)]
struct Term {
    owner: String,
    token: String,
    expires_at: Instant,
}

/// Per-resource state: the live term, and how many terms were released
#[derive(Debug, Default)]
struct Slot {
    term: Option<Term>,
    releases: u64,
}

impl Slot {
    fn live_term(&self, now: Instant) -> Option<&Term> {
        self.term.as_ref().filter(|term| term.expires_at > now)
    }
}

#[derive(Debug, Default)]
struct RegistryInner {
    slots: Mutex<HashMap<String, Slot>>,
    released: Notify,
}

/// Shared lease table, cheap to clone
#[derive(Debug, Clone, Default)]
pub struct LeaderRegistry {
    inner: Arc<RegistryInner>,
}

impl LeaderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current unexpired holder of `resource`
    pub async fn holder(&self, resource: &str) -> Option<String> {
        let slots = self.inner.slots.lock().await;
        slots
            .get(resource)
            .and_then(|slot| slot.live_term(Instant::now()))
            .map(|term| term.owner.clone())
    }
}

enum Attempt {
    Granted(Lease),
    Refused,
    HeldUntil(Instant),
}

pub struct InMemoryCoordinationService {
    registry: LeaderRegistry,
    node_id: String,
    lease_ttl: Duration,
}

impl InMemoryCoordinationService {
    /// Standalone service with a private registry
    pub fn new(node_id: impl Into<String>, lease_ttl: Duration) -> Self {
        Self::with_registry(LeaderRegistry::new(), node_id, lease_ttl)
    }

    /// Service contending on a registry shared with other simulated nodes
    pub fn with_registry(
        registry: LeaderRegistry,
        node_id: impl Into<String>,
        lease_ttl: Duration,
    ) -> Self {
        Self {
            registry,
            node_id: node_id.into(),
            lease_ttl,
        }
    }

    pub fn registry(&self) -> LeaderRegistry {
        self.registry.clone()
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// One look at the slot. `seen_releases` is the release count observed
    /// on the first look; a higher count means a term ended while we waited.
    async fn attempt(&self, resource: &str, seen_releases: &mut Option<u64>) -> Attempt {
        let mut slots = self.registry.inner.slots.lock().await;
        let slot = slots.entry(resource.to_string()).or_default();
        let now = Instant::now();
        let first_look = *seen_releases.get_or_insert(slot.releases);

        if let Some(term) = slot.live_term(now) {
            return Attempt::HeldUntil(term.expires_at);
        }
        if slot.releases != first_look {
            return Attempt::Refused;
        }

        let token = format!("{}:{}", self.node_id, Uuid::new_v4());
        slot.term = Some(Term {
            owner: self.node_id.clone(),
            token: token.clone(),
            expires_at: now + self.lease_ttl,
        });
        Attempt::Granted(Lease::new(resource, token))
    }
}

#[async_trait]
impl CoordinationService for InMemoryCoordinationService {
    #[instrument(skip(self), fields(node_id = %self.node_id))]
    async fn acquire_leadership(
        &self,
        resource: &str,
        timeout: Duration,
    ) -> Result<Option<Lease>, LeadershipError> {
        let deadline = Instant::now() + timeout;
        let mut seen_releases = None;

        loop {
            // register interest before inspecting the table so a release in
            // between is not missed
            let released = self.registry.inner.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            let expires_at = match self.attempt(resource, &mut seen_releases).await {
                Attempt::Granted(lease) => {
                    debug!("Leadership acquired");
                    return Ok(Some(lease));
                }
                Attempt::Refused => {
                    debug!("Term released while waiting, cycle already served");
                    return Ok(None);
                }
                Attempt::HeldUntil(expires_at) => expires_at,
            };

            if Instant::now() >= deadline {
                return Ok(None);
            }

            tokio::select! {
                _ = &mut released => {}
                _ = sleep_until(expires_at.min(deadline)) => {}
            }

            if Instant::now() >= deadline {
                // one last look: the lease may have expired exactly at the deadline
                return match self.attempt(resource, &mut seen_releases).await {
                    Attempt::Granted(lease) => Ok(Some(lease)),
                    _ => Ok(None),
                };
            }
        }
    }

    #[instrument(skip(self), fields(node_id = %self.node_id, resource = %lease.resource()))]
    async fn release(&self, lease: &Lease) -> Result<(), LeadershipError> {
        let mut slots = self.registry.inner.slots.lock().await;
        let slot = slots
            .get_mut(lease.resource())
            .filter(|slot| {
                slot.live_term(Instant::now())
                    .is_some_and(|term| term.token == lease.token())
            })
            .ok_or_else(|| LeadershipError::NotHeld(lease.resource().to_string()))?;

        slot.term = None;
        slot.releases += 1;
        drop(slots);
        self.registry.inner.released.notify_waiters();
        debug!("Leadership released");
        Ok(())
    }

    async fn renew(&self, lease: &Lease) -> Result<(), LeadershipError> {
        let mut slots = self.registry.inner.slots.lock().await;
        let now = Instant::now();
        let term = slots
            .get_mut(lease.resource())
            .and_then(|slot| slot.term.as_mut())
            .filter(|term| term.token == lease.token() && term.expires_at > now)
            .ok_or_else(|| LeadershipError::NotHeld(lease.resource().to_string()))?;

        term.expires_at = now + self.lease_ttl;
        Ok(())
    }
}
