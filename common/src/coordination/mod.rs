// Distributed coordination service used for leadership (mutual exclusion)

pub mod memory;
pub mod redis_lock;

pub use self::memory::{InMemoryCoordinationService, LeaderRegistry};
pub use self::redis_lock::RedisCoordinationService;

use crate::errors::LeadershipError;
use async_trait::async_trait;
use std::fmt;
use std::time::Duration;

/// One granted term of leadership.
///
/// The token is unique per acquisition, so a stale lease (expired, then
/// re-acquired by a later execution on the same node) can neither renew nor
/// release the live one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    resource: String,
    token: String,
}

impl Lease {
    pub fn new(resource: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            token: token.into(),
        }
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn token(&self) -> &str {
        &self.token
    }
}

impl fmt::Display for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.resource)
    }
}

/// Grants one cluster member exclusive rights to a named resource.
///
/// A contender waits at most `timeout` for the resource, but only for a
/// holder that dies: if a term is released while it waits, that term served
/// the cycle and the contender is refused.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CoordinationService: Send + Sync {
    /// Request leadership for `resource`, waiting at most `timeout`.
    /// Returns `Ok(None)` when leadership is not granted.
    async fn acquire_leadership(
        &self,
        resource: &str,
        timeout: Duration,
    ) -> Result<Option<Lease>, LeadershipError>;

    /// Give up a held term
    async fn release(&self, lease: &Lease) -> Result<(), LeadershipError>;

    /// Push back the expiry of a held term
    async fn renew(&self, lease: &Lease) -> Result<(), LeadershipError>;
}
