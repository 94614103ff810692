//! Cluster-wide mutual exclusion over saga instances.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::SagaId;
use saga_store::{LeaseRepository, LockLease};
use serde::Serialize;
use tokio::sync::Mutex;

use crate::error::Result;

/// Prefix of every saga lock key.
pub const SAGA_LOCK_PREFIX: &str = "saga:lock:";

/// Returns the lock key guarding a saga instance.
pub fn saga_lock_key(saga_id: SagaId) -> String {
    format!("{SAGA_LOCK_PREFIX}{saga_id}")
}

/// Separates the node name from the per-acquisition suffix of a lease token.
const TOKEN_SEPARATOR: char = '#';

/// Holder and remaining lease of a lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LockInfo {
    pub key: String,
    /// Node holding the lock.
    pub holder: String,
    /// Lease token of the single acquisition holding the lock.
    pub token: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub remaining_ms: i64,
}

impl LockInfo {
    fn from_lease(lease: LockLease, now: DateTime<Utc>) -> Self {
        let remaining_ms = (lease.expires_at - now).num_milliseconds().max(0);
        let holder = lease
            .holder
            .split_once(TOKEN_SEPARATOR)
            .map_or(lease.holder.as_str(), |(node, _)| node)
            .to_string();
        Self {
            key: lease.key,
            holder,
            token: lease.holder,
            acquired_at: lease.acquired_at,
            expires_at: lease.expires_at,
            remaining_ms,
        }
    }
}

/// Lease-based locks. Leases expire, so a crashed holder never blocks forever.
///
/// Locks are not re-entrant: while one operation holds a key, every other
/// `try_lock` on it fails, including calls from the same node.
#[async_trait]
pub trait LockManager: Send + Sync {
    /// Tries to take the lock, waiting at most `wait`.
    async fn try_lock(&self, key: &str, wait: Duration) -> Result<bool>;

    /// Releases the lock if this manager holds it.
    async fn unlock(&self, key: &str) -> Result<()>;

    async fn is_locked(&self, key: &str) -> Result<bool>;

    /// Releases the lock whoever holds it. Returns true if a lease was removed.
    async fn force_unlock(&self, key: &str, reason: &str) -> Result<bool>;

    async fn lock_info(&self, key: &str) -> Result<Option<LockInfo>>;
}

/// Lock manager backed by a shared lease table.
///
/// Each orchestrator node uses its own holder name; two managers with
/// different holders over the same repository behave like two nodes.
/// Every acquisition writes a fresh token (`holder#suffix`) to the lease
/// table, and clones share the tokens this node currently holds.
#[derive(Debug, Clone)]
pub struct LeaseLockManager<R: LeaseRepository> {
    repository: R,
    holder: String,
    lease: Duration,
    poll_interval: Duration,
    held: Arc<Mutex<HashMap<String, String>>>,
}

impl<R: LeaseRepository> LeaseLockManager<R> {
    pub fn new(repository: R, holder: impl Into<String>, lease: Duration) -> Self {
        Self {
            repository,
            holder: holder.into(),
            lease,
            poll_interval: Duration::from_millis(10),
            held: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    fn mint_token(&self) -> String {
        format!(
            "{}{TOKEN_SEPARATOR}{}",
            self.holder,
            uuid::Uuid::new_v4().simple()
        )
    }
}

#[async_trait]
impl<R: LeaseRepository> LockManager for LeaseLockManager<R> {
    async fn try_lock(&self, key: &str, wait: Duration) -> Result<bool> {
        let deadline = tokio::time::Instant::now() + wait;
        let token = self.mint_token();
        loop {
            if self.repository.try_acquire(key, &token, self.lease).await? {
                self.held.lock().await.insert(key.to_string(), token);
                tracing::trace!(key, holder = %self.holder, "lock acquired");
                return Ok(true);
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                tracing::debug!(key, holder = %self.holder, "lock wait exhausted");
                return Ok(false);
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    async fn unlock(&self, key: &str) -> Result<()> {
        // Forget the token before releasing so a local waiter that wins the
        // freed lease cannot have its own token removed by this call.
        let token = self.held.lock().await.remove(key);
        let released = match token {
            Some(token) => self.repository.release(key, &token).await?,
            None => false,
        };
        if !released {
            tracing::debug!(key, holder = %self.holder, "unlock of lock not held");
        }
        Ok(())
    }

    async fn is_locked(&self, key: &str) -> Result<bool> {
        Ok(self.repository.current_lease(key).await?.is_some())
    }

    #[tracing::instrument(skip(self))]
    async fn force_unlock(&self, key: &str, reason: &str) -> Result<bool> {
        let removed = self.repository.force_release(key).await?;
        self.held.lock().await.remove(key);
        match removed {
            Some(ref lease) => tracing::warn!(
                key,
                previous_holder = %lease.holder,
                reason,
                "lock force-released"
            ),
            None => tracing::warn!(key, reason, "force-unlock requested for free lock"),
        }
        Ok(removed.is_some())
    }

    async fn lock_info(&self, key: &str) -> Result<Option<LockInfo>> {
        let lease = self.repository.current_lease(key).await?;
        Ok(lease.map(|l| LockInfo::from_lease(l, Utc::now())))
    }
}
