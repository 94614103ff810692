//! Orchestrator configuration loaded from environment variables.

use std::str::FromStr;
use std::time::Duration;

use outbox::RelayConfig;

use crate::engine::EngineConfig;
use crate::recovery::RecoveryPolicy;
use crate::scheduler::SchedulerConfig;

/// Orchestrator tuning with sensible defaults.
///
/// Reads from environment variables:
/// - `NODE_ID`: name of this orchestrator node (default: `"orchestrator-local"`)
/// - `RELAY_INTERVAL_MS`: outbox relay tick (default: `500`)
/// - `RELAY_MAX_RETRIES`: publish attempts before FAILED (default: `5`)
/// - `RELAY_BATCH_SIZE`: messages claimed per tick (default: `100`)
/// - `RECOVERY_INTERVAL_SECS`: recovery sweep period (default: `60`)
/// - `RECOVERY_STALE_AFTER_SECS`: idle time before a saga counts as stuck (default: `300`)
/// - `RECOVERY_MAX_RETRIES`: resume attempts before compensating (default: `3`)
/// - `RECOVERY_BACKOFF_BASE_SECS`: first retry delay (default: `30`)
/// - `LOCK_WAIT_MS`: longest wait for a saga lock (default: `5000`)
/// - `LOCK_LEASE_SECS`: lock lease length (default: `30`)
/// - `STORE_TIMEOUT_MS`: bound on storage calls (default: `5000`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorConfig {
    pub node_id: String,
    pub relay_interval: Duration,
    pub relay_max_retries: u32,
    pub relay_batch_size: usize,
    pub recovery_interval: Duration,
    pub recovery_stale_after: Duration,
    pub recovery_max_retries: u32,
    pub recovery_backoff_base: Duration,
    pub lock_wait: Duration,
    pub lock_lease: Duration,
    pub store_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            node_id: "orchestrator-local".to_string(),
            relay_interval: Duration::from_millis(500),
            relay_max_retries: 5,
            relay_batch_size: 100,
            recovery_interval: Duration::from_secs(60),
            recovery_stale_after: Duration::from_secs(300),
            recovery_max_retries: 3,
            recovery_backoff_base: Duration::from_secs(30),
            lock_wait: Duration::from_millis(5000),
            lock_lease: Duration::from_secs(30),
            store_timeout: Duration::from_millis(5000),
        }
    }
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!(var = name, value = %raw, "ignoring unparseable setting");
            default
        }),
        Err(_) => default,
    }
}

impl OrchestratorConfig {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            node_id: std::env::var("NODE_ID").unwrap_or(defaults.node_id),
            relay_interval: Duration::from_millis(env_or(
                "RELAY_INTERVAL_MS",
                defaults.relay_interval.as_millis() as u64,
            )),
            relay_max_retries: env_or("RELAY_MAX_RETRIES", defaults.relay_max_retries),
            relay_batch_size: env_or("RELAY_BATCH_SIZE", defaults.relay_batch_size),
            recovery_interval: Duration::from_secs(env_or(
                "RECOVERY_INTERVAL_SECS",
                defaults.recovery_interval.as_secs(),
            )),
            recovery_stale_after: Duration::from_secs(env_or(
                "RECOVERY_STALE_AFTER_SECS",
                defaults.recovery_stale_after.as_secs(),
            )),
            recovery_max_retries: env_or("RECOVERY_MAX_RETRIES", defaults.recovery_max_retries),
            recovery_backoff_base: Duration::from_secs(env_or(
                "RECOVERY_BACKOFF_BASE_SECS",
                defaults.recovery_backoff_base.as_secs(),
            )),
            lock_wait: Duration::from_millis(env_or(
                "LOCK_WAIT_MS",
                defaults.lock_wait.as_millis() as u64,
            )),
            lock_lease: Duration::from_secs(env_or(
                "LOCK_LEASE_SECS",
                defaults.lock_lease.as_secs(),
            )),
            store_timeout: Duration::from_millis(env_or(
                "STORE_TIMEOUT_MS",
                defaults.store_timeout.as_millis() as u64,
            )),
        }
    }

    pub fn engine(&self) -> EngineConfig {
        EngineConfig {
            node_id: self.node_id.clone(),
            lock_wait: self.lock_wait,
            store_timeout: self.store_timeout,
        }
    }

    pub fn relay(&self) -> RelayConfig {
        RelayConfig {
            worker_id: self.node_id.clone(),
            batch_size: self.relay_batch_size,
            max_retries: self.relay_max_retries,
            publish_timeout: self.store_timeout,
            ..RelayConfig::default()
        }
    }

    pub fn recovery(&self) -> RecoveryPolicy {
        RecoveryPolicy {
            max_retries: self.recovery_max_retries,
            backoff_base: self.recovery_backoff_base,
            stale_after: self.recovery_stale_after,
            ..RecoveryPolicy::default()
        }
    }

    pub fn scheduler(&self) -> SchedulerConfig {
        SchedulerConfig {
            relay_interval: self.relay_interval,
            recovery_interval: self.recovery_interval,
        }
    }
}
