//! Outbox relay: claims pending messages and publishes them.

use std::time::Duration;

use saga_store::{OutboxMessage, OutboxRepository, OutboxStatus, StoreError};

use crate::transport::Transport;
use crate::{OutboxError, Result};

/// Relay tuning knobs.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Name recorded on claimed rows.
    pub worker_id: String,
    /// Maximum messages claimed per tick.
    pub batch_size: usize,
    /// Publish attempts before a message is marked failed.
    pub max_retries: u32,
    /// How long a claim hides a message from other workers.
    pub claim_lease: Duration,
    pub publish_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            worker_id: "relay-local".to_string(),
            batch_size: 100,
            max_retries: 3,
            claim_lease: Duration::from_secs(30),
            publish_timeout: Duration::from_secs(5),
        }
    }
}

/// What one relay tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayReport {
    pub sent: usize,
    pub duplicates: usize,
    /// Publish failures left pending for a later tick.
    pub retried: usize,
    /// Publish failures that exhausted the retry budget.
    pub failed: usize,
    /// Messages skipped after a store error; their claim lapses and a later
    /// tick picks them up again.
    pub errors: usize,
}

impl RelayReport {
    /// Number of messages the tick handled.
    pub fn total(&self) -> usize {
        self.sent + self.duplicates + self.retried + self.failed
    }
}

enum Outcome {
    Sent,
    Duplicate,
    Retry,
    Failed,
}

/// Publishes staged outbox messages.
///
/// Each tick claims a batch (committing the claim before any network call),
/// publishes each message and then records its status. Several relays may
/// run against the same store; claims keep them from sending the same row.
pub struct OutboxRelay<R: OutboxRepository, T: Transport> {
    repository: R,
    transport: T,
    config: RelayConfig,
}

impl<R: OutboxRepository, T: Transport> OutboxRelay<R, T> {
    pub fn new(repository: R, transport: T, config: RelayConfig) -> Self {
        Self {
            repository,
            transport,
            config,
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Runs a single relay pass over the pending messages.
    #[tracing::instrument(skip(self), fields(worker = %self.config.worker_id))]
    pub async fn run_once(&self) -> Result<RelayReport> {
        let batch = self
            .repository
            .claim_pending(
                &self.config.worker_id,
                self.config.batch_size,
                self.config.claim_lease,
            )
            .await?;

        let mut report = RelayReport::default();
        for message in &batch {
            match self.deliver(message).await {
                Ok(Outcome::Sent) => report.sent += 1,
                Ok(Outcome::Duplicate) => report.duplicates += 1,
                Ok(Outcome::Retry) => report.retried += 1,
                Ok(Outcome::Failed) => report.failed += 1,
                Err(e) => {
                    report.errors += 1;
                    metrics::counter!("outbox_relay_errors_total").increment(1);
                    tracing::error!(
                        message_id = %message.id,
                        routing_key = %message.routing_key,
                        error = %e,
                        "relay could not settle message, continuing batch"
                    );
                }
            }
        }

        if report.total() > 0 || report.errors > 0 {
            tracing::debug!(
                sent = report.sent,
                duplicates = report.duplicates,
                retried = report.retried,
                failed = report.failed,
                errors = report.errors,
                "relay pass complete"
            );
        }
        Ok(report)
    }

    async fn deliver(&self, message: &OutboxMessage) -> Result<Outcome> {
        if let Some(ref key) = message.idempotency_key
            && self.repository.is_key_sent(key).await?
        {
            return self.duplicate(message).await;
        }

        let published = tokio::time::timeout(
            self.config.publish_timeout,
            self.transport
                .publish(&message.exchange, &message.routing_key, &message.payload),
        )
        .await
        .unwrap_or(Err(OutboxError::Timeout(self.config.publish_timeout)));

        match published {
            Ok(()) => match self.repository.mark_sent(message.id).await {
                Ok(()) => {
                    metrics::counter!("outbox_messages_sent_total").increment(1);
                    Ok(Outcome::Sent)
                }
                Err(StoreError::DuplicateKey(_)) => self.duplicate(message).await,
                Err(e) => Err(e.into()),
            },
            Err(e) => {
                let error = e.to_string();
                let status = self
                    .repository
                    .record_failure(message.id, &error, self.config.max_retries)
                    .await?;
                if status == OutboxStatus::Failed {
                    metrics::counter!("outbox_messages_failed_total").increment(1);
                    tracing::error!(
                        message_id = %message.id,
                        routing_key = %message.routing_key,
                        error = %error,
                        "outbox message failed permanently"
                    );
                    Ok(Outcome::Failed)
                } else {
                    metrics::counter!("outbox_publish_retries_total").increment(1);
                    tracing::warn!(
                        message_id = %message.id,
                        routing_key = %message.routing_key,
                        error = %error,
                        "publish failed, will retry"
                    );
                    Ok(Outcome::Retry)
                }
            }
        }
    }

    async fn duplicate(&self, message: &OutboxMessage) -> Result<Outcome> {
        self.repository.mark_duplicate(message.id).await?;
        metrics::counter!("outbox_messages_duplicate_total").increment(1);
        tracing::info!(
            message_id = %message.id,
            key = ?message.idempotency_key,
            "skipping already-sent message"
        );
        Ok(Outcome::Duplicate)
    }
}
