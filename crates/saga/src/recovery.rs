//! Crash and stall recovery.
//!
//! At startup every unfinished saga is examined; afterwards a periodic sweep
//! picks up stale, timed-out and stuck compensating sagas. The decision for
//! each one is a pure function of the instance, the external verification
//! result and the clock.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use saga_store::{SagaQuery, SagaStatus, SagaStore};

use crate::definition::StateId;
use crate::engine::SagaEngine;
use crate::error::{Result, SagaError};
use crate::instance::SagaInstance;
use crate::lock::LockManager;
use crate::verification::{StateVerifier, VerificationStatus};

/// Recovery tuning knobs.
#[derive(Debug, Clone)]
pub struct RecoveryPolicy {
    /// Resume attempts before compensating (or escalating a compensation).
    pub max_retries: u32,
    /// First retry delay; doubled on every attempt.
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    /// A saga not updated for this long is considered stuck.
    pub stale_after: Duration,
    /// Maximum sagas examined per query.
    pub batch_limit: usize,
    /// Sagas recovered concurrently.
    pub concurrency: usize,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base: Duration::from_secs(30),
            backoff_cap: Duration::from_secs(30 * 60),
            stale_after: Duration::from_secs(5 * 60),
            batch_limit: 500,
            concurrency: 8,
        }
    }
}

impl RecoveryPolicy {
    /// Delay before retry number `attempt + 1`: base * 2^attempt, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.backoff_base
            .checked_mul(factor)
            .unwrap_or(self.backoff_cap)
            .min(self.backoff_cap)
    }
}

/// What recovery does with one saga.
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryDecision {
    Compensate(String),
    Resume {
        state: StateId,
        retry_count: u32,
        next_retry_at: DateTime<Utc>,
    },
    Escalate(String),
    Skip(&'static str),
}

impl RecoveryDecision {
    pub fn label(&self) -> &'static str {
        match self {
            RecoveryDecision::Compensate(_) => "compensate",
            RecoveryDecision::Resume { .. } => "resume",
            RecoveryDecision::Escalate(_) => "escalate",
            RecoveryDecision::Skip(_) => "skip",
        }
    }
}

/// Chooses what to do with a stuck saga.
///
/// `verification` is the downstream view of the resource the current state
/// depends on, or `None` when there is nothing to verify.
pub fn decide(
    instance: &SagaInstance,
    verification: Option<VerificationStatus>,
    now: DateTime<Utc>,
    policy: &RecoveryPolicy,
) -> RecoveryDecision {
    if instance.status.is_terminal() {
        return RecoveryDecision::Skip("terminal");
    }
    if instance.is_timed_out(now) {
        return RecoveryDecision::Compensate(format!(
            "saga timed out at {}",
            instance.timeout_at
        ));
    }
    if instance.next_retry_at.is_some_and(|at| at > now) {
        return RecoveryDecision::Skip("retry not due");
    }

    let next_retry_at = now
        + chrono::Duration::from_std(policy.backoff(instance.retry_count))
            .unwrap_or_else(|_| chrono::Duration::minutes(30));

    if instance.status == SagaStatus::Compensating {
        if instance.retry_count >= policy.max_retries {
            return RecoveryDecision::Escalate(format!(
                "compensation stalled in {} after {} retries",
                instance.current_state, instance.retry_count
            ));
        }
        return match instance.last_good_checkpoint() {
            Some(checkpoint) => RecoveryDecision::Resume {
                state: StateId::from(checkpoint.state.as_str()),
                retry_count: instance.retry_count + 1,
                next_retry_at,
            },
            None => RecoveryDecision::Escalate("no good checkpoint to resume compensation".into()),
        };
    }

    if let Some(status) = verification
        && status.requires_compensation()
    {
        return RecoveryDecision::Compensate(format!(
            "external state of {} is {status:?}",
            instance.current_state
        ));
    }
    let Some(checkpoint) = instance.last_good_checkpoint() else {
        return RecoveryDecision::Compensate("no good checkpoint".to_string());
    };
    if instance.retry_count >= policy.max_retries {
        return RecoveryDecision::Compensate(format!(
            "retries exhausted after {} attempts",
            instance.retry_count
        ));
    }
    RecoveryDecision::Resume {
        state: StateId::from(checkpoint.state.as_str()),
        retry_count: instance.retry_count + 1,
        next_retry_at,
    }
}

/// Counts of what a recovery pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub examined: usize,
    pub resumed: usize,
    pub compensated: usize,
    pub escalated: usize,
    pub skipped: usize,
    pub errors: usize,
}

enum Outcome {
    Resumed,
    Compensated,
    Escalated,
    Skipped,
}

/// Applies recovery decisions through the engine.
pub struct RecoveryManager<S: SagaStore, L: LockManager, V: StateVerifier> {
    engine: Arc<SagaEngine<S, L>>,
    verifier: V,
    policy: RecoveryPolicy,
}

impl<S: SagaStore, L: LockManager, V: StateVerifier> RecoveryManager<S, L, V> {
    pub fn new(engine: Arc<SagaEngine<S, L>>, verifier: V, policy: RecoveryPolicy) -> Self {
        Self {
            engine,
            verifier,
            policy,
        }
    }

    pub fn policy(&self) -> &RecoveryPolicy {
        &self.policy
    }

    /// Examines every unfinished saga.
    #[tracing::instrument(skip(self))]
    pub async fn recover_on_startup(&self) -> Result<RecoveryReport> {
        let candidates = self
            .engine
            .find(
                SagaQuery::new()
                    .statuses(vec![SagaStatus::InProgress, SagaStatus::Compensating])
                    .limit(self.policy.batch_limit),
            )
            .await?;
        tracing::info!(count = candidates.len(), "recovering unfinished sagas");
        Ok(self.process(candidates).await)
    }

    /// Examines stale, timed-out and stuck compensating sagas.
    #[tracing::instrument(skip(self))]
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<RecoveryReport> {
        let stale_before = now
            - chrono::Duration::from_std(self.policy.stale_after)
                .unwrap_or_else(|_| chrono::Duration::minutes(5));
        let queries = [
            SagaQuery::with_status(SagaStatus::InProgress).timeout_before(now),
            SagaQuery::with_status(SagaStatus::InProgress).updated_before(stale_before),
            SagaQuery::with_status(SagaStatus::Compensating).updated_before(stale_before),
        ];

        let mut seen = HashSet::new();
        let mut candidates = Vec::new();
        for query in queries {
            for instance in self.engine.find(query.limit(self.policy.batch_limit)).await? {
                if seen.insert(instance.id) {
                    candidates.push(instance);
                }
            }
        }
        if !candidates.is_empty() {
            tracing::info!(count = candidates.len(), "recovery sweep found candidates");
        }
        Ok(self.process(candidates).await)
    }

    async fn process(&self, candidates: Vec<SagaInstance>) -> RecoveryReport {
        let outcomes: Vec<Result<Outcome>> = futures_util::stream::iter(candidates)
            .map(|instance| self.recover_one(instance))
            .buffer_unordered(self.policy.concurrency.max(1))
            .collect()
            .await;

        let mut report = RecoveryReport::default();
        for outcome in outcomes {
            report.examined += 1;
            match outcome {
                Ok(Outcome::Resumed) => report.resumed += 1,
                Ok(Outcome::Compensated) => report.compensated += 1,
                Ok(Outcome::Escalated) => report.escalated += 1,
                Ok(Outcome::Skipped) => report.skipped += 1,
                Err(e) => {
                    report.errors += 1;
                    tracing::warn!(error = %e, "recovery attempt failed, will retry next sweep");
                }
            }
        }
        report
    }

    async fn recover_one(&self, instance: SagaInstance) -> Result<Outcome> {
        let saga_id = instance.id;
        let now = Utc::now();
        let verification = self.verify(&instance, now).await?;
        let decision = decide(&instance, verification, now, &self.policy);
        metrics::counter!("saga_recovery_decisions_total", "decision" => decision.label())
            .increment(1);
        tracing::info!(%saga_id, state = %instance.current_state, decision = ?decision, "recovery decision");

        match decision {
            RecoveryDecision::Skip(_) => Ok(Outcome::Skipped),
            RecoveryDecision::Compensate(reason) => self.compensate(&instance, &reason).await,
            RecoveryDecision::Escalate(reason) => {
                self.engine.escalate(saga_id, &reason).await?;
                Ok(Outcome::Escalated)
            }
            RecoveryDecision::Resume {
                state,
                retry_count,
                next_retry_at,
            } => {
                match self
                    .engine
                    .resume_from_checkpoint(saga_id, &state, retry_count, Some(next_retry_at))
                    .await
                {
                    Ok(_) => Ok(Outcome::Resumed),
                    Err(SagaError::TimeoutExceeded { .. }) => {
                        self.compensate(&instance, "saga timed out during resume")
                            .await
                    }
                    Err(e) => Err(e),
                }
            }
        }
    }

    async fn verify(
        &self,
        instance: &SagaInstance,
        now: DateTime<Utc>,
    ) -> Result<Option<VerificationStatus>> {
        if instance.status != SagaStatus::InProgress || instance.is_timed_out(now) {
            return Ok(None);
        }
        let definition = self.engine.definition(&instance.saga_type)?;
        let Some(resource) =
            definition.verification_target(&instance.current_state, &instance.context)
        else {
            return Ok(None);
        };
        Ok(Some(self.verifier.verify(&resource).await))
    }

    /// Compensates, escalating when compensation cannot start.
    async fn compensate(&self, instance: &SagaInstance, reason: &str) -> Result<Outcome> {
        match self.engine.compensate(instance.id, reason).await {
            Ok(_) => Ok(Outcome::Compensated),
            Err(e) if e.is_transient() => Err(e),
            Err(e) => {
                let reason = format!("compensation could not start: {e}");
                self.engine.escalate(instance.id, &reason).await?;
                Ok(Outcome::Escalated)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::SagaContext;
    use crate::machine::{Step, apply_event, initial_instance};
    use crate::order_saga::{self, events, states};
    use common::SagaId;

    fn in_payment(now: DateTime<Utc>) -> SagaInstance {
        let definition = order_saga::definition().unwrap();
        let (instance, _) = initial_instance(
            &definition,
            SagaId::new(),
            SagaContext::for_order("O1", 100.0),
            now,
        );
        match apply_event(&definition, &instance, &events::START_SAGA, now, "n").unwrap() {
            Step::Advanced(effects) => effects.instance,
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RecoveryPolicy {
            backoff_base: Duration::from_secs(10),
            backoff_cap: Duration::from_secs(60),
            ..RecoveryPolicy::default()
        };
        assert_eq!(policy.backoff(0), Duration::from_secs(10));
        assert_eq!(policy.backoff(2), Duration::from_secs(40));
        assert_eq!(policy.backoff(3), Duration::from_secs(60));
        assert_eq!(policy.backoff(40), Duration::from_secs(60));
    }

    #[test]
    fn test_timed_out_saga_is_compensated() {
        let now = Utc::now();
        let instance = in_payment(now);
        let late = instance.timeout_at + chrono::Duration::seconds(1);
        let decision = decide(
            &instance,
            Some(VerificationStatus::Confirmed),
            late,
            &RecoveryPolicy::default(),
        );
        assert!(matches!(decision, RecoveryDecision::Compensate(_)));
    }

    #[test]
    fn test_failed_or_unknown_verification_compensates() {
        let now = Utc::now();
        let instance = in_payment(now);
        for status in [VerificationStatus::Failed, VerificationStatus::Unknown] {
            let decision = decide(&instance, Some(status), now, &RecoveryPolicy::default());
            assert_eq!(decision.label(), "compensate");
        }
    }

    #[test]
    fn test_resume_from_last_good_checkpoint_with_backoff() {
        let now = Utc::now();
        let instance = in_payment(now);
        let policy = RecoveryPolicy::default();
        let decision = decide(&instance, Some(VerificationStatus::Pending), now, &policy);
        assert_eq!(
            decision,
            RecoveryDecision::Resume {
                state: states::PAYMENT_PROCESSING,
                retry_count: 1,
                next_retry_at: now + chrono::Duration::seconds(30),
            }
        );
    }

    #[test]
    fn test_exhausted_retries_compensate() {
        let now = Utc::now();
        let mut instance = in_payment(now);
        instance.retry_count = 3;
        let decision = decide(&instance, None, now, &RecoveryPolicy::default());
        assert_eq!(decision.label(), "compensate");
    }

    #[test]
    fn test_retry_not_due_is_skipped() {
        let now = Utc::now();
        let mut instance = in_payment(now);
        instance.next_retry_at = Some(now + chrono::Duration::seconds(10));
        assert_eq!(
            decide(&instance, None, now, &RecoveryPolicy::default()),
            RecoveryDecision::Skip("retry not due")
        );
    }

    #[test]
    fn test_no_good_checkpoint_compensates() {
        let now = Utc::now();
        let mut instance = in_payment(now);
        for checkpoint in &mut instance.checkpoints {
            checkpoint.error = Some("boom".to_string());
        }
        let decision = decide(&instance, None, now, &RecoveryPolicy::default());
        assert_eq!(
            decision,
            RecoveryDecision::Compensate("no good checkpoint".to_string())
        );
    }

    #[test]
    fn test_stalled_compensation_escalates_after_retries() {
        let now = Utc::now();
        let mut instance = in_payment(now);
        instance.status = SagaStatus::Compensating;
        instance.retry_count = 3;
        assert_eq!(
            decide(&instance, None, now, &RecoveryPolicy::default()).label(),
            "escalate"
        );
        instance.retry_count = 1;
        assert_eq!(
            decide(&instance, None, now, &RecoveryPolicy::default()).label(),
            "resume"
        );
    }

    #[test]
    fn test_terminal_is_skipped() {
        let now = Utc::now();
        let mut instance = in_payment(now);
        instance.status = SagaStatus::Completed;
        assert_eq!(
            decide(&instance, None, now, &RecoveryPolicy::default()),
            RecoveryDecision::Skip("terminal")
        );
    }
}
