//! Effectively-once processing of inbound requests.

use std::fmt::Display;
use std::future::Future;

use chrono::Utc;
use common::SagaId;
use saga_store::{ProcessedMessage, ProcessedMessageRepository, ProcessedStatus};

use crate::error::{Result, SagaError};

/// Result of guarded work that names what it produced.
///
/// The value is stored as the processed record's `result_id`.
pub trait ResultId {
    fn result_id(&self) -> Option<String>;
}

impl ResultId for () {
    fn result_id(&self) -> Option<String> {
        None
    }
}

impl<T: Display> ResultId for Option<T> {
    fn result_id(&self) -> Option<String> {
        self.as_ref().map(ToString::to_string)
    }
}

/// Identifies one inbound request.
#[derive(Debug, Clone)]
pub struct RequestMeta {
    pub request_id: String,
    pub saga_id: Option<SagaId>,
    pub service: String,
    pub operation: String,
}

impl RequestMeta {
    pub fn new(
        request_id: impl Into<String>,
        service: impl Into<String>,
        operation: impl Into<String>,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            saga_id: None,
            service: service.into(),
            operation: operation.into(),
        }
    }

    pub fn for_saga(mut self, saga_id: SagaId) -> Self {
        self.saga_id = Some(saga_id);
        self
    }

    fn record(
        &self,
        status: ProcessedStatus,
        result_id: Option<String>,
        error: Option<String>,
    ) -> ProcessedMessage {
        ProcessedMessage {
            request_id: self.request_id.clone(),
            saga_id: self.saga_id,
            service_name: self.service.clone(),
            operation: self.operation.clone(),
            status,
            result_id,
            error,
            processed_at: Utc::now(),
        }
    }
}

/// Runs work at most once per request id.
#[derive(Debug, Clone)]
pub struct IdempotencyGuard<P: ProcessedMessageRepository> {
    repository: P,
}

impl<P: ProcessedMessageRepository> IdempotencyGuard<P> {
    pub fn new(repository: P) -> Self {
        Self { repository }
    }

    /// Returns true if the request id has a processed record.
    pub async fn is_processed(&self, request_id: &str) -> Result<bool> {
        Ok(self.repository.find_processed(request_id).await?.is_some())
    }

    /// Executes `work` unless the request was already processed.
    ///
    /// Returns `Ok(None)` for a duplicate. The record is written after the
    /// work finished: SUCCESS with the result's id on success, FAILED on a non-transient error
    /// (the error is still returned). Transient errors leave no record so a
    /// redelivery can try again.
    #[tracing::instrument(skip(self, work), fields(request_id = %meta.request_id, operation = %meta.operation))]
    pub async fn execute_if_new<T, F, Fut>(&self, meta: RequestMeta, work: F) -> Result<Option<T>>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
        T: ResultId + Send,
    {
        if self.repository.find_processed(&meta.request_id).await?.is_some() {
            metrics::counter!("idempotency_duplicates_total").increment(1);
            tracing::info!("duplicate request skipped");
            return Ok(None);
        }

        match work().await {
            Ok(value) => {
                let inserted = self
                    .repository
                    .record_processed(meta.record(
                        ProcessedStatus::Success,
                        value.result_id(),
                        None,
                    ))
                    .await?;
                if !inserted {
                    metrics::counter!("idempotency_duplicates_total").increment(1);
                    tracing::warn!("request processed concurrently by another consumer");
                }
                Ok(Some(value))
            }
            Err(err) if err.is_transient() => {
                tracing::debug!(error = %err, "transient failure, request left unrecorded");
                Err(err)
            }
            Err(err) => {
                self.record_failure(&meta, &err).await;
                Err(err)
            }
        }
    }

    async fn record_failure(&self, meta: &RequestMeta, err: &SagaError) {
        let record = meta.record(ProcessedStatus::Failed, None, Some(err.to_string()));
        if let Err(store_err) = self.repository.record_processed(record).await {
            tracing::error!(error = %store_err, "failed to record failed request");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use saga_store::InMemorySagaStore;

    fn meta(id: &str) -> RequestMeta {
        RequestMeta::new(id, "payment", "PROCESS_PAYMENT").for_saga(SagaId::new())
    }

    #[tokio::test]
    async fn test_repeated_deliveries_run_once() {
        let store = InMemorySagaStore::new();
        let guard = IdempotencyGuard::new(store.clone());
        let runs = Arc::new(AtomicUsize::new(0));

        for _ in 0..5 {
            let runs = runs.clone();
            guard
                .execute_if_new(meta("req-1"), || async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .await
                .unwrap();
        }

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        let record = store.find_processed("req-1").await.unwrap().unwrap();
        assert_eq!(record.status, ProcessedStatus::Success);
    }

    #[tokio::test]
    async fn test_duplicate_returns_none() {
        let guard = IdempotencyGuard::new(InMemorySagaStore::new());
        let first = guard
            .execute_if_new(meta("req-2"), || async { Ok(Some(7)) })
            .await
            .unwrap();
        let second = guard
            .execute_if_new(meta("req-2"), || async { Ok(Some(8)) })
            .await
            .unwrap();
        assert_eq!(first, Some(Some(7)));
        assert_eq!(second, None);
    }

    #[tokio::test]
    async fn test_result_id_is_recorded() {
        let store = InMemorySagaStore::new();
        let guard = IdempotencyGuard::new(store.clone());
        guard
            .execute_if_new(meta("req-5"), || async { Ok(Some("PAYMENT_SUCCESS")) })
            .await
            .unwrap();
        guard
            .execute_if_new(meta("req-6"), || async { Ok(None::<String>) })
            .await
            .unwrap();

        let applied = store.find_processed("req-5").await.unwrap().unwrap();
        assert_eq!(applied.result_id.as_deref(), Some("PAYMENT_SUCCESS"));
        let ignored = store.find_processed("req-6").await.unwrap().unwrap();
        assert_eq!(ignored.status, ProcessedStatus::Success);
        assert!(ignored.result_id.is_none());
    }

    #[tokio::test]
    async fn test_permanent_failure_is_recorded() {
        let store = InMemorySagaStore::new();
        let guard = IdempotencyGuard::new(store.clone());
        let result: Result<Option<()>> = guard
            .execute_if_new(meta("req-3"), || async {
                Err(SagaError::InvalidContext("bad".to_string()))
            })
            .await;
        assert!(matches!(result, Err(SagaError::InvalidContext(_))));

        let record = store.find_processed("req-3").await.unwrap().unwrap();
        assert_eq!(record.status, ProcessedStatus::Failed);
        assert!(record.result_id.is_none());
        assert!(guard.is_processed("req-3").await.unwrap());
    }

    #[tokio::test]
    async fn test_transient_failure_allows_retry() {
        let store = InMemorySagaStore::new();
        let guard = IdempotencyGuard::new(store.clone());
        let result: Result<Option<()>> = guard
            .execute_if_new(meta("req-4"), || async {
                Err(SagaError::LockUnavailable("saga:lock:x".to_string()))
            })
            .await;
        assert!(result.is_err());
        assert!(!guard.is_processed("req-4").await.unwrap());

        let retried = guard
            .execute_if_new(meta("req-4"), || async { Ok(()) })
            .await
            .unwrap();
        assert_eq!(retried, Some(()));
    }
}
