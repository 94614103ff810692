use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::store::lease_delta;
use crate::{
    Checkpoint, HistoryEntry, HistoryQuery, LeaseRepository, LockLease, MessageId,
    OutboxMessage, OutboxRepository, OutboxStats, OutboxStatus, ProcessedMessage,
    ProcessedMessageRepository, Result, SagaId, SagaQuery, SagaRecord, SagaRepository,
    StoreError, TransitionWrite, validate_transition_write,
};

#[derive(Default)]
struct Tables {
    sagas: HashMap<SagaId, SagaRecord>,
    checkpoints: HashMap<SagaId, Vec<Checkpoint>>,
    history: Vec<HistoryEntry>,
    outbox: Vec<OutboxMessage>,
    processed: HashMap<String, ProcessedMessage>,
    leases: HashMap<String, LockLease>,
}

/// In-memory saga store for tests and single-process runs.
///
/// All tables live behind one lock, so a transition write is applied
/// atomically exactly like the PostgreSQL transaction. Clones share state,
/// which lets several orchestrator instances in one test run against the
/// same "database".
#[derive(Clone, Default)]
pub struct InMemorySagaStore {
    tables: Arc<RwLock<Tables>>,
}

impl InMemorySagaStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of saga instances stored.
    pub async fn saga_count(&self) -> usize {
        self.tables.read().await.sagas.len()
    }

    /// Returns every outbox message in creation order.
    pub async fn outbox_messages(&self) -> Vec<OutboxMessage> {
        let tables = self.tables.read().await;
        let mut messages = tables.outbox.clone();
        messages.sort_by_key(|m| m.created_at);
        messages
    }

    /// Clears all tables.
    pub async fn clear(&self) {
        *self.tables.write().await = Tables::default();
    }
}

fn matches_saga(query: &SagaQuery, record: &SagaRecord) -> bool {
    if let Some(ref statuses) = query.statuses
        && !statuses.contains(&record.status)
    {
        return false;
    }
    if let Some(ref saga_type) = query.saga_type
        && &record.saga_type != saga_type
    {
        return false;
    }
    if let Some(before) = query.updated_before
        && record.updated_at >= before
    {
        return false;
    }
    if let Some(before) = query.timeout_before
        && record.timeout_at >= before
    {
        return false;
    }
    if let Some((ref key, ref value)) = query.metadata
        && record.metadata.get(key) != Some(value)
    {
        return false;
    }
    true
}

fn matches_history(query: &HistoryQuery, entry: &HistoryEntry) -> bool {
    if let Some(id) = query.saga_id
        && entry.saga_id != id
    {
        return false;
    }
    if let Some(ref saga_type) = query.saga_type
        && &entry.saga_type != saga_type
    {
        return false;
    }
    if let Some(ref source) = query.source_state
        && &entry.source_state != source
    {
        return false;
    }
    if let Some(ref target) = query.target_state
        && &entry.target_state != target
    {
        return false;
    }
    true
}

#[async_trait]
impl SagaRepository for InMemorySagaStore {
    async fn create(&self, record: SagaRecord, checkpoint: Checkpoint) -> Result<()> {
        if record.version != 1 || checkpoint.sequence != 1 {
            return Err(StoreError::InvalidWrite(
                "a new saga starts at version 1".to_string(),
            ));
        }
        let mut tables = self.tables.write().await;
        if tables.sagas.contains_key(&record.id) {
            return Err(StoreError::SagaExists(record.id));
        }
        tables.checkpoints.insert(record.id, vec![checkpoint]);
        tables.sagas.insert(record.id, record);
        Ok(())
    }

    async fn commit(&self, write: TransitionWrite) -> Result<()> {
        validate_transition_write(&write)?;

        let saga_id = write.record.id;
        let mut tables = self.tables.write().await;

        let actual = tables
            .sagas
            .get(&saga_id)
            .map(|r| r.version)
            .ok_or(StoreError::SagaNotFound(saga_id))?;

        if actual != write.expected_version {
            metrics::counter!("saga_store_version_conflicts_total", "backend" => "memory")
                .increment(1);
            tracing::debug!(%saga_id, expected = write.expected_version, actual, "version conflict, transition discarded");
            return Err(StoreError::ConcurrencyConflict {
                saga_id,
                expected: write.expected_version,
                actual,
            });
        }

        tables.sagas.insert(saga_id, write.record);
        tables
            .checkpoints
            .entry(saga_id)
            .or_default()
            .push(write.checkpoint);
        if let Some(entry) = write.history {
            tables.history.push(entry);
        }
        tables.outbox.extend(write.outbox);
        Ok(())
    }

    async fn get(&self, saga_id: SagaId) -> Result<Option<SagaRecord>> {
        Ok(self.tables.read().await.sagas.get(&saga_id).cloned())
    }

    async fn checkpoints(&self, saga_id: SagaId) -> Result<Vec<Checkpoint>> {
        let tables = self.tables.read().await;
        let mut checkpoints = tables.checkpoints.get(&saga_id).cloned().unwrap_or_default();
        checkpoints.sort_by_key(|c| c.sequence);
        Ok(checkpoints)
    }

    async fn find(&self, query: SagaQuery) -> Result<Vec<SagaRecord>> {
        let tables = self.tables.read().await;
        let mut records: Vec<_> = tables
            .sagas
            .values()
            .filter(|r| matches_saga(&query, r))
            .cloned()
            .collect();
        records.sort_by(|a, b| a.updated_at.cmp(&b.updated_at).then(a.id.cmp(&b.id)));
        if let Some(limit) = query.limit {
            records.truncate(limit);
        }
        Ok(records)
    }

    async fn history(&self, query: HistoryQuery) -> Result<Vec<HistoryEntry>> {
        let tables = self.tables.read().await;
        let mut entries: Vec<_> = tables
            .history
            .iter()
            .filter(|e| matches_history(&query, e))
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.created_at);
        if let Some(limit) = query.limit {
            entries.truncate(limit);
        }
        Ok(entries)
    }
}

#[async_trait]
impl OutboxRepository for InMemorySagaStore {
    async fn stage(&self, message: OutboxMessage) -> Result<()> {
        self.tables.write().await.outbox.push(message);
        Ok(())
    }

    async fn claim_pending(
        &self,
        worker: &str,
        limit: usize,
        lease: Duration,
    ) -> Result<Vec<OutboxMessage>> {
        let now = Utc::now();
        let until = now + lease_delta(lease);
        let mut tables = self.tables.write().await;

        let mut candidates: Vec<usize> = tables
            .outbox
            .iter()
            .enumerate()
            .filter(|(_, m)| {
                m.status == OutboxStatus::Pending && m.claimed_until.is_none_or(|t| t <= now)
            })
            .map(|(i, _)| i)
            .collect();
        candidates.sort_by_key(|&i| tables.outbox[i].created_at);
        candidates.truncate(limit);

        let mut claimed = Vec::with_capacity(candidates.len());
        for i in candidates {
            let message = &mut tables.outbox[i];
            message.claimed_by = Some(worker.to_string());
            message.claimed_until = Some(until);
            claimed.push(message.clone());
        }
        if !claimed.is_empty() {
            tracing::debug!(worker, claimed = claimed.len(), "outbox batch claimed");
        }
        Ok(claimed)
    }

    async fn is_key_sent(&self, idempotency_key: &str) -> Result<bool> {
        let tables = self.tables.read().await;
        Ok(tables.outbox.iter().any(|m| {
            m.status == OutboxStatus::Sent && m.idempotency_key.as_deref() == Some(idempotency_key)
        }))
    }

    async fn mark_sent(&self, id: MessageId) -> Result<()> {
        let mut tables = self.tables.write().await;
        let key = tables
            .outbox
            .iter()
            .find(|m| m.id == id)
            .and_then(|m| m.idempotency_key.clone());

        if let Some(ref key) = key
            && tables.outbox.iter().any(|m| {
                m.id != id
                    && m.status == OutboxStatus::Sent
                    && m.idempotency_key.as_deref() == Some(key.as_str())
            })
        {
            return Err(StoreError::DuplicateKey(key.clone()));
        }

        if let Some(message) = tables.outbox.iter_mut().find(|m| m.id == id) {
            message.status = OutboxStatus::Sent;
            message.processed_at = Some(Utc::now());
            message.claimed_by = None;
            message.claimed_until = None;
        }
        Ok(())
    }

    async fn mark_duplicate(&self, id: MessageId) -> Result<()> {
        let mut tables = self.tables.write().await;
        if let Some(message) = tables.outbox.iter_mut().find(|m| m.id == id) {
            message.status = OutboxStatus::Duplicate;
            message.processed_at = Some(Utc::now());
            message.claimed_by = None;
            message.claimed_until = None;
        }
        Ok(())
    }

    async fn record_failure(
        &self,
        id: MessageId,
        error: &str,
        max_retries: u32,
    ) -> Result<OutboxStatus> {
        let mut tables = self.tables.write().await;
        let Some(message) = tables.outbox.iter_mut().find(|m| m.id == id) else {
            return Ok(OutboxStatus::Failed);
        };
        message.retry_count += 1;
        message.last_error = Some(error.to_string());
        message.claimed_by = None;
        message.claimed_until = None;
        if message.retry_count >= max_retries {
            message.status = OutboxStatus::Failed;
            message.processed_at = Some(Utc::now());
        }
        Ok(message.status)
    }

    async fn get_message(&self, id: MessageId) -> Result<Option<OutboxMessage>> {
        let tables = self.tables.read().await;
        Ok(tables.outbox.iter().find(|m| m.id == id).cloned())
    }

    async fn messages_for_saga(&self, saga_id: SagaId) -> Result<Vec<OutboxMessage>> {
        let tables = self.tables.read().await;
        let mut messages: Vec<_> = tables
            .outbox
            .iter()
            .filter(|m| m.saga_id == Some(saga_id))
            .cloned()
            .collect();
        messages.sort_by_key(|m| m.created_at);
        Ok(messages)
    }

    async fn stats(&self) -> Result<OutboxStats> {
        let tables = self.tables.read().await;
        let mut stats = OutboxStats::default();
        for message in &tables.outbox {
            stats.add(message.status, 1);
        }
        Ok(stats)
    }

    async fn requeue(&self, id: MessageId) -> Result<bool> {
        let mut tables = self.tables.write().await;
        match tables
            .outbox
            .iter_mut()
            .find(|m| m.id == id && m.status == OutboxStatus::Failed)
        {
            Some(message) => {
                message.status = OutboxStatus::Pending;
                message.retry_count = 0;
                message.processed_at = None;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[async_trait]
impl ProcessedMessageRepository for InMemorySagaStore {
    async fn find_processed(&self, request_id: &str) -> Result<Option<ProcessedMessage>> {
        Ok(self.tables.read().await.processed.get(request_id).cloned())
    }

    async fn record_processed(&self, message: ProcessedMessage) -> Result<bool> {
        let mut tables = self.tables.write().await;
        if tables.processed.contains_key(&message.request_id) {
            return Ok(false);
        }
        tables
            .processed
            .insert(message.request_id.clone(), message);
        Ok(true)
    }
}

#[async_trait]
impl LeaseRepository for InMemorySagaStore {
    async fn try_acquire(&self, key: &str, holder: &str, lease: Duration) -> Result<bool> {
        let now = Utc::now();
        let mut tables = self.tables.write().await;
        if tables
            .leases
            .get(key)
            .is_some_and(|existing| !existing.is_expired_at(now))
        {
            return Ok(false);
        }
        tables.leases.insert(
            key.to_string(),
            LockLease {
                key: key.to_string(),
                holder: holder.to_string(),
                acquired_at: now,
                expires_at: now + lease_delta(lease),
            },
        );
        Ok(true)
    }

    async fn release(&self, key: &str, holder: &str) -> Result<bool> {
        let mut tables = self.tables.write().await;
        if tables.leases.get(key).is_some_and(|l| l.holder == holder) {
            tables.leases.remove(key);
            return Ok(true);
        }
        Ok(false)
    }

    async fn force_release(&self, key: &str) -> Result<Option<LockLease>> {
        Ok(self.tables.write().await.leases.remove(key))
    }

    async fn current_lease(&self, key: &str) -> Result<Option<LockLease>> {
        let now = Utc::now();
        let tables = self.tables.read().await;
        Ok(tables
            .leases
            .get(key)
            .filter(|l| !l.is_expired_at(now))
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::{ProcessedStatus, SagaStatus};

    fn record(id: SagaId, version: i64, state: &str) -> SagaRecord {
        let now = Utc::now();
        SagaRecord {
            id,
            saga_type: "ORDER_SAGA".to_string(),
            current_state: state.to_string(),
            status: SagaStatus::InProgress,
            context: serde_json::json!({"orderId": "O1"}),
            metadata: BTreeMap::from([("orderId".to_string(), "O1".to_string())]),
            retry_count: 0,
            next_retry_at: None,
            compensation_triggered: false,
            compensation_from_state: None,
            error_message: None,
            created_at: now,
            updated_at: now,
            timeout_at: now + chrono::Duration::minutes(30),
            completed_at: None,
            version,
        }
    }

    fn checkpoint(id: SagaId, sequence: i64, state: &str) -> Checkpoint {
        Checkpoint {
            saga_id: id,
            sequence,
            state: state.to_string(),
            event: None,
            action_result: None,
            retry_count: 0,
            error: None,
            created_at: Utc::now(),
        }
    }

    fn write(id: SagaId, expected: i64, state: &str) -> TransitionWrite {
        TransitionWrite {
            record: record(id, expected + 1, state),
            expected_version: expected,
            checkpoint: checkpoint(id, expected + 1, state),
            history: None,
            outbox: vec![
                OutboxMessage::new("saga.commands", "payment.process", serde_json::json!({}))
                    .for_saga(id),
            ],
        }
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let store = InMemorySagaStore::new();
        let id = SagaId::new();
        store
            .create(record(id, 1, "ORDER_CREATED"), checkpoint(id, 1, "ORDER_CREATED"))
            .await
            .unwrap();

        let loaded = store.get(id).await.unwrap().unwrap();
        assert_eq!(loaded.current_state, "ORDER_CREATED");
        assert_eq!(store.checkpoints(id).await.unwrap().len(), 1);

        let again = store
            .create(record(id, 1, "ORDER_CREATED"), checkpoint(id, 1, "ORDER_CREATED"))
            .await;
        assert!(matches!(again, Err(StoreError::SagaExists(_))));
    }

    #[tokio::test]
    async fn test_commit_checks_version() {
        let store = InMemorySagaStore::new();
        let id = SagaId::new();
        store
            .create(record(id, 1, "ORDER_CREATED"), checkpoint(id, 1, "ORDER_CREATED"))
            .await
            .unwrap();

        store.commit(write(id, 1, "PAYMENT_PROCESSING")).await.unwrap();

        let stale = store.commit(write(id, 1, "ORDER_CANCELLED")).await;
        assert!(matches!(
            stale,
            Err(StoreError::ConcurrencyConflict {
                expected: 1,
                actual: 2,
                ..
            })
        ));

        // The losing write left nothing behind.
        assert_eq!(store.checkpoints(id).await.unwrap().len(), 2);
        assert_eq!(store.outbox_messages().await.len(), 1);
        assert_eq!(
            store.get(id).await.unwrap().unwrap().current_state,
            "PAYMENT_PROCESSING"
        );
    }

    #[tokio::test]
    async fn test_commit_rejects_inconsistent_write() {
        let store = InMemorySagaStore::new();
        let id = SagaId::new();
        store
            .create(record(id, 1, "ORDER_CREATED"), checkpoint(id, 1, "ORDER_CREATED"))
            .await
            .unwrap();

        let mut bad = write(id, 1, "PAYMENT_PROCESSING");
        bad.checkpoint.state = "ORDER_CREATED".to_string();
        assert!(matches!(
            store.commit(bad).await,
            Err(StoreError::InvalidWrite(_))
        ));
    }

    #[tokio::test]
    async fn test_find_by_metadata_and_status() {
        let store = InMemorySagaStore::new();
        let id = SagaId::new();
        store
            .create(record(id, 1, "ORDER_CREATED"), checkpoint(id, 1, "ORDER_CREATED"))
            .await
            .unwrap();

        let found = store
            .find(SagaQuery::new().metadata("orderId", "O1"))
            .await
            .unwrap();
        assert_eq!(found.len(), 1);

        let none = store
            .find(SagaQuery::with_status(SagaStatus::Completed))
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_claim_hides_messages_from_other_workers() {
        let store = InMemorySagaStore::new();
        store
            .stage(OutboxMessage::new("x", "a", serde_json::json!({})))
            .await
            .unwrap();

        let first = store
            .claim_pending("node-a", 10, Duration::from_secs(30))
            .await
            .unwrap();
        let second = store
            .claim_pending("node-b", 10, Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(first.len(), 1);
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn test_mark_sent_refuses_second_message_with_same_key() {
        let store = InMemorySagaStore::new();
        let a = OutboxMessage::new("x", "a", serde_json::json!({})).idempotency_key("k1");
        let b = OutboxMessage::new("x", "a", serde_json::json!({})).idempotency_key("k1");
        let (a_id, b_id) = (a.id, b.id);
        store.stage(a).await.unwrap();
        store.stage(b).await.unwrap();

        store.mark_sent(a_id).await.unwrap();
        assert!(store.is_key_sent("k1").await.unwrap());
        assert!(matches!(
            store.mark_sent(b_id).await,
            Err(StoreError::DuplicateKey(_))
        ));
    }

    #[tokio::test]
    async fn test_record_failure_until_failed_then_requeue() {
        let store = InMemorySagaStore::new();
        let message = OutboxMessage::new("x", "a", serde_json::json!({}));
        let id = message.id;
        store.stage(message).await.unwrap();

        assert_eq!(
            store.record_failure(id, "down", 2).await.unwrap(),
            OutboxStatus::Pending
        );
        assert_eq!(
            store.record_failure(id, "down", 2).await.unwrap(),
            OutboxStatus::Failed
        );
        assert_eq!(store.stats().await.unwrap().failed, 1);

        assert!(store.requeue(id).await.unwrap());
        let requeued = store.get_message(id).await.unwrap().unwrap();
        assert_eq!(requeued.status, OutboxStatus::Pending);
        assert_eq!(requeued.retry_count, 0);
    }

    #[tokio::test]
    async fn test_processed_message_is_write_once() {
        let store = InMemorySagaStore::new();
        let message = ProcessedMessage {
            request_id: "req-1".to_string(),
            saga_id: None,
            service_name: "payment".to_string(),
            operation: "PROCESS_PAYMENT".to_string(),
            status: ProcessedStatus::Success,
            result_id: Some("PAYMENT_SUCCESS".to_string()),
            error: None,
            processed_at: Utc::now(),
        };
        assert!(store.record_processed(message.clone()).await.unwrap());
        assert!(!store.record_processed(message).await.unwrap());
        let found = store.find_processed("req-1").await.unwrap().unwrap();
        assert_eq!(found.result_id.as_deref(), Some("PAYMENT_SUCCESS"));
    }

    #[tokio::test]
    async fn test_lease_exclusive_until_released() {
        let store = InMemorySagaStore::new();
        let lease = Duration::from_secs(30);
        assert!(store.try_acquire("k", "a", lease).await.unwrap());
        assert!(!store.try_acquire("k", "b", lease).await.unwrap());
        assert!(!store.try_acquire("k", "a", lease).await.unwrap());
        assert!(!store.release("k", "b").await.unwrap());
        assert!(store.release("k", "a").await.unwrap());
        assert!(store.try_acquire("k", "b", lease).await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_lease_can_be_taken_over() {
        let store = InMemorySagaStore::new();
        assert!(
            store
                .try_acquire("k", "a", Duration::from_millis(1))
                .await
                .unwrap()
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(store.current_lease("k").await.unwrap().is_none());
        assert!(
            store
                .try_acquire("k", "b", Duration::from_secs(30))
                .await
                .unwrap()
        );
    }
}
