use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{PgPool, Postgres, Row, Transaction, postgres::PgRow};
use uuid::Uuid;

use crate::store::lease_delta;
use crate::{
    Checkpoint, HistoryEntry, HistoryQuery, LeaseRepository, LockLease, MessageId,
    OutboxMessage, OutboxRepository, OutboxStats, OutboxStatus, ProcessedMessage,
    ProcessedMessageRepository, ProcessedStatus, Result, SagaId, SagaQuery, SagaRecord,
    SagaRepository, StoreError, TransitionWrite, validate_transition_write,
};

const SAGA_COLUMNS: &str = "id, saga_type, current_state, status, context, metadata, retry_count, \
     next_retry_at, compensation_triggered, compensation_from_state, error_message, created_at, \
     updated_at, timeout_at, completed_at, version";

const OUTBOX_COLUMNS: &str = "id, saga_id, exchange, routing_key, payload, idempotency_key, status, \
     retry_count, last_error, created_at, processed_at, claimed_by, claimed_until";

/// PostgreSQL-backed saga store.
#[derive(Clone)]
pub struct PostgresSagaStore {
    pool: PgPool,
}

impl PostgresSagaStore {
    /// Creates a new PostgreSQL saga store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connects a pool to `database_url`.
    pub async fn connect(database_url: &str) -> Result<Self> {
        Ok(Self::new(PgPool::connect(database_url).await?))
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    fn row_to_saga(row: PgRow) -> Result<SagaRecord> {
        let status: String = row.try_get("status")?;
        let metadata: serde_json::Value = row.try_get("metadata")?;
        let metadata: BTreeMap<String, String> = serde_json::from_value(metadata)?;

        Ok(SagaRecord {
            id: SagaId::from_uuid(row.try_get::<Uuid, _>("id")?),
            saga_type: row.try_get("saga_type")?,
            current_state: row.try_get("current_state")?,
            status: status.parse().map_err(StoreError::InvalidRow)?,
            context: row.try_get("context")?,
            metadata,
            retry_count: row.try_get::<i32, _>("retry_count")?.max(0) as u32,
            next_retry_at: row.try_get("next_retry_at")?,
            compensation_triggered: row.try_get("compensation_triggered")?,
            compensation_from_state: row.try_get("compensation_from_state")?,
            error_message: row.try_get("error_message")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            timeout_at: row.try_get("timeout_at")?,
            completed_at: row.try_get("completed_at")?,
            version: row.try_get("version")?,
        })
    }

    fn row_to_checkpoint(row: PgRow) -> Result<Checkpoint> {
        Ok(Checkpoint {
            saga_id: SagaId::from_uuid(row.try_get::<Uuid, _>("saga_id")?),
            sequence: row.try_get("sequence")?,
            state: row.try_get("state")?,
            event: row.try_get("event")?,
            action_result: row.try_get("action_result")?,
            retry_count: row.try_get::<i32, _>("retry_count")?.max(0) as u32,
            error: row.try_get("error")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn row_to_history(row: PgRow) -> Result<HistoryEntry> {
        Ok(HistoryEntry {
            saga_id: SagaId::from_uuid(row.try_get::<Uuid, _>("saga_id")?),
            saga_type: row.try_get("saga_type")?,
            source_state: row.try_get("source_state")?,
            target_state: row.try_get("target_state")?,
            event: row.try_get("event")?,
            action_name: row.try_get("action_name")?,
            duration_ms: row.try_get("duration_ms")?,
            error: row.try_get("error")?,
            is_compensation: row.try_get("is_compensation")?,
            instance_id: row.try_get("instance_id")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn row_to_message(row: PgRow) -> Result<OutboxMessage> {
        let status: String = row.try_get("status")?;
        Ok(OutboxMessage {
            id: MessageId::from_uuid(row.try_get::<Uuid, _>("id")?),
            saga_id: row
                .try_get::<Option<Uuid>, _>("saga_id")?
                .map(SagaId::from_uuid),
            exchange: row.try_get("exchange")?,
            routing_key: row.try_get("routing_key")?,
            payload: row.try_get("payload")?,
            idempotency_key: row.try_get("idempotency_key")?,
            status: status.parse().map_err(StoreError::InvalidRow)?,
            retry_count: row.try_get::<i32, _>("retry_count")?.max(0) as u32,
            last_error: row.try_get("last_error")?,
            created_at: row.try_get("created_at")?,
            processed_at: row.try_get("processed_at")?,
            claimed_by: row.try_get("claimed_by")?,
            claimed_until: row.try_get("claimed_until")?,
        })
    }

    fn row_to_lease(row: PgRow) -> Result<LockLease> {
        Ok(LockLease {
            key: row.try_get("key")?,
            holder: row.try_get("holder")?,
            acquired_at: row.try_get("acquired_at")?,
            expires_at: row.try_get("expires_at")?,
        })
    }

    async fn insert_checkpoint(
        tx: &mut Transaction<'_, Postgres>,
        checkpoint: &Checkpoint,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO saga_checkpoints (saga_id, sequence, state, event, action_result, retry_count, error, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(checkpoint.saga_id.as_uuid())
        .bind(checkpoint.sequence)
        .bind(&checkpoint.state)
        .bind(&checkpoint.event)
        .bind(&checkpoint.action_result)
        .bind(checkpoint.retry_count as i32)
        .bind(&checkpoint.error)
        .bind(checkpoint.created_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn insert_history(tx: &mut Transaction<'_, Postgres>, entry: &HistoryEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO saga_history (saga_id, saga_type, source_state, target_state, event, action_name,
                                      duration_ms, error, is_compensation, instance_id, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(entry.saga_id.as_uuid())
        .bind(&entry.saga_type)
        .bind(&entry.source_state)
        .bind(&entry.target_state)
        .bind(&entry.event)
        .bind(&entry.action_name)
        .bind(entry.duration_ms)
        .bind(&entry.error)
        .bind(entry.is_compensation)
        .bind(&entry.instance_id)
        .bind(entry.created_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn insert_message<'e, E>(executor: E, message: &OutboxMessage) -> Result<()>
    where
        E: sqlx::Executor<'e, Database = Postgres>,
    {
        sqlx::query(
            r#"
            INSERT INTO outbox_messages (id, saga_id, exchange, routing_key, payload, idempotency_key,
                                         status, retry_count, last_error, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(message.id.as_uuid())
        .bind(message.saga_id.map(|id| id.as_uuid()))
        .bind(&message.exchange)
        .bind(&message.routing_key)
        .bind(&message.payload)
        .bind(&message.idempotency_key)
        .bind(message.status.as_str())
        .bind(message.retry_count as i32)
        .bind(&message.last_error)
        .bind(message.created_at)
        .execute(executor)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl SagaRepository for PostgresSagaStore {
    async fn create(&self, record: SagaRecord, checkpoint: Checkpoint) -> Result<()> {
        if record.version != 1 || checkpoint.sequence != 1 {
            return Err(StoreError::InvalidWrite(
                "a new saga starts at version 1".to_string(),
            ));
        }
        let saga_id = record.id;
        let metadata = serde_json::to_value(&record.metadata)?;

        let mut tx = self.pool.begin().await?;

        sqlx::query(&format!(
            "INSERT INTO saga_instances ({SAGA_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)"
        ))
        .bind(record.id.as_uuid())
        .bind(&record.saga_type)
        .bind(&record.current_state)
        .bind(record.status.as_str())
        .bind(&record.context)
        .bind(metadata)
        .bind(record.retry_count as i32)
        .bind(record.next_retry_at)
        .bind(record.compensation_triggered)
        .bind(&record.compensation_from_state)
        .bind(&record.error_message)
        .bind(record.created_at)
        .bind(record.updated_at)
        .bind(record.timeout_at)
        .bind(record.completed_at)
        .bind(record.version)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(ref db_err) = e
                && db_err.constraint() == Some("saga_instances_pkey")
            {
                return StoreError::SagaExists(saga_id);
            }
            StoreError::Database(e)
        })?;

        Self::insert_checkpoint(&mut tx, &checkpoint).await?;

        tx.commit().await?;
        Ok(())
    }

    #[tracing::instrument(skip(self, write), fields(saga_id = %write.record.id, version = write.record.version))]
    async fn commit(&self, write: TransitionWrite) -> Result<()> {
        validate_transition_write(&write)?;

        let record = &write.record;
        let saga_id = record.id;
        let metadata = serde_json::to_value(&record.metadata)?;

        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE saga_instances SET
                current_state = $2,
                status = $3,
                context = $4,
                metadata = $5,
                retry_count = $6,
                next_retry_at = $7,
                compensation_triggered = $8,
                compensation_from_state = $9,
                error_message = $10,
                updated_at = $11,
                completed_at = $12,
                version = $13
            WHERE id = $1 AND version = $14
            "#,
        )
        .bind(saga_id.as_uuid())
        .bind(&record.current_state)
        .bind(record.status.as_str())
        .bind(&record.context)
        .bind(metadata)
        .bind(record.retry_count as i32)
        .bind(record.next_retry_at)
        .bind(record.compensation_triggered)
        .bind(&record.compensation_from_state)
        .bind(&record.error_message)
        .bind(record.updated_at)
        .bind(record.completed_at)
        .bind(record.version)
        .bind(write.expected_version)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            let actual: Option<i64> =
                sqlx::query_scalar("SELECT version FROM saga_instances WHERE id = $1")
                    .bind(saga_id.as_uuid())
                    .fetch_optional(&mut *tx)
                    .await?;
            return Err(match actual {
                Some(actual) => {
                    metrics::counter!("saga_store_version_conflicts_total", "backend" => "postgres")
                        .increment(1);
                    tracing::debug!(expected = write.expected_version, actual, "version conflict, transition discarded");
                    StoreError::ConcurrencyConflict {
                        saga_id,
                        expected: write.expected_version,
                        actual,
                    }
                }
                None => StoreError::SagaNotFound(saga_id),
            });
        }

        Self::insert_checkpoint(&mut tx, &write.checkpoint).await?;
        if let Some(ref entry) = write.history {
            Self::insert_history(&mut tx, entry).await?;
        }
        for message in &write.outbox {
            Self::insert_message(&mut *tx, message).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get(&self, saga_id: SagaId) -> Result<Option<SagaRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {SAGA_COLUMNS} FROM saga_instances WHERE id = $1"
        ))
        .bind(saga_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_saga).transpose()
    }

    async fn checkpoints(&self, saga_id: SagaId) -> Result<Vec<Checkpoint>> {
        let rows = sqlx::query(
            r#"
            SELECT saga_id, sequence, state, event, action_result, retry_count, error, created_at
            FROM saga_checkpoints
            WHERE saga_id = $1
            ORDER BY sequence ASC
            "#,
        )
        .bind(saga_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_checkpoint).collect()
    }

    async fn find(&self, query: SagaQuery) -> Result<Vec<SagaRecord>> {
        let mut sql = format!("SELECT {SAGA_COLUMNS} FROM saga_instances WHERE 1=1");
        let mut param_count = 0;

        if query.statuses.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND status = ANY(${param_count})"));
        }
        if query.saga_type.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND saga_type = ${param_count}"));
        }
        if query.updated_before.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND updated_at < ${param_count}"));
        }
        if query.timeout_before.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND timeout_at < ${param_count}"));
        }
        if query.metadata.is_some() {
            sql.push_str(&format!(
                " AND metadata ->> ${} = ${}",
                param_count + 1,
                param_count + 2
            ));
            param_count += 2;
        }

        sql.push_str(" ORDER BY updated_at ASC, id ASC");

        if query.limit.is_some() {
            param_count += 1;
            sql.push_str(&format!(" LIMIT ${param_count}"));
        }

        let mut sqlx_query = sqlx::query(&sql);

        if let Some(statuses) = query.statuses {
            let statuses: Vec<String> = statuses.iter().map(|s| s.as_str().to_string()).collect();
            sqlx_query = sqlx_query.bind(statuses);
        }
        if let Some(saga_type) = query.saga_type {
            sqlx_query = sqlx_query.bind(saga_type);
        }
        if let Some(before) = query.updated_before {
            sqlx_query = sqlx_query.bind(before);
        }
        if let Some(before) = query.timeout_before {
            sqlx_query = sqlx_query.bind(before);
        }
        if let Some((key, value)) = query.metadata {
            sqlx_query = sqlx_query.bind(key).bind(value);
        }
        if let Some(limit) = query.limit {
            sqlx_query = sqlx_query.bind(limit as i64);
        }

        let rows = sqlx_query.fetch_all(&self.pool).await?;
        rows.into_iter().map(Self::row_to_saga).collect()
    }

    async fn history(&self, query: HistoryQuery) -> Result<Vec<HistoryEntry>> {
        let mut sql = String::from(
            "SELECT saga_id, saga_type, source_state, target_state, event, action_name, duration_ms, \
             error, is_compensation, instance_id, created_at FROM saga_history WHERE 1=1",
        );
        let mut param_count = 0;

        if query.saga_id.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND saga_id = ${param_count}"));
        }
        if query.saga_type.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND saga_type = ${param_count}"));
        }
        if query.source_state.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND source_state = ${param_count}"));
        }
        if query.target_state.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND target_state = ${param_count}"));
        }

        sql.push_str(" ORDER BY created_at ASC, id ASC");

        if query.limit.is_some() {
            param_count += 1;
            sql.push_str(&format!(" LIMIT ${param_count}"));
        }

        let mut sqlx_query = sqlx::query(&sql);

        if let Some(id) = query.saga_id {
            sqlx_query = sqlx_query.bind(id.as_uuid());
        }
        if let Some(saga_type) = query.saga_type {
            sqlx_query = sqlx_query.bind(saga_type);
        }
        if let Some(source) = query.source_state {
            sqlx_query = sqlx_query.bind(source);
        }
        if let Some(target) = query.target_state {
            sqlx_query = sqlx_query.bind(target);
        }
        if let Some(limit) = query.limit {
            sqlx_query = sqlx_query.bind(limit as i64);
        }

        let rows = sqlx_query.fetch_all(&self.pool).await?;
        rows.into_iter().map(Self::row_to_history).collect()
    }
}

#[async_trait]
impl OutboxRepository for PostgresSagaStore {
    async fn stage(&self, message: OutboxMessage) -> Result<()> {
        Self::insert_message(&self.pool, &message).await
    }

    async fn claim_pending(
        &self,
        worker: &str,
        limit: usize,
        lease: Duration,
    ) -> Result<Vec<OutboxMessage>> {
        let now = Utc::now();
        let rows = sqlx::query(&format!(
            r#"
            UPDATE outbox_messages SET claimed_by = $1, claimed_until = $2
            WHERE id IN (
                SELECT id FROM outbox_messages
                WHERE status = 'PENDING' AND (claimed_until IS NULL OR claimed_until <= $3)
                ORDER BY created_at ASC
                LIMIT $4
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {OUTBOX_COLUMNS}
            "#
        ))
        .bind(worker)
        .bind(now + lease_delta(lease))
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut messages = rows
            .into_iter()
            .map(Self::row_to_message)
            .collect::<Result<Vec<_>>>()?;
        messages.sort_by_key(|m| m.created_at);
        if !messages.is_empty() {
            tracing::debug!(worker, claimed = messages.len(), "outbox batch claimed");
        }
        Ok(messages)
    }

    async fn is_key_sent(&self, idempotency_key: &str) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM outbox_messages WHERE idempotency_key = $1 AND status = 'SENT')",
        )
        .bind(idempotency_key)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn mark_sent(&self, id: MessageId) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE outbox_messages
            SET status = 'SENT', processed_at = $2, claimed_by = NULL, claimed_until = NULL
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(ref db_err) = e
                && db_err.constraint() == Some("unique_outbox_sent_key")
            {
                return StoreError::DuplicateKey(format!("message {id}"));
            }
            StoreError::Database(e)
        })?;
        Ok(())
    }

    async fn mark_duplicate(&self, id: MessageId) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE outbox_messages
            SET status = 'DUPLICATE', processed_at = $2, claimed_by = NULL, claimed_until = NULL
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_failure(
        &self,
        id: MessageId,
        error: &str,
        max_retries: u32,
    ) -> Result<OutboxStatus> {
        let status: Option<String> = sqlx::query_scalar(
            r#"
            UPDATE outbox_messages SET
                retry_count = retry_count + 1,
                last_error = $2,
                claimed_by = NULL,
                claimed_until = NULL,
                status = CASE WHEN retry_count + 1 >= $3 THEN 'FAILED' ELSE status END,
                processed_at = CASE WHEN retry_count + 1 >= $3 THEN $4 ELSE processed_at END
            WHERE id = $1
            RETURNING status
            "#,
        )
        .bind(id.as_uuid())
        .bind(error)
        .bind(max_retries as i32)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await?;

        match status {
            Some(status) => status.parse().map_err(StoreError::InvalidRow),
            None => Ok(OutboxStatus::Failed),
        }
    }

    async fn get_message(&self, id: MessageId) -> Result<Option<OutboxMessage>> {
        let row = sqlx::query(&format!(
            "SELECT {OUTBOX_COLUMNS} FROM outbox_messages WHERE id = $1"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_message).transpose()
    }

    async fn messages_for_saga(&self, saga_id: SagaId) -> Result<Vec<OutboxMessage>> {
        let rows = sqlx::query(&format!(
            "SELECT {OUTBOX_COLUMNS} FROM outbox_messages WHERE saga_id = $1 ORDER BY created_at ASC"
        ))
        .bind(saga_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_message).collect()
    }

    async fn stats(&self) -> Result<OutboxStats> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM outbox_messages GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        let mut stats = OutboxStats::default();
        for (status, count) in rows {
            let status: OutboxStatus = status.parse().map_err(StoreError::InvalidRow)?;
            stats.add(status, count.max(0) as u64);
        }
        Ok(stats)
    }

    async fn requeue(&self, id: MessageId) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_messages
            SET status = 'PENDING', retry_count = 0, processed_at = NULL
            WHERE id = $1 AND status = 'FAILED'
            "#,
        )
        .bind(id.as_uuid())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl ProcessedMessageRepository for PostgresSagaStore {
    async fn find_processed(&self, request_id: &str) -> Result<Option<ProcessedMessage>> {
        let row = sqlx::query(
            r#"
            SELECT request_id, saga_id, service_name, operation, status, result_id, error, processed_at
            FROM processed_messages
            WHERE request_id = $1
            "#,
        )
        .bind(request_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let status: String = row.try_get("status")?;
        let status: ProcessedStatus = status.parse().map_err(StoreError::InvalidRow)?;
        Ok(Some(ProcessedMessage {
            request_id: row.try_get("request_id")?,
            saga_id: row
                .try_get::<Option<Uuid>, _>("saga_id")?
                .map(SagaId::from_uuid),
            service_name: row.try_get("service_name")?,
            operation: row.try_get("operation")?,
            status,
            result_id: row.try_get("result_id")?,
            error: row.try_get("error")?,
            processed_at: row.try_get("processed_at")?,
        }))
    }

    async fn record_processed(&self, message: ProcessedMessage) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO processed_messages (request_id, saga_id, service_name, operation, status, result_id, error, processed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (request_id) DO NOTHING
            "#,
        )
        .bind(&message.request_id)
        .bind(message.saga_id.map(|id| id.as_uuid()))
        .bind(&message.service_name)
        .bind(&message.operation)
        .bind(message.status.as_str())
        .bind(&message.result_id)
        .bind(&message.error)
        .bind(message.processed_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl LeaseRepository for PostgresSagaStore {
    async fn try_acquire(&self, key: &str, holder: &str, lease: Duration) -> Result<bool> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO saga_locks (key, holder, acquired_at, expires_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (key) DO UPDATE SET
                holder = EXCLUDED.holder,
                acquired_at = EXCLUDED.acquired_at,
                expires_at = EXCLUDED.expires_at
            WHERE saga_locks.expires_at <= EXCLUDED.acquired_at
            "#,
        )
        .bind(key)
        .bind(holder)
        .bind(now)
        .bind(now + lease_delta(lease))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn release(&self, key: &str, holder: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM saga_locks WHERE key = $1 AND holder = $2")
            .bind(key)
            .bind(holder)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn force_release(&self, key: &str) -> Result<Option<LockLease>> {
        let row = sqlx::query(
            "DELETE FROM saga_locks WHERE key = $1 RETURNING key, holder, acquired_at, expires_at",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Self::row_to_lease).transpose()
    }

    async fn current_lease(&self, key: &str) -> Result<Option<LockLease>> {
        let row = sqlx::query(
            r#"
            SELECT key, holder, acquired_at, expires_at
            FROM saga_locks
            WHERE key = $1 AND expires_at > $2
            "#,
        )
        .bind(key)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await?;
        row.map(Self::row_to_lease).transpose()
    }
}
