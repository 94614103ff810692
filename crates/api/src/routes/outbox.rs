//! Outbox statistics and failed-message requeue.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use saga_store::{MessageId, OutboxRepository, OutboxStats, SagaStore};
use serde::Serialize;

use crate::AppState;
use crate::error::ApiError;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequeueResponse {
    pub message_id: MessageId,
    pub requeued: bool,
}

/// GET /outbox/stats: message counts by status.
pub async fn stats<S: SagaStore + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
) -> Result<Json<OutboxStats>, ApiError> {
    Ok(Json(state.store.stats().await?))
}

/// POST /outbox/{id}/requeue: moves a FAILED message back to PENDING.
#[tracing::instrument(skip(state))]
pub async fn requeue<S: SagaStore + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
) -> Result<Json<RequeueResponse>, ApiError> {
    let message_id = MessageId::parse(&id)
        .map_err(|e| ApiError::BadRequest(format!("Invalid message id: {e}")))?;
    if state.store.get_message(message_id).await?.is_none() {
        return Err(ApiError::NotFound(format!("Message {id} not found")));
    }
    let requeued = state.store.requeue(message_id).await?;
    if requeued {
        tracing::warn!(%message_id, "failed outbox message requeued by operator");
    }
    Ok(Json(RequeueResponse {
        message_id,
        requeued,
    }))
}
