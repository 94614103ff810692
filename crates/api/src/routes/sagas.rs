//! Saga trigger and inspection endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use saga::order_saga::ORDER_SAGA;
use saga::{ContextInput, SagaInstance, SagaSummary};
use saga_store::{HistoryEntry, SagaId, SagaStore};
use serde::{Deserialize, Serialize};

use crate::AppState;
use crate::error::ApiError;

const DEFAULT_HISTORY_LIMIT: usize = 100;

// -- Request types --

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartSagaRequest {
    pub saga_type: Option<String>,
    pub context: ContextInput,
}

#[derive(Deserialize)]
pub struct MetadataSearch {
    pub key: Option<String>,
    pub value: Option<String>,
}

#[derive(Deserialize)]
pub struct HistoryParams {
    pub limit: Option<usize>,
}

#[derive(Deserialize)]
pub struct CompensateParams {
    pub reason: Option<String>,
}

// -- Response types --

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SagaStartedResponse {
    pub saga_id: SagaId,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompensateResponse {
    pub saga_id: SagaId,
    pub compensating: bool,
}

// -- Handlers --

/// POST /sagas: start a saga and fire its start event.
#[tracing::instrument(skip(state, req))]
pub async fn start<S: SagaStore + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Json(req): Json<StartSagaRequest>,
) -> Result<(StatusCode, Json<SagaStartedResponse>), ApiError> {
    let saga_type = req.saga_type.as_deref().unwrap_or(ORDER_SAGA);
    let saga_id = state.engine.launch(saga_type, req.context.into()).await?;
    metrics::counter!("api_sagas_launched_total", "saga_type" => saga_type.to_string())
        .increment(1);
    tracing::info!(%saga_id, saga_type, "saga launched via API");
    Ok((StatusCode::CREATED, Json(SagaStartedResponse { saga_id })))
}

/// GET /sagas/{id}: status, context and checkpoints.
#[tracing::instrument(skip(state))]
pub async fn get<S: SagaStore + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
) -> Result<Json<SagaInstance>, ApiError> {
    let saga_id = parse_saga_id(&id)?;
    let saga = state
        .engine
        .get(saga_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Saga {id} not found")))?;
    Ok(Json(saga))
}

/// GET /sagas?key=&value=: search by metadata.
#[tracing::instrument(skip(state, params))]
pub async fn search<S: SagaStore + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Query(params): Query<MetadataSearch>,
) -> Result<Json<Vec<SagaInstance>>, ApiError> {
    let (Some(key), Some(value)) = (params.key, params.value) else {
        return Err(ApiError::BadRequest(
            "both key and value query parameters are required".to_string(),
        ));
    };
    Ok(Json(state.engine.find_by_metadata(&key, &value).await?))
}

/// GET /sagas/{id}/history: transitions of one saga, oldest first.
#[tracing::instrument(skip(state))]
pub async fn history<S: SagaStore + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
) -> Result<Json<Vec<HistoryEntry>>, ApiError> {
    let saga_id = parse_saga_id(&id)?;
    Ok(Json(state.engine.history(saga_id).await?))
}

/// GET /sagas/{id}/summary: aggregated view of the audit trail.
#[tracing::instrument(skip(state))]
pub async fn summary<S: SagaStore + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
) -> Result<Json<SagaSummary>, ApiError> {
    let saga_id = parse_saga_id(&id)?;
    let summary = state
        .engine
        .summary(saga_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Saga {id} not found")))?;
    Ok(Json(summary))
}

/// GET /sagas/history/type/{type}?limit=: recent transitions of a saga type.
#[tracing::instrument(skip(state, params))]
pub async fn history_by_type<S: SagaStore + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(saga_type): Path<String>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<Vec<HistoryEntry>>, ApiError> {
    let limit = params.limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
    Ok(Json(
        state.engine.history_by_type(&saga_type, Some(limit)).await?,
    ))
}

/// POST /sagas/{id}/compensate?reason=: operator-initiated compensation.
#[tracing::instrument(skip(state, params))]
pub async fn compensate<S: SagaStore + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
    Query(params): Query<CompensateParams>,
) -> Result<Json<CompensateResponse>, ApiError> {
    let saga_id = parse_saga_id(&id)?;
    let reason = params
        .reason
        .unwrap_or_else(|| "compensation requested by operator".to_string());
    let compensating = state.engine.compensate(saga_id, &reason).await?;
    Ok(Json(CompensateResponse {
        saga_id,
        compensating,
    }))
}

fn parse_saga_id(id: &str) -> Result<SagaId, ApiError> {
    SagaId::parse(id).map_err(|e| ApiError::BadRequest(format!("Invalid saga id: {e}")))
}
