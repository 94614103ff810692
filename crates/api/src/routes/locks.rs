//! Distributed lock inspection and administrative release.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use saga::{LockInfo, LockManager};
use saga_store::SagaStore;
use serde::{Deserialize, Serialize};

use crate::AppState;
use crate::error::ApiError;

#[derive(Deserialize)]
pub struct ForceUnlockParams {
    pub reason: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LockStatusResponse {
    pub key: String,
    pub locked: bool,
    pub info: Option<LockInfo>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ForceUnlockResponse {
    pub key: String,
    pub released: bool,
}

/// GET /locks/{key}/status: holder and remaining lease.
#[tracing::instrument(skip(state))]
pub async fn status<S: SagaStore + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(key): Path<String>,
) -> Result<Json<LockStatusResponse>, ApiError> {
    let info = state.engine.locks().lock_info(&key).await?;
    Ok(Json(LockStatusResponse {
        key,
        locked: info.is_some(),
        info,
    }))
}

/// POST /locks/{key}/force-unlock?reason=: releases a lock whoever holds it.
#[tracing::instrument(skip(state, params))]
pub async fn force_unlock<S: SagaStore + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(key): Path<String>,
    Query(params): Query<ForceUnlockParams>,
) -> Result<Json<ForceUnlockResponse>, ApiError> {
    let reason = params.reason.ok_or_else(|| {
        ApiError::BadRequest("a reason is required to force a lock release".to_string())
    })?;
    let released = state.engine.locks().force_unlock(&key, &reason).await?;
    Ok(Json(ForceUnlockResponse { key, released }))
}
