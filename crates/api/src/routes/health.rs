//! Liveness endpoint.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use saga_store::SagaStore;
use serde::Serialize;

use crate::AppState;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub node_id: String,
    pub saga_types: Vec<String>,
}

/// GET /health: node identity and the saga types it can run.
pub async fn check<S: SagaStore + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        node_id: state.engine.config().node_id.clone(),
        saga_types: state
            .engine
            .definitions()
            .saga_types()
            .into_iter()
            .map(str::to_string)
            .collect(),
    })
}
