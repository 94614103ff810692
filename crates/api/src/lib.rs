//! HTTP surface of the saga orchestrator.
//!
//! Provides the saga trigger plus administrative endpoints for inspecting
//! sagas, locks and the outbox, with structured logging (tracing) and
//! Prometheus metrics.

pub mod config;
pub mod error;
pub mod routes;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use saga::NodeEngine;
use saga_store::SagaStore;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Shared application state accessible from all handlers.
pub struct AppState<S: SagaStore + Clone> {
    pub engine: Arc<NodeEngine<S>>,
    pub store: S,
}

impl<S: SagaStore + Clone> AppState<S> {
    pub fn new(engine: Arc<NodeEngine<S>>, store: S) -> Self {
        Self { engine, store }
    }
}

/// Creates the Axum application router with all routes and shared state.
pub fn create_app<S: SagaStore + Clone + 'static>(
    state: Arc<AppState<S>>,
    metrics_handle: PrometheusHandle,
) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::get))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::health::check::<S>))
        .route(
            "/sagas",
            post(routes::sagas::start::<S>).get(routes::sagas::search::<S>),
        )
        .route("/sagas/{id}", get(routes::sagas::get::<S>))
        .route("/sagas/{id}/history", get(routes::sagas::history::<S>))
        .route("/sagas/{id}/summary", get(routes::sagas::summary::<S>))
        .route(
            "/sagas/{id}/compensate",
            post(routes::sagas::compensate::<S>),
        )
        .route(
            "/sagas/history/type/{saga_type}",
            get(routes::sagas::history_by_type::<S>),
        )
        .route("/locks/{key}/status", get(routes::locks::status::<S>))
        .route(
            "/locks/{key}/force-unlock",
            post(routes::locks::force_unlock::<S>),
        )
        .route("/outbox/stats", get(routes::outbox::stats::<S>))
        .route("/outbox/{id}/requeue", post(routes::outbox::requeue::<S>))
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}
