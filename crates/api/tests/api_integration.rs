//! Integration tests for the API server.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use api::AppState;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use metrics_exporter_prometheus::PrometheusHandle;
use saga::{EngineConfig, LeaseLockManager, LockManager, NodeEngine, SagaEngine, default_registry};
use saga_store::InMemorySagaStore;
use tower::ServiceExt;

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

fn get_metrics_handle() -> PrometheusHandle {
    METRICS_HANDLE
        .get_or_init(|| {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            builder
                .install_recorder()
                .expect("failed to install Prometheus recorder")
        })
        .clone()
}

fn setup_with_engine() -> (axum::Router, Arc<NodeEngine<InMemorySagaStore>>) {
    let store = InMemorySagaStore::new();
    let engine = Arc::new(SagaEngine::new(
        store.clone(),
        LeaseLockManager::new(store.clone(), "api-test", Duration::from_secs(30)),
        default_registry().unwrap(),
        EngineConfig::default(),
    ));
    let state = Arc::new(AppState::new(engine.clone(), store));
    (api::create_app(state, get_metrics_handle()), engine)
}

fn setup() -> axum::Router {
    setup_with_engine().0
}

async fn send(app: &axum::Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = if body.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null)
    };
    (status, json)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post(uri: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_string(&body).unwrap()))
        .unwrap()
}

async fn launch_order(app: &axum::Router, order_id: &str) -> String {
    let (status, json) = send(
        app,
        post_json(
            "/sagas",
            serde_json::json!({
                "context": { "orderId": order_id, "amount": 100.0, "userId": "U1" }
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    json["sagaId"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn test_health_check() {
    let app = setup();
    let (status, json) = send(&app, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
    assert_eq!(json["nodeId"], "orchestrator-local");
    assert_eq!(json["sagaTypes"][0], "ORDER_SAGA");
}

#[tokio::test]
async fn test_launch_and_get_saga() {
    let app = setup();
    let saga_id = launch_order(&app, "O1").await;

    let (status, json) = send(&app, get(&format!("/sagas/{saga_id}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["sagaType"], "ORDER_SAGA");
    assert_eq!(json["currentState"], "PAYMENT_PROCESSING");
    assert_eq!(json["status"], "IN_PROGRESS");
    assert_eq!(json["context"]["orderId"], "O1");
    assert_eq!(json["checkpoints"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_launch_rejects_invalid_context() {
    let app = setup();
    let (status, json) = send(
        &app,
        post_json(
            "/sagas",
            serde_json::json!({ "context": { "orderId": "O1" } }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(json["error"].as_str().unwrap().contains("Invalid context"));
}

#[tokio::test]
async fn test_launch_rejects_engine_owned_context_fields() {
    let (app, engine) = setup_with_engine();
    let saga_id = launch_order(&app, "O1").await;
    let first = engine
        .get(saga_store::SagaId::parse(&saga_id).unwrap())
        .await
        .unwrap()
        .unwrap();

    let (status, _) = send(
        &app,
        post_json(
            "/sagas",
            serde_json::json!({
                "context": {
                    "orderId": "O2",
                    "amount": 100.0,
                    "requestIds": first.context.request_ids
                }
            }),
        ),
    )
    .await;
    assert!(status.is_client_error());

    let (status, _) = send(
        &app,
        post_json(
            "/sagas",
            serde_json::json!({
                "context": { "orderId": "O2", "amount": 100.0, "paymentId": "PAY-0001" }
            }),
        ),
    )
    .await;
    assert!(status.is_client_error());

    let (_, json) = send(&app, get("/sagas?key=orderId&value=O2")).await;
    assert!(json.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_launch_rejects_unknown_saga_type() {
    let app = setup();
    let (status, _) = send(
        &app,
        post_json(
            "/sagas",
            serde_json::json!({
                "sagaType": "REFUND_SAGA",
                "context": { "orderId": "O1", "amount": 5.0 }
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_get_saga_not_found_and_bad_id() {
    let app = setup();
    let (status, _) = send(&app, get("/sagas/not-a-uuid")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(&app, get(&format!("/sagas/{}", uuid::Uuid::new_v4()))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_metadata_search() {
    let app = setup();
    let saga_id = launch_order(&app, "O-SEARCH").await;
    launch_order(&app, "O-OTHER").await;

    let (status, json) = send(&app, get("/sagas?key=orderId&value=O-SEARCH")).await;
    assert_eq!(status, StatusCode::OK);
    let found = json.as_array().unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0]["id"], saga_id.as_str());

    let (status, _) = send(&app, get("/sagas?key=orderId")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_history_summary_and_history_by_type() {
    let app = setup();
    let saga_id = launch_order(&app, "O1").await;
    launch_order(&app, "O2").await;

    let (status, json) = send(&app, get(&format!("/sagas/{saga_id}/history"))).await;
    assert_eq!(status, StatusCode::OK);
    let history = json.as_array().unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0]["event"], "START_SAGA");

    let (status, json) = send(&app, get(&format!("/sagas/{saga_id}/summary"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["totalSteps"], 1);
    assert_eq!(json["hasErrors"], false);

    let (status, json) = send(&app, get("/sagas/history/type/ORDER_SAGA?limit=1")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_compensate_endpoint() {
    let app = setup();
    let saga_id = launch_order(&app, "O1").await;

    let (status, json) = send(
        &app,
        post(&format!("/sagas/{saga_id}/compensate?reason=customer%20cancelled")),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["compensating"], true);

    let (_, json) = send(&app, get(&format!("/sagas/{saga_id}"))).await;
    assert_eq!(json["currentState"], "COMPENSATING_PAYMENT");
    assert_eq!(json["status"], "COMPENSATING");
    assert_eq!(json["compensationFromState"], "PAYMENT_PROCESSING");
}

#[tokio::test]
async fn test_lock_status_and_force_unlock() {
    let (app, engine) = setup_with_engine();
    let key = "saga:lock:api-test";

    let (status, json) = send(&app, get(&format!("/locks/{key}/status"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["locked"], false);

    assert!(engine.locks().try_lock(key, Duration::ZERO).await.unwrap());
    let (_, json) = send(&app, get(&format!("/locks/{key}/status"))).await;
    assert_eq!(json["locked"], true);
    assert_eq!(json["info"]["holder"], "api-test");

    let (status, _) = send(&app, post(&format!("/locks/{key}/force-unlock"))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, json) = send(
        &app,
        post(&format!("/locks/{key}/force-unlock?reason=stuck")),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["released"], true);
    assert!(!engine.locks().is_locked(key).await.unwrap());
}

#[tokio::test]
async fn test_outbox_stats_and_requeue() {
    let app = setup();
    launch_order(&app, "O1").await;

    let (status, json) = send(&app, get("/outbox/stats")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["pending"], 1);
    assert_eq!(json["sent"], 0);

    let (status, _) = send(
        &app,
        post(&format!("/outbox/{}/requeue", uuid::Uuid::new_v4())),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let app = setup();
    let (status, _) = send(&app, get("/metrics")).await;
    assert_eq!(status, StatusCode::OK);
}
