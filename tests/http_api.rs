//! HTTP surface tests driven through the router with `oneshot`

use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use slotkeeper::server::{build_router, AppState, ServerConfig};
use slotkeeper::storage::{MemoryCounterTable, MemoryLogStore};
use slotkeeper::{FolderService, ServiceOptions};
use std::sync::Arc;
use tower::ServiceExt;

async fn test_app(counters: MemoryCounterTable) -> Router {
    slotkeeper::metrics::init_metrics();
    let service = FolderService::open(
        Arc::new(MemoryLogStore::new()),
        Arc::new(counters),
        ServiceOptions {
            total_slots: None,
            rng_seed: Some(42),
        },
    )
    .await
    .unwrap();

    build_router(AppState {
        service: Arc::new(service),
        config: ServerConfig::default(),
    })
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
    };
    (status, body)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_json(body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn test_allocate_and_complete() {
    let app = test_app(MemoryCounterTable::with_group(2, vec![1, 1, 0, 1, 1])).await;

    let (status, body) = send(&app, get("/?groupId=2")).await;
    assert_eq!(status, StatusCode::OK);
    let folder_id = body["folderId"].as_u64().unwrap();
    let process_id = body["processId"].as_str().unwrap().to_string();
    assert!([1, 2, 4, 5].contains(&folder_id));
    assert_eq!(process_id.len(), 36);

    let (status, body) = send(
        &app,
        post_json(json!({
            "folderId": folder_id,
            "processId": process_id,
            "groupId": 2,
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["folderId"], folder_id);
    assert_eq!(body["groupId"], 2);
    assert!(body.get("error").is_none());

    // Same transaction again
    let (status, body) = send(
        &app,
        post_json(json!({
            "folderId": folder_id,
            "processId": process_id,
            "groupId": 2,
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["success"], false);
    assert!(body["error"].as_str().is_some());
}

#[tokio::test]
async fn test_completion_accepts_numeric_strings() {
    let app = test_app(MemoryCounterTable::with_group(3, vec![1])).await;

    let (_, body) = send(&app, get("/?groupId=3")).await;
    let process_id = body["processId"].as_str().unwrap().to_string();

    let (status, body) = send(
        &app,
        post_json(json!({
            "folderId": "1",
            "processId": process_id,
            "groupId": "3",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
}

#[tokio::test]
async fn test_unknown_group_is_not_found() {
    let app = test_app(MemoryCounterTable::with_group(1, vec![1])).await;

    let (status, body) = send(&app, get("/?groupId=99")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn test_bad_requests_are_rejected() {
    let app = test_app(MemoryCounterTable::with_group(1, vec![1])).await;

    let (status, _) = send(&app, get("/")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(&app, get("/?groupId=abc")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = send(&app, post_json(json!({ "folderId": 1, "groupId": 1 }))).await;
    assert!(status.is_client_error());
    assert_eq!(body["success"], false);

    let (status, body) = send(
        &app,
        post_json(json!({ "folderId": 1, "processId": "missing", "groupId": 1 })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["processId"], "missing");
}

#[tokio::test]
async fn test_folder_mismatch_is_conflict() {
    let app = test_app(MemoryCounterTable::with_group(1, vec![1, 1])).await;

    let (_, body) = send(&app, get("/?groupId=1")).await;
    let folder_id = body["folderId"].as_u64().unwrap();
    let process_id = body["processId"].as_str().unwrap().to_string();

    let (status, _) = send(
        &app,
        post_json(json!({ "folderId": 0, "processId": process_id, "groupId": 1 })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = send(
        &app,
        post_json(json!({ "folderId": folder_id, "processId": process_id, "groupId": 1 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_status_health_and_metrics() {
    let app = test_app(MemoryCounterTable::with_group(1, vec![1, 0, 1])).await;
    send(&app, get("/?groupId=1")).await;

    let (status, body) = send(&app, get("/status")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["groups"][0]["groupId"], 1);
    assert_eq!(body["groups"][0]["used"], 1);
    assert_eq!(body["transactions"]["pending"], 1);

    let (status, body) = send(&app, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");

    let (status, body) = send(&app, get("/metrics")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.as_str().unwrap().contains("slotkeeper_allocations_total"));
}
