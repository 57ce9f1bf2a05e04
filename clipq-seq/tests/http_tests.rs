//! Operational HTTP API

mod helpers;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use clipq_common::db::init_database;
use clipq_seq::store::{SessionStore, SqliteSessionStore};
use clipq_seq::transport::{MessageTransport, SqliteQueue};
use clipq_seq::{build_router, AppState};
use helpers::job;
use http_body_util::BodyExt;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tower::ServiceExt;

async fn test_app_state() -> (TempDir, AppState) {
    let dir = tempfile::tempdir().unwrap();
    let pool = init_database(&dir.path().join("clipq.db")).await.unwrap();
    let state = AppState::new(
        Arc::new(SqliteSessionStore::new(pool.clone())),
        Arc::new(SqliteQueue::new(pool, Duration::from_secs(60))),
        vec!["uploads".to_string(), "segments".to_string()],
    );
    (dir, state)
}

async fn get_json(state: AppState, uri: &str) -> (StatusCode, Value) {
    let response = build_router(state)
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, serde_json::from_slice(&body).unwrap())
}

#[tokio::test]
async fn test_health_reports_queues_and_store() {
    let (_dir, state) = test_app_state().await;
    state.transport.publish("segments", "{}").await.unwrap();
    state.transport.publish("segments", "{}").await.unwrap();
    state.transport.receive("segments").await.unwrap().unwrap();

    let (status, json) = get_json(state, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
    assert_eq!(json["module"], "clipq-seq");
    assert_eq!(json["store"], "sqlite");
    assert_eq!(json["queues"]["segments"]["ready"], 1);
    assert_eq!(json["queues"]["segments"]["leased"], 1);
    assert_eq!(json["queues"]["uploads"]["ready"], 0);
    assert!(json.get("last_error").is_none());
}

#[tokio::test]
async fn test_health_surfaces_last_error() {
    let (_dir, state) = test_app_state().await;
    *state.last_error.write().await = Some("message 7 on segments dead-lettered".to_string());

    let (status, json) = get_json(state, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["last_error"], "message 7 on segments dead-lettered");
}

#[tokio::test]
async fn test_session_snapshot() {
    let (_dir, state) = test_app_state().await;
    state.store.get_or_create("talk-1").await.unwrap();
    state.store.activate("talk-1", "conv-1").await.unwrap();
    state.store.buffer(&job("talk-1", 2, false)).await.unwrap();

    let (status, json) = get_json(state, "/sessions/talk-1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["id"], "talk-1");
    assert_eq!(json["status"], "active");
    assert_eq!(json["cursor"], 0);
    assert_eq!(json["pending"], serde_json::json!([2]));
    assert_eq!(json["conversation_handle"], "conv-1");
}

#[tokio::test]
async fn test_unknown_session_is_not_found() {
    let (_dir, state) = test_app_state().await;

    let (status, json) = get_json(state, "/sessions/nope").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["error"]["code"], "NOT_FOUND");
    assert!(json["error"]["message"].as_str().unwrap().contains("nope"));
}
