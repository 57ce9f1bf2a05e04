//! OpenAI Assistants provider against a local mock of the API

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use clipq_seq::provider::{
    FeedbackProvider, OpenAiAssistantProvider, OpenAiSettings, ProviderError, SegmentInput,
    SessionContext,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct MockApi {
    /// Status reported once the run has been polled twice; `None` never finishes
    final_status: Option<&'static str>,
    reject_threads: bool,
    polls: AtomicU32,
    posted: Mutex<Vec<Value>>,
    headers: Mutex<Option<HeaderMap>>,
}

type Mock = Arc<MockApi>;

async fn create_thread(
    State(mock): State<Mock>,
    headers: HeaderMap,
) -> Result<Json<Value>, (StatusCode, String)> {
    *mock.headers.lock().unwrap() = Some(headers);
    if mock.reject_threads {
        return Err((StatusCode::TOO_MANY_REQUESTS, "slow down".into()));
    }
    Ok(Json(json!({ "id": "thread_1" })))
}

async fn add_message(
    State(mock): State<Mock>,
    Path(_thread): Path<String>,
    Json(body): Json<Value>,
) -> Json<Value> {
    mock.posted.lock().unwrap().push(body);
    Json(json!({ "id": "msg_1" }))
}

async fn list_messages(Path(_thread): Path<String>) -> Json<Value> {
    Json(json!({
        "data": [{ "content": [{ "type": "text", "text": { "value": "Clear structure, 8/10" } }] }]
    }))
}

async fn start_run(Path(_thread): Path<String>) -> Json<Value> {
    Json(json!({ "id": "run_1", "status": "queued" }))
}

async fn get_run(
    State(mock): State<Mock>,
    Path((_thread, run)): Path<(String, String)>,
) -> Json<Value> {
    let polls = mock.polls.fetch_add(1, Ordering::SeqCst) + 1;
    match mock.final_status {
        Some(status) if polls >= 2 => Json(json!({
            "id": run,
            "status": status,
            "last_error": if status == "failed" {
                json!({ "code": "server_error", "message": "overloaded" })
            } else {
                Value::Null
            },
        })),
        _ => Json(json!({ "id": run, "status": "in_progress" })),
    }
}

async fn start_mock(
    mock: MockApi,
    completion_timeout: Duration,
) -> (Mock, OpenAiAssistantProvider) {
    let mock = Arc::new(mock);
    let app = Router::new()
        .route("/v1/threads", post(create_thread))
        .route("/v1/threads/:thread/messages", post(add_message).get(list_messages))
        .route("/v1/threads/:thread/runs", post(start_run))
        .route("/v1/threads/:thread/runs/:run", get(get_run))
        .with_state(mock.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let provider = OpenAiAssistantProvider::new(OpenAiSettings {
        base_url: format!("http://{}/v1", addr),
        api_key: "sk-test".into(),
        organization: Some("org_1".into()),
        project: None,
        assistant_id: "asst_1".into(),
        request_timeout: Duration::from_secs(5),
        completion_timeout,
        poll_initial: Duration::from_millis(5),
        poll_max: Duration::from_millis(20),
    })
    .unwrap();
    (mock, provider)
}

fn context() -> SessionContext {
    SessionContext {
        session_id: "talk-1".into(),
    }
}

#[tokio::test]
async fn test_segment_exchange_returns_latest_reply() {
    let (mock, provider) = start_mock(
        MockApi {
            final_status: Some("completed"),
            ..MockApi::default()
        },
        Duration::from_secs(5),
    )
    .await;

    let thread = provider.initialize_session(&context()).await.unwrap();
    assert_eq!(thread, "thread_1");

    let headers = mock.headers.lock().unwrap().clone().unwrap();
    assert_eq!(headers["authorization"], "Bearer sk-test");
    assert_eq!(headers["openai-beta"], "assistants=v2");
    assert_eq!(headers["openai-organization"], "org_1");

    let feedback = provider
        .submit_segment(
            &thread,
            &SegmentInput {
                index: 3,
                transcript: "thanks for coming".into(),
                slide_url: Some("https://slides/3.png".into()),
            },
        )
        .await
        .unwrap();
    assert_eq!(feedback, "Clear structure, 8/10");
    assert!(mock.polls.load(Ordering::SeqCst) >= 2);

    let posted = mock.posted.lock().unwrap().clone();
    assert_eq!(posted.len(), 1);
    assert_eq!(posted[0]["role"], "user");
    let content = posted[0]["content"].as_array().unwrap();
    assert!(content[0]["text"]
        .as_str()
        .unwrap()
        .starts_with("Transcript 3: thanks for coming"));
    assert_eq!(content[1]["image_url"]["url"], "https://slides/3.png");
}

#[tokio::test]
async fn test_failed_run_is_transient_error() {
    let (_mock, provider) = start_mock(
        MockApi {
            final_status: Some("failed"),
            ..MockApi::default()
        },
        Duration::from_secs(5),
    )
    .await;

    let err = provider.finalize("thread_1").await.unwrap_err();
    match &err {
        ProviderError::Run { status, detail, .. } => {
            assert_eq!(status, "failed");
            assert!(detail.contains("overloaded"));
        }
        other => panic!("expected run error, got {:?}", other),
    }
    assert!(err.is_transient());
}

#[tokio::test]
async fn test_run_that_never_completes_times_out() {
    let (_mock, provider) = start_mock(MockApi::default(), Duration::from_millis(80)).await;

    let err = provider.await_run("thread_1", "run_1").await.unwrap_err();
    assert!(matches!(err, ProviderError::Timeout(_)), "{:?}", err);
}

#[tokio::test]
async fn test_rate_limited_request_is_api_error() {
    let (_mock, provider) = start_mock(
        MockApi {
            reject_threads: true,
            ..MockApi::default()
        },
        Duration::from_secs(5),
    )
    .await;

    let err = provider.initialize_session(&context()).await.unwrap_err();
    assert!(matches!(err, ProviderError::Api { status: 429, .. }), "{:?}", err);
    assert!(err.is_transient());
}
