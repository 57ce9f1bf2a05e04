//! Health check endpoint
//!
//! Uptime, the last operational error and the depth of both queues.

use axum::{extract::State, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeMap;

use crate::transport::QueueDepth;
use crate::AppState;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// "ok", or "degraded" when the queues cannot be read
    pub status: String,
    /// Module name ("clipq-seq")
    pub module: String,
    /// Crate version from Cargo.toml
    pub version: String,
    /// Short git hash captured at build time
    pub git_hash: String,
    /// Seconds since service started
    pub uptime_seconds: u64,
    /// Session store backend ("sqlite" or "memory")
    pub store: String,
    /// Depth per queue name
    pub queues: BTreeMap<String, QueueDepth>,
    /// Last error message if any (for diagnostics)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let uptime = Utc::now().signed_duration_since(state.startup_time);
    let uptime_seconds = uptime.num_seconds().max(0) as u64;

    let mut status = "ok";
    let mut queues = BTreeMap::new();
    for queue in &state.queue_names {
        match state.transport.depth(queue).await {
            Ok(depth) => {
                queues.insert(queue.clone(), depth);
            }
            Err(e) => {
                tracing::warn!(queue = %queue, error = %e, "Queue depth unavailable");
                status = "degraded";
            }
        }
    }

    let last_error = state.last_error.read().await.clone();

    Json(HealthResponse {
        status: status.to_string(),
        module: "clipq-seq".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        git_hash: env!("GIT_HASH").to_string(),
        uptime_seconds,
        store: state.store.backend().to_string(),
        queues,
        last_error,
    })
}

/// Build health check routes
pub fn health_routes() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}
