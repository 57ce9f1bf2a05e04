//! clipq-seq library interface
//!
//! The session resequencer and everything around it: the session store, the
//! feedback consumer and provider, the intake stage, the durable queue, the
//! worker pool and the operational HTTP API.

pub mod api;
pub mod config;
pub mod consumer;
pub mod db;
pub mod error;
pub mod ingest;
pub mod provider;
pub mod resequencer;
pub mod store;
pub mod transport;
pub mod utils;
pub mod worker;

pub use crate::error::{ApiError, ApiResult};
pub use crate::resequencer::{AdmitOutcome, OrderedConsumer, Resequencer, ResequencerSettings};

use axum::Router;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::RwLock;
use tower_http::trace::TraceLayer;

use crate::store::SessionStore;
use crate::transport::MessageTransport;
use crate::worker::LastError;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn SessionStore>,
    pub transport: Arc<dyn MessageTransport>,
    /// Queues reported by `/health`
    pub queue_names: Vec<String>,
    /// Service startup timestamp for uptime tracking
    pub startup_time: DateTime<Utc>,
    /// Last error for diagnostic purposes, shared with the workers
    pub last_error: LastError,
}

impl AppState {
    pub fn new(
        store: Arc<dyn SessionStore>,
        transport: Arc<dyn MessageTransport>,
        queue_names: Vec<String>,
    ) -> Self {
        Self {
            store,
            transport,
            queue_names,
            startup_time: Utc::now(),
            last_error: Arc::new(RwLock::new(None)),
        }
    }
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .merge(api::health_routes())
        .merge(api::session_routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
