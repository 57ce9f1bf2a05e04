//! Message transport
//!
//! At-least-once queues between the pipeline stages. A received message is
//! leased, not removed: it disappears only on `ack`, and comes back if the
//! lease runs out (worker crash) or on `nack`. Each worker task holds at most
//! one delivery at a time.

pub mod sqlite;

pub use sqlite::SqliteQueue;

use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Transport unavailable: {0}")]
    Unavailable(#[from] sqlx::Error),

    /// The lease expired and the message was handed to someone else
    #[error("Lease on message {0} lost")]
    LeaseLost(i64),
}

pub type TransportResult<T> = Result<T, TransportError>;

/// A leased message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub id: i64,
    pub queue: String,
    pub body: String,
    /// 1 on first delivery
    pub delivery_count: u32,
    pub lease_token: String,
}

/// Message counts by state for one queue
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueDepth {
    pub ready: u64,
    pub leased: u64,
    pub dead: u64,
}

#[async_trait]
pub trait MessageTransport: Send + Sync {
    /// Enqueue a message, returning its id
    async fn publish(&self, queue: &str, body: &str) -> TransportResult<i64>;

    /// Lease the oldest available message, if any
    async fn receive(&self, queue: &str) -> TransportResult<Option<Delivery>>;

    /// Remove a processed message
    async fn ack(&self, delivery: &Delivery) -> TransportResult<()>;

    /// Return a message for redelivery after `delay`
    async fn nack(&self, delivery: &Delivery, delay: Duration, reason: &str) -> TransportResult<()>;

    /// Park a message that must not be delivered again
    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> TransportResult<()>;

    async fn depth(&self, queue: &str) -> TransportResult<QueueDepth>;
}
