//! Durable queue in the shared SQLite database
//!
//! `queue_messages` rows move `ready → leased → (deleted | ready | dead)`.
//! Leasing is one `UPDATE … WHERE id = (SELECT …) RETURNING` statement, so two
//! receivers never lease the same message. A `leased` row whose lease has
//! expired counts as available again.

use async_trait::async_trait;
use clipq_common::time::{deadline_ms, now_ms};
use sqlx::{Row, SqlitePool};
use std::time::Duration;

use super::{Delivery, MessageTransport, QueueDepth, TransportError, TransportResult};

#[derive(Debug, Clone)]
pub struct SqliteQueue {
    pool: SqlitePool,
    visibility_timeout: Duration,
}

impl SqliteQueue {
    pub fn new(pool: SqlitePool, visibility_timeout: Duration) -> Self {
        Self {
            pool,
            visibility_timeout,
        }
    }

    fn lease_lost(delivery: &Delivery, rows: u64) -> TransportResult<()> {
        if rows == 0 {
            Err(TransportError::LeaseLost(delivery.id))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl MessageTransport for SqliteQueue {
    async fn publish(&self, queue: &str, body: &str) -> TransportResult<i64> {
        let now = now_ms();
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO queue_messages (queue, body, state, delivery_count, available_at, enqueued_at)
            VALUES (?, ?, 'ready', 0, ?, ?)
            RETURNING id
            "#,
        )
        .bind(queue)
        .bind(body)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        tracing::debug!(queue, message_id = id, "Message published");
        Ok(id)
    }

    async fn receive(&self, queue: &str) -> TransportResult<Option<Delivery>> {
        let now = now_ms();
        let token = uuid::Uuid::new_v4().to_string();

        let row = sqlx::query(
            r#"
            UPDATE queue_messages
            SET state = 'leased',
                delivery_count = delivery_count + 1,
                lease_token = ?,
                lease_expires_at = ?
            WHERE id = (
                SELECT id FROM queue_messages
                WHERE queue = ?
                  AND ((state = 'ready' AND available_at <= ?)
                       OR (state = 'leased' AND lease_expires_at < ?))
                ORDER BY id
                LIMIT 1
            )
            RETURNING id, queue, body, delivery_count
            "#,
        )
        .bind(&token)
        .bind(deadline_ms(self.visibility_timeout))
        .bind(queue)
        .bind(now)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let delivery_count: i64 = row.try_get("delivery_count")?;
        Ok(Some(Delivery {
            id: row.try_get("id")?,
            queue: row.try_get("queue")?,
            body: row.try_get("body")?,
            delivery_count: u32::try_from(delivery_count).unwrap_or(u32::MAX),
            lease_token: token,
        }))
    }

    async fn ack(&self, delivery: &Delivery) -> TransportResult<()> {
        let rows = sqlx::query("DELETE FROM queue_messages WHERE id = ? AND lease_token = ?")
            .bind(delivery.id)
            .bind(&delivery.lease_token)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Self::lease_lost(delivery, rows)
    }

    async fn nack(
        &self,
        delivery: &Delivery,
        delay: Duration,
        reason: &str,
    ) -> TransportResult<()> {
        let rows = sqlx::query(
            r#"
            UPDATE queue_messages
            SET state = 'ready', available_at = ?, lease_token = NULL,
                lease_expires_at = NULL, last_error = ?
            WHERE id = ? AND lease_token = ?
            "#,
        )
        .bind(deadline_ms(delay))
        .bind(reason)
        .bind(delivery.id)
        .bind(&delivery.lease_token)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Self::lease_lost(delivery, rows)
    }

    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> TransportResult<()> {
        let rows = sqlx::query(
            r#"
            UPDATE queue_messages
            SET state = 'dead', lease_token = NULL, lease_expires_at = NULL, last_error = ?
            WHERE id = ? AND lease_token = ?
            "#,
        )
        .bind(reason)
        .bind(delivery.id)
        .bind(&delivery.lease_token)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Self::lease_lost(delivery, rows)
    }

    async fn depth(&self, queue: &str) -> TransportResult<QueueDepth> {
        let rows = sqlx::query(
            "SELECT state, COUNT(*) AS n FROM queue_messages WHERE queue = ? GROUP BY state",
        )
        .bind(queue)
        .fetch_all(&self.pool)
        .await?;

        let mut depth = QueueDepth::default();
        for row in rows {
            let state: String = row.try_get("state")?;
            let n = u64::try_from(row.try_get::<i64, _>("n")?).unwrap_or(0);
            match state.as_str() {
                "ready" => depth.ready = n,
                "leased" => depth.leased = n,
                "dead" => depth.dead = n,
                _ => {}
            }
        }
        Ok(depth)
    }
}
