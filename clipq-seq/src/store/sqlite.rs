//! SQLite-backed session store
//!
//! Shared by every worker process that opens the same database file. Each
//! conditional operation is one `UPDATE … WHERE <precondition>` (or
//! `INSERT … WHERE EXISTS`), so SQLite's write lock is the compare-and-set and
//! is held for the duration of a single statement only.

use async_trait::async_trait;
use clipq_common::codec::{decode_job, encode_job};
use clipq_common::time::{deadline_ms, now_ms};
use clipq_common::{Job, SequenceNumber, Session, SessionStatus};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};
use std::time::Duration;

use super::{Claim, SessionStore, StoreError, StoreResult};

const SESSION_COLUMNS: &str = "session_id, cursor, status, conversation_handle, failure_reason, \
     claim_token, claim_expires_at, created_at, updated_at";

/// Session store persisted in the shared SQLite database
#[derive(Debug, Clone)]
pub struct SqliteSessionStore {
    pool: SqlitePool,
}

impl SqliteSessionStore {
    /// Wrap a pool whose schema was created by `clipq_common::db::init_database`
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn exists(&self, session_id: &str) -> StoreResult<bool> {
        let found: Option<i64> = sqlx::query_scalar("SELECT 1 FROM sessions WHERE session_id = ?")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(found.is_some())
    }

    /// Turn a failed conditional update into `NotFound` or `Conflict`
    async fn rejected(&self, session_id: &str, conflict: String) -> StoreError {
        match self.exists(session_id).await {
            Ok(true) => StoreError::Conflict(conflict),
            Ok(false) => StoreError::NotFound(session_id.to_string()),
            Err(e) => e,
        }
    }

    async fn require_session(&self, session_id: &str) -> StoreResult<()> {
        if self.exists(session_id).await? {
            Ok(())
        } else {
            Err(StoreError::NotFound(session_id.to_string()))
        }
    }

    async fn transition(
        &self,
        session_id: &str,
        status: SessionStatus,
        failure_reason: Option<&str>,
    ) -> StoreResult<()> {
        let predecessors = status.predecessors();
        if predecessors.is_empty() {
            return Err(self
                .rejected(session_id, format!("session {}: cannot re-enter {}", session_id, status))
                .await);
        }

        let placeholders = vec!["?"; predecessors.len()].join(", ");
        let sql = if failure_reason.is_some() {
            format!(
                "UPDATE sessions SET status = ?, updated_at = ?, failure_reason = ?, \
                 claim_token = NULL, claim_expires_at = NULL \
                 WHERE session_id = ? AND status IN ({})",
                placeholders
            )
        } else {
            format!(
                "UPDATE sessions SET status = ?, updated_at = ? \
                 WHERE session_id = ? AND status IN ({})",
                placeholders
            )
        };

        let mut query = sqlx::query(&sql).bind(status.as_str()).bind(now_ms());
        if let Some(reason) = failure_reason {
            query = query.bind(reason);
        }
        query = query.bind(session_id);
        for predecessor in predecessors {
            query = query.bind(predecessor.as_str());
        }

        let updated = query.execute(&self.pool).await?.rows_affected();
        if updated == 0 {
            return Err(self
                .rejected(
                    session_id,
                    format!("session {}: transition to {} not allowed", session_id, status),
                )
                .await);
        }
        Ok(())
    }

    /// Claim-conditioned cursor advance, optionally entering `Finalizing`
    async fn advance(
        &self,
        session_id: &str,
        expected_cursor: SequenceNumber,
        claim: &Claim,
        finalize: bool,
    ) -> StoreResult<()> {
        let expected = seq_to_db(expected_cursor)?;
        let sql = if finalize {
            "UPDATE sessions \
             SET cursor = cursor + 1, status = 'finalizing', claim_expires_at = ?, updated_at = ? \
             WHERE session_id = ? AND cursor = ? AND claim_token = ? AND status = 'active'"
        } else {
            "UPDATE sessions \
             SET cursor = cursor + 1, claim_expires_at = ?, updated_at = ? \
             WHERE session_id = ? AND cursor = ? AND claim_token = ?"
        };

        let mut tx = self.pool.begin().await?;

        // Write first, so the transaction takes the write lock up front
        let advanced = sqlx::query(sql)
            .bind(deadline_ms(claim.ttl))
            .bind(now_ms())
            .bind(session_id)
            .bind(expected)
            .bind(&claim.token)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        if advanced == 0 {
            tx.rollback().await?;
            return Err(self
                .rejected(
                    session_id,
                    format!(
                        "session {}: cursor moved past {}, claim lost or status changed",
                        session_id, expected_cursor
                    ),
                )
                .await);
        }

        pop_entry(&mut tx, session_id, expected).await?;
        sqlx::query("DELETE FROM pending_jobs WHERE session_id = ? AND sequence_number < ?")
            .bind(session_id)
            .bind(expected)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }
}

fn seq_to_db(sequence_number: SequenceNumber) -> StoreResult<i64> {
    i64::try_from(sequence_number).map_err(|_| {
        StoreError::Invalid(format!("sequence number {} out of range", sequence_number))
    })
}

fn seq_from_db(value: i64) -> StoreResult<SequenceNumber> {
    SequenceNumber::try_from(value)
        .map_err(|_| StoreError::Codec(format!("negative sequence number {} in store", value)))
}

fn session_from_row(row: &SqliteRow, pending: Vec<SequenceNumber>) -> StoreResult<Session> {
    let status: String = row.try_get("status")?;
    let claim_token: Option<String> = row.try_get("claim_token")?;
    let claim_expires_at: Option<i64> = row.try_get("claim_expires_at")?;

    Ok(Session {
        id: row.try_get("session_id")?,
        cursor: seq_from_db(row.try_get("cursor")?)?,
        pending,
        conversation_handle: row.try_get("conversation_handle")?,
        status: status.parse::<SessionStatus>()?,
        failure_reason: row.try_get("failure_reason")?,
        claim_expires_at: claim_token.and(claim_expires_at),
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Read a session and its buffered sequence numbers from one snapshot
async fn fetch_session(
    conn: &mut SqliteConnection,
    session_id: &str,
) -> StoreResult<Option<Session>> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM sessions WHERE session_id = ?",
        SESSION_COLUMNS
    ))
    .bind(session_id)
    .fetch_optional(&mut *conn)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };

    let pending = sqlx::query_scalar::<_, i64>(
        "SELECT sequence_number FROM pending_jobs WHERE session_id = ? ORDER BY sequence_number",
    )
    .bind(session_id)
    .fetch_all(&mut *conn)
    .await?
    .into_iter()
    .map(seq_from_db)
    .collect::<StoreResult<Vec<_>>>()?;

    session_from_row(&row, pending).map(Some)
}

/// Remove one buffered entry, returning it
async fn pop_entry(
    conn: &mut SqliteConnection,
    session_id: &str,
    sequence_number: i64,
) -> StoreResult<Option<Job>> {
    let raw: Option<String> = sqlx::query_scalar(
        "DELETE FROM pending_jobs WHERE session_id = ? AND sequence_number = ? RETURNING job",
    )
    .bind(session_id)
    .bind(sequence_number)
    .fetch_optional(&mut *conn)
    .await?;

    raw.map(|raw| decode_job(&raw)).transpose().map_err(StoreError::from)
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    fn backend(&self) -> &'static str {
        "sqlite"
    }

    async fn get_or_create(&self, session_id: &str) -> StoreResult<(Session, bool)> {
        let now = now_ms();
        let created = sqlx::query(
            r#"
            INSERT INTO sessions (session_id, cursor, status, created_at, updated_at)
            VALUES (?, 0, 'uninitialized', ?, ?)
            ON CONFLICT(session_id) DO NOTHING
            "#,
        )
        .bind(session_id)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?
        .rows_affected()
            == 1;

        let session = self
            .get(session_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(session_id.to_string()))?;
        Ok((session, created))
    }

    async fn get(&self, session_id: &str) -> StoreResult<Option<Session>> {
        let mut tx = self.pool.begin().await?;
        let session = fetch_session(&mut tx, session_id).await?;
        tx.commit().await?;
        Ok(session)
    }

    async fn activate(&self, session_id: &str, handle: &str) -> StoreResult<Session> {
        let updated = sqlx::query(
            r#"
            UPDATE sessions
            SET conversation_handle = ?, status = 'active', updated_at = ?
            WHERE session_id = ? AND status = 'uninitialized'
            "#,
        )
        .bind(handle)
        .bind(now_ms())
        .bind(session_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            return Err(self
                .rejected(session_id, format!("session {} already initialized", session_id))
                .await);
        }

        self.get(session_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(session_id.to_string()))
    }

    async fn set_status(&self, session_id: &str, status: SessionStatus) -> StoreResult<()> {
        self.transition(session_id, status, None).await
    }

    async fn fail(&self, session_id: &str, reason: &str) -> StoreResult<()> {
        self.transition(session_id, SessionStatus::Failed, Some(reason)).await
    }

    async fn try_claim(
        &self,
        session_id: &str,
        expected_cursor: SequenceNumber,
        ttl: Duration,
    ) -> StoreResult<Option<Claim>> {
        let claim = Claim::new(ttl);
        let now = now_ms();

        let updated = sqlx::query(
            r#"
            UPDATE sessions
            SET claim_token = ?, claim_expires_at = ?, updated_at = ?
            WHERE session_id = ?
              AND cursor = ?
              AND status IN ('active', 'finalizing')
              AND (claim_token IS NULL OR claim_expires_at IS NULL OR claim_expires_at < ?)
            "#,
        )
        .bind(&claim.token)
        .bind(deadline_ms(ttl))
        .bind(now)
        .bind(session_id)
        .bind(seq_to_db(expected_cursor)?)
        .bind(now)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 1 {
            return Ok(Some(claim));
        }
        self.require_session(session_id).await?;
        Ok(None)
    }

    async fn release_claim(&self, session_id: &str, claim: &Claim) -> StoreResult<()> {
        let updated = sqlx::query(
            r#"
            UPDATE sessions
            SET claim_token = NULL, claim_expires_at = NULL, updated_at = ?
            WHERE session_id = ? AND claim_token = ?
            "#,
        )
        .bind(now_ms())
        .bind(session_id)
        .bind(&claim.token)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            self.require_session(session_id).await?;
        }
        Ok(())
    }

    async fn try_advance_and_release(
        &self,
        session_id: &str,
        expected_cursor: SequenceNumber,
        claim: &Claim,
    ) -> StoreResult<()> {
        self.advance(session_id, expected_cursor, claim, false).await
    }

    async fn try_advance_and_finalize(
        &self,
        session_id: &str,
        expected_cursor: SequenceNumber,
        claim: &Claim,
    ) -> StoreResult<()> {
        self.advance(session_id, expected_cursor, claim, true).await
    }

    async fn buffer(&self, job: &Job) -> StoreResult<()> {
        let raw = encode_job(job)?;
        let sequence_number = seq_to_db(job.sequence_number)?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO pending_jobs (session_id, sequence_number, job, buffered_at)
            SELECT ?, ?, ?, ?
            WHERE EXISTS (SELECT 1 FROM sessions WHERE session_id = ? AND cursor <= ?)
            ON CONFLICT(session_id, sequence_number) DO NOTHING
            "#,
        )
        .bind(&job.session_id)
        .bind(sequence_number)
        .bind(&raw)
        .bind(now_ms())
        .bind(&job.session_id)
        .bind(sequence_number)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if inserted == 0 {
            self.require_session(&job.session_id).await?;
            return Err(StoreError::Duplicate {
                session_id: job.session_id.clone(),
                sequence_number: job.sequence_number,
            });
        }
        Ok(())
    }

    async fn peek_pending(
        &self,
        session_id: &str,
        sequence_number: SequenceNumber,
    ) -> StoreResult<Option<Job>> {
        let raw: Option<String> = sqlx::query_scalar(
            "SELECT job FROM pending_jobs WHERE session_id = ? AND sequence_number = ?",
        )
        .bind(session_id)
        .bind(seq_to_db(sequence_number)?)
        .fetch_optional(&self.pool)
        .await?;

        match raw {
            Some(raw) => Ok(Some(decode_job(&raw)?)),
            None => {
                self.require_session(session_id).await?;
                Ok(None)
            }
        }
    }

    async fn pop_if_present(
        &self,
        session_id: &str,
        sequence_number: SequenceNumber,
    ) -> StoreResult<Option<Job>> {
        let mut conn = self.pool.acquire().await?;
        let popped = pop_entry(&mut conn, session_id, seq_to_db(sequence_number)?).await?;
        if popped.is_none() {
            self.require_session(session_id).await?;
        }
        Ok(popped)
    }

    async fn stalled_sessions(&self, limit: usize) -> StoreResult<Vec<String>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let ids = sqlx::query_scalar::<_, String>(
            r#"
            SELECT s.session_id
            FROM sessions s
            WHERE (s.claim_token IS NULL OR s.claim_expires_at IS NULL OR s.claim_expires_at < ?)
              AND (
                s.status = 'finalizing'
                OR (s.status = 'active' AND EXISTS (
                    SELECT 1 FROM pending_jobs p
                    WHERE p.session_id = s.session_id AND p.sequence_number = s.cursor
                ))
              )
            ORDER BY s.session_id
            LIMIT ?
            "#,
        )
        .bind(now_ms())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids)
    }
}
