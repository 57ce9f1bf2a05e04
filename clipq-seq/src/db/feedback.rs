//! Feedback result persistence
//!
//! The document view of a session: one `segment_feedback` row per released
//! segment and one `session_summaries` row carrying the document status
//! (`processing` → `complete`) and the closing summary.
//!
//! Every write is an upsert, so a segment processed again after a crash
//! overwrites its own row instead of failing.

use clipq_common::time::now_ms;
use clipq_common::{Result, SequenceNumber};
use serde::Serialize;
use sqlx::{FromRow, SqlitePool};

pub const DOCUMENT_PROCESSING: &str = "processing";
pub const DOCUMENT_COMPLETE: &str = "complete";

/// Feedback recorded for one segment
#[derive(Debug, Clone, PartialEq, Serialize, FromRow)]
pub struct SegmentFeedback {
    pub session_id: String,
    pub sequence_number: i64,
    pub user_id: Option<String>,
    pub feedback: String,
    /// JSON-encoded emotion scores
    pub emotions: Option<String>,
    pub score: Option<f64>,
    pub slide_url: Option<String>,
    pub video_url: Option<String>,
    pub recorded_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, FromRow)]
pub struct SessionSummary {
    pub session_id: String,
    pub user_id: Option<String>,
    pub document_status: String,
    pub summary: Option<String>,
    pub updated_at: i64,
}

/// Writes consumer results to the shared database
#[derive(Debug, Clone)]
pub struct FeedbackSink {
    pool: SqlitePool,
}

impl FeedbackSink {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create (or reset) the session document with status `processing`
    pub async fn mark_processing(&self, session_id: &str, user_id: Option<&str>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO session_summaries (session_id, user_id, document_status, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(session_id) DO UPDATE SET
                user_id = COALESCE(excluded.user_id, session_summaries.user_id),
                document_status = excluded.document_status,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(session_id)
        .bind(user_id)
        .bind(DOCUMENT_PROCESSING)
        .bind(now_ms())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn record_segment(&self, feedback: &SegmentFeedback) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO segment_feedback (
                session_id, sequence_number, user_id, feedback,
                emotions, score, slide_url, video_url, recorded_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(session_id, sequence_number) DO UPDATE SET
                user_id = excluded.user_id,
                feedback = excluded.feedback,
                emotions = excluded.emotions,
                score = excluded.score,
                slide_url = excluded.slide_url,
                video_url = excluded.video_url,
                recorded_at = excluded.recorded_at
            "#,
        )
        .bind(&feedback.session_id)
        .bind(feedback.sequence_number)
        .bind(&feedback.user_id)
        .bind(&feedback.feedback)
        .bind(&feedback.emotions)
        .bind(feedback.score)
        .bind(&feedback.slide_url)
        .bind(&feedback.video_url)
        .bind(feedback.recorded_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Store the summary and mark the document `complete`
    pub async fn record_summary(&self, session_id: &str, summary: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO session_summaries (session_id, document_status, summary, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(session_id) DO UPDATE SET
                document_status = excluded.document_status,
                summary = excluded.summary,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(session_id)
        .bind(DOCUMENT_COMPLETE)
        .bind(summary)
        .bind(now_ms())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn segments(&self, session_id: &str) -> Result<Vec<SegmentFeedback>> {
        let rows = sqlx::query_as::<_, SegmentFeedback>(
            "SELECT * FROM segment_feedback WHERE session_id = ? ORDER BY sequence_number",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    pub async fn summary(&self, session_id: &str) -> Result<Option<SessionSummary>> {
        let row = sqlx::query_as::<_, SessionSummary>(
            "SELECT * FROM session_summaries WHERE session_id = ?",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }
}

/// Convert a sequence number for storage
pub fn sequence_column(sequence_number: SequenceNumber) -> Result<i64> {
    i64::try_from(sequence_number).map_err(|_| {
        clipq_common::Error::InvalidInput(format!(
            "sequence number {} out of range",
            sequence_number
        ))
    })
}
