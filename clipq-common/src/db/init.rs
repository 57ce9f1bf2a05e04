//! Database initialization
//!
//! Every clipq process opens the same SQLite file. Tables are created
//! idempotently, so any process may be the first one to start.
//!
//! Connections use WAL (concurrent readers alongside one writer) and a busy
//! timeout, so a compare-and-set statement from one process waits briefly for
//! another process's write instead of failing.

use crate::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Current schema version recorded in `schema_version`
pub const SCHEMA_VERSION: i64 = 1;

/// Default SQLite busy timeout
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_millis(5_000);

/// Initialize database connection and create tables if needed
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    // Create parent directory if it doesn't exist
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(DEFAULT_BUSY_TIMEOUT)
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(16)
        .min_connections(1)
        .connect_with(options)
        .await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    create_schema(&pool).await?;

    Ok(pool)
}

/// Create all clipq tables (idempotent - safe to call multiple times)
pub async fn create_schema(pool: &SqlitePool) -> Result<()> {
    create_schema_version_table(pool).await?;
    create_sessions_table(pool).await?;
    create_pending_jobs_table(pool).await?;
    create_queue_messages_table(pool).await?;
    create_segment_feedback_table(pool).await?;
    create_session_summaries_table(pool).await?;

    sqlx::query("INSERT OR IGNORE INTO schema_version (version) VALUES (?)")
        .bind(SCHEMA_VERSION)
        .execute(pool)
        .await?;

    Ok(())
}

async fn create_schema_version_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// One row per session: cursor, lifecycle status, conversation handle and the
/// release claim
async fn create_sessions_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sessions (
            session_id TEXT PRIMARY KEY,
            cursor INTEGER NOT NULL DEFAULT 0 CHECK (cursor >= 0),
            status TEXT NOT NULL DEFAULT 'uninitialized',
            conversation_handle TEXT,
            failure_reason TEXT,
            claim_token TEXT,
            claim_expires_at INTEGER,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Sparse buffer of early arrivals, keyed by (session, sequence number)
async fn create_pending_jobs_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS pending_jobs (
            session_id TEXT NOT NULL REFERENCES sessions(session_id) ON DELETE CASCADE,
            sequence_number INTEGER NOT NULL,
            job TEXT NOT NULL,
            buffered_at INTEGER NOT NULL,
            PRIMARY KEY (session_id, sequence_number)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Durable at-least-once message queue
async fn create_queue_messages_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS queue_messages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            queue TEXT NOT NULL,
            body TEXT NOT NULL,
            state TEXT NOT NULL DEFAULT 'ready',
            delivery_count INTEGER NOT NULL DEFAULT 0,
            available_at INTEGER NOT NULL,
            lease_token TEXT,
            lease_expires_at INTEGER,
            last_error TEXT,
            enqueued_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_queue_messages_ready ON queue_messages (queue, state, available_at)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Per-segment feedback written by the ordered consumer
async fn create_segment_feedback_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS segment_feedback (
            session_id TEXT NOT NULL,
            sequence_number INTEGER NOT NULL,
            user_id TEXT,
            feedback TEXT NOT NULL,
            emotions TEXT,
            score REAL,
            slide_url TEXT,
            video_url TEXT,
            recorded_at INTEGER NOT NULL,
            PRIMARY KEY (session_id, sequence_number)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Per-session document status and final summary
async fn create_session_summaries_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS session_summaries (
            session_id TEXT PRIMARY KEY,
            user_id TEXT,
            document_status TEXT NOT NULL DEFAULT 'processing',
            summary TEXT,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
