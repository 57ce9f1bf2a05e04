//! Unit tests for database initialization

use clipq_common::db::init::{create_schema, init_database, SCHEMA_VERSION};

#[tokio::test]
async fn test_database_creation_when_missing() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("sub").join("clipq.db");

    let result = init_database(&db_path).await;
    assert!(result.is_ok(), "Database initialization failed: {:?}", result.err());
    assert!(db_path.exists(), "Database file was not created");
}

#[tokio::test]
async fn test_database_opens_existing() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("clipq.db");

    let pool1 = init_database(&db_path).await.unwrap();
    let pool2 = init_database(&db_path).await;
    assert!(pool2.is_ok(), "Failed to open existing database: {:?}", pool2.err());

    // Schema creation is idempotent
    create_schema(&pool1).await.unwrap();
}

#[tokio::test]
async fn test_all_tables_created() {
    let dir = tempfile::tempdir().unwrap();
    let pool = init_database(&dir.path().join("clipq.db")).await.unwrap();

    for table in [
        "schema_version",
        "sessions",
        "pending_jobs",
        "queue_messages",
        "segment_feedback",
        "session_summaries",
    ] {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?",
        )
        .bind(table)
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(count, 1, "table {} missing", table);
    }

    let version: i64 = sqlx::query_scalar("SELECT MAX(version) FROM schema_version")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(version, SCHEMA_VERSION);
}

#[tokio::test]
async fn test_wal_mode_enabled() {
    let dir = tempfile::tempdir().unwrap();
    let pool = init_database(&dir.path().join("clipq.db")).await.unwrap();

    let mode: String = sqlx::query_scalar("PRAGMA journal_mode")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(mode.to_lowercase(), "wal");
}

#[tokio::test]
async fn test_cursor_cannot_go_negative() {
    let dir = tempfile::tempdir().unwrap();
    let pool = init_database(&dir.path().join("clipq.db")).await.unwrap();

    let result = sqlx::query(
        "INSERT INTO sessions (session_id, cursor, created_at, updated_at) VALUES ('s', -1, 0, 0)",
    )
    .execute(&pool)
    .await;
    assert!(result.is_err());
}
