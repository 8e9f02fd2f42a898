//! Migration smoke tests.
//!
//! Requires Docker (or `KILN_TEST_PG_URL` pointing at a PostgreSQL
//! server).

use kiln_test_utils::TestDb;

#[tokio::test]
async fn migrations_create_all_tables() {
    let db = TestDb::create().await;

    let tables: Vec<(String,)> = sqlx::query_as(
        "SELECT tablename::text FROM pg_tables \
         WHERE schemaname = 'public' ORDER BY tablename",
    )
    .fetch_all(&db.pool)
    .await
    .expect("should list tables");

    let names: Vec<&str> = tables.iter().map(|(n,)| n.as_str()).collect();
    for expected in [
        "agent_runs",
        "artifacts",
        "audit_events",
        "dead_letter_events",
        "export_jobs",
        "git_sync_jobs",
        "pipeline_runs",
        "pipeline_step_runs",
        "projects",
        "retry_jobs",
        "tasks",
    ] {
        assert!(names.contains(&expected), "missing table {expected}");
    }

    db.drop().await;
}

#[tokio::test]
async fn migrations_are_idempotent() {
    let db = TestDb::create().await;

    // Re-running the migrator against an up-to-date database is a no-op.
    kiln_db::pool::run_migrations(&db.pool)
        .await
        .expect("second run should succeed");

    db.drop().await;
}

#[tokio::test]
async fn pause_columns_exist_after_backfill_migration() {
    let db = TestDb::create().await;

    let columns: Vec<(String,)> = sqlx::query_as(
        "SELECT column_name::text FROM information_schema.columns \
         WHERE table_name = 'pipeline_runs'",
    )
    .fetch_all(&db.pool)
    .await
    .expect("should list columns");

    let names: Vec<&str> = columns.iter().map(|(n,)| n.as_str()).collect();
    for expected in ["paused_at", "pause_expires_at", "error_message"] {
        assert!(names.contains(&expected), "missing column {expected}");
    }

    db.drop().await;
}
