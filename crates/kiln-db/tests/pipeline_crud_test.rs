//! CRUD and transition tests for the pipeline aggregates.

use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;

use kiln_db::models::{PauseReason, PipelineStatus, StepType, TaskStatus};
use kiln_db::queries::{
    pipeline_runs as run_db, pipeline_steps as step_db, projects as project_db,
    retry_jobs as retry_db, tasks as task_db,
};
use kiln_test_utils::TestDb;

async fn seed_task(pool: &PgPool, tenant_id: Uuid) -> Uuid {
    let project = project_db::insert_project(pool, tenant_id, "proj", None)
        .await
        .expect("insert project");
    let task = task_db::insert_task(
        pool,
        project.id,
        tenant_id,
        "build the thing",
        &serde_json::json!({ "requirement": "Build API" }),
    )
    .await
    .expect("insert task");
    task.id
}

#[tokio::test]
async fn task_lookup_is_tenant_scoped() {
    let db = TestDb::create().await;
    let tenant = Uuid::new_v4();
    let task_id = seed_task(&db.pool, tenant).await;

    assert!(
        task_db::get_task(&db.pool, task_id, tenant)
            .await
            .unwrap()
            .is_some()
    );
    // Another tenant sees nothing.
    assert!(
        task_db::get_task(&db.pool, task_id, Uuid::new_v4())
            .await
            .unwrap()
            .is_none()
    );

    db.drop().await;
}

#[tokio::test]
async fn task_transition_uses_optimistic_lock() {
    let db = TestDb::create().await;
    let tenant = Uuid::new_v4();
    let task_id = seed_task(&db.pool, tenant).await;

    let rows = task_db::transition_task_status(&db.pool, task_id, TaskStatus::Draft, TaskStatus::Queued)
        .await
        .unwrap();
    assert_eq!(rows, 1);

    // Replaying the same transition finds no matching row.
    let rows = task_db::transition_task_status(&db.pool, task_id, TaskStatus::Draft, TaskStatus::Queued)
        .await
        .unwrap();
    assert_eq!(rows, 0);

    db.drop().await;
}

#[tokio::test]
async fn pause_reasons_maintain_status_invariant() {
    let db = TestDb::create().await;
    let tenant = Uuid::new_v4();
    let task_id = seed_task(&db.pool, tenant).await;
    let run = run_db::insert_run(&db.pool, task_id, tenant, PipelineStatus::Running, 1)
        .await
        .unwrap();

    // Adding a reason pauses the run and stamps paused_at.
    let paused = run_db::add_pause_reason(&db.pool, run.id, PauseReason::InsufficientCredit, None)
        .await
        .unwrap()
        .expect("run should pause");
    assert_eq!(paused.status, PipelineStatus::Paused);
    assert_eq!(paused.pause_reasons.0, vec![PauseReason::InsufficientCredit]);
    assert!(paused.paused_at.is_some());

    // Adding the same reason again is idempotent.
    let again = run_db::add_pause_reason(&db.pool, run.id, PauseReason::InsufficientCredit, None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(again.pause_reasons.0.len(), 1);

    // A second distinct reason stacks.
    let stacked = run_db::add_pause_reason(&db.pool, run.id, PauseReason::Rejection, None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stacked.pause_reasons.0.len(), 2);
    assert!(!stacked.can_resume());

    // Removing one reason keeps the run paused.
    let partial = run_db::remove_pause_reason(&db.pool, run.id, PauseReason::Rejection)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(partial.status, PipelineStatus::Paused);
    assert_eq!(partial.pause_reasons.0, vec![PauseReason::InsufficientCredit]);

    // Removing the last reason resumes and clears paused_at.
    let resumed = run_db::remove_pause_reason(&db.pool, run.id, PauseReason::InsufficientCredit)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(resumed.status, PipelineStatus::Running);
    assert!(resumed.pause_reasons.is_empty());
    assert!(resumed.paused_at.is_none());

    db.drop().await;
}

#[tokio::test]
async fn removing_absent_reason_is_a_noop() {
    let db = TestDb::create().await;
    let tenant = Uuid::new_v4();
    let task_id = seed_task(&db.pool, tenant).await;
    let run = run_db::insert_run(&db.pool, task_id, tenant, PipelineStatus::Running, 1)
        .await
        .unwrap();

    let result = run_db::remove_pause_reason(&db.pool, run.id, PauseReason::Rejection)
        .await
        .unwrap();
    assert!(result.is_none());

    db.drop().await;
}

#[tokio::test]
async fn input_snapshot_is_write_once() {
    let db = TestDb::create().await;
    let tenant = Uuid::new_v4();
    let task_id = seed_task(&db.pool, tenant).await;
    let run = run_db::insert_run(&db.pool, task_id, tenant, PipelineStatus::Running, 1)
        .await
        .unwrap();
    let step = step_db::insert_step(&db.pool, run.id, 1, "analysis", StepType::Analysis, 3)
        .await
        .unwrap();

    let first = serde_json::json!({ "requirement": "v1" });
    let rows = step_db::freeze_input_snapshot(&db.pool, step.id, &first)
        .await
        .unwrap();
    assert_eq!(rows, 1);

    // A second write is rejected; the original snapshot survives.
    let second = serde_json::json!({ "requirement": "v2" });
    let rows = step_db::freeze_input_snapshot(&db.pool, step.id, &second)
        .await
        .unwrap();
    assert_eq!(rows, 0);

    let stored = step_db::get_step(&db.pool, step.id).await.unwrap().unwrap();
    assert_eq!(stored.input_snapshot, Some(first));

    db.drop().await;
}

#[tokio::test]
async fn begin_retry_enforces_budget() {
    let db = TestDb::create().await;
    let tenant = Uuid::new_v4();
    let task_id = seed_task(&db.pool, tenant).await;
    let run = run_db::insert_run(&db.pool, task_id, tenant, PipelineStatus::Running, 1)
        .await
        .unwrap();
    let step = step_db::insert_step(&db.pool, run.id, 1, "analysis", StepType::Analysis, 2)
        .await
        .unwrap();

    step_db::start_step(&db.pool, step.id).await.unwrap();
    step_db::fail_step(&db.pool, step.id, "boom").await.unwrap();

    // Two retries fit inside max_retries = 2.
    for expected_count in 1..=2 {
        assert_eq!(step_db::begin_retry(&db.pool, step.id).await.unwrap(), 1);
        let current = step_db::get_step(&db.pool, step.id).await.unwrap().unwrap();
        assert_eq!(current.retry_count, expected_count);
        step_db::fail_step(&db.pool, step.id, "boom").await.unwrap();
    }

    // Budget exhausted: the guard rejects a third retry.
    assert_eq!(step_db::begin_retry(&db.pool, step.id).await.unwrap(), 0);
    let current = step_db::get_step(&db.pool, step.id).await.unwrap().unwrap();
    assert_eq!(current.retry_count, 2);
    assert!(!current.is_retryable());

    db.drop().await;
}

#[tokio::test]
async fn due_jobs_come_back_oldest_first() {
    let db = TestDb::create().await;
    let tenant = Uuid::new_v4();
    let task_id = seed_task(&db.pool, tenant).await;
    let run = run_db::insert_run(&db.pool, task_id, tenant, PipelineStatus::Running, 1)
        .await
        .unwrap();
    let step = step_db::insert_step(&db.pool, run.id, 1, "analysis", StepType::Analysis, 3)
        .await
        .unwrap();

    let now = Utc::now();
    let late = retry_db::insert_retry_job(&db.pool, step.id, 2, now - chrono::Duration::seconds(5))
        .await
        .unwrap();
    let early = retry_db::insert_retry_job(&db.pool, step.id, 1, now - chrono::Duration::seconds(60))
        .await
        .unwrap();
    // Not yet due.
    retry_db::insert_retry_job(&db.pool, step.id, 3, now + chrono::Duration::seconds(60))
        .await
        .unwrap();

    let due = retry_db::get_due_jobs(&db.pool, now).await.unwrap();
    assert_eq!(due.len(), 2);
    assert_eq!(due[0].id, early.id);
    assert_eq!(due[1].id, late.id);

    // Claiming is single-winner.
    assert_eq!(retry_db::claim_job(&db.pool, early.id).await.unwrap(), 1);
    assert_eq!(retry_db::claim_job(&db.pool, early.id).await.unwrap(), 0);

    db.drop().await;
}

#[tokio::test]
async fn tenant_listing_filters_and_paginates() {
    let db = TestDb::create().await;
    let tenant = Uuid::new_v4();
    let task_id = seed_task(&db.pool, tenant).await;

    for _ in 0..3 {
        run_db::insert_run(&db.pool, task_id, tenant, PipelineStatus::Running, 1)
            .await
            .unwrap();
    }
    let cancelled = run_db::insert_run(&db.pool, task_id, tenant, PipelineStatus::Running, 1)
        .await
        .unwrap();
    run_db::cancel_run(&db.pool, cancelled.id).await.unwrap();

    let total = run_db::count_runs_for_tenant(&db.pool, tenant, None)
        .await
        .unwrap();
    assert_eq!(total, 4);

    let running = run_db::list_runs_for_tenant(&db.pool, tenant, Some(PipelineStatus::Running), 10, 0)
        .await
        .unwrap();
    assert_eq!(running.len(), 3);

    let page = run_db::list_runs_for_tenant(&db.pool, tenant, None, 2, 2)
        .await
        .unwrap();
    assert_eq!(page.len(), 2);

    // Other tenants see nothing.
    let other = run_db::count_runs_for_tenant(&db.pool, Uuid::new_v4(), None)
        .await
        .unwrap();
    assert_eq!(other, 0);

    db.drop().await;
}
