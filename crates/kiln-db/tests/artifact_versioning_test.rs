//! Artifact version allocation under sequential and concurrent creates.

use sqlx::PgPool;
use uuid::Uuid;

use kiln_db::models::{ArtifactStatus, ArtifactType, PipelineStatus, StepType};
use kiln_db::queries::artifacts::{self, NewArtifact};
use kiln_db::queries::{
    pipeline_runs as run_db, pipeline_steps as step_db, projects as project_db, tasks as task_db,
};
use kiln_test_utils::TestDb;

struct Fixture {
    task_id: Uuid,
    run_id: Uuid,
    step_id: Uuid,
}

async fn seed(pool: &PgPool) -> Fixture {
    let tenant = Uuid::new_v4();
    let project = project_db::insert_project(pool, tenant, "proj", None)
        .await
        .unwrap();
    let task = task_db::insert_task(
        pool,
        project.id,
        tenant,
        "task",
        &serde_json::json!({ "requirement": "x" }),
    )
    .await
    .unwrap();
    let run = run_db::insert_run(pool, task.id, tenant, PipelineStatus::Running, 1)
        .await
        .unwrap();
    let step = step_db::insert_step(pool, run.id, 1, "analysis", StepType::Analysis, 3)
        .await
        .unwrap();

    Fixture {
        task_id: task.id,
        run_id: run.id,
        step_id: step.id,
    }
}

async fn create_next_version(pool: &PgPool, fx: &Fixture) -> i32 {
    let mut tx = pool.begin().await.unwrap();
    let version =
        artifacts::max_version_locked(&mut *tx, fx.task_id, ArtifactType::AnalysisReport)
            .await
            .unwrap()
            + 1;
    let artifact = artifacts::insert_artifact(
        &mut *tx,
        &NewArtifact {
            task_id: fx.task_id,
            pipeline_run_id: fx.run_id,
            step_run_id: fx.step_id,
            artifact_type: ArtifactType::AnalysisReport,
            status: ArtifactStatus::Draft,
            version,
            content: serde_json::json!({ "text": format!("v{version}") }),
        },
    )
    .await
    .unwrap();
    tx.commit().await.unwrap();
    artifact.version
}

#[tokio::test]
async fn versions_are_contiguous_from_one() {
    let db = TestDb::create().await;
    let fx = seed(&db.pool).await;

    for expected in 1..=4 {
        assert_eq!(create_next_version(&db.pool, &fx).await, expected);
    }

    let latest = artifacts::get_latest(&db.pool, fx.task_id, ArtifactType::AnalysisReport)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(latest.version, 4);

    db.drop().await;
}

#[tokio::test]
async fn version_groups_are_independent_per_type() {
    let db = TestDb::create().await;
    let fx = seed(&db.pool).await;

    create_next_version(&db.pool, &fx).await;
    create_next_version(&db.pool, &fx).await;

    // A different type starts back at 1.
    let mut tx = db.pool.begin().await.unwrap();
    let version = artifacts::max_version_locked(&mut *tx, fx.task_id, ArtifactType::TestSuite)
        .await
        .unwrap()
        + 1;
    tx.commit().await.unwrap();
    assert_eq!(version, 1);

    db.drop().await;
}

#[tokio::test]
async fn concurrent_creates_never_share_a_version() {
    let db = TestDb::create().await;
    let fx = seed(&db.pool).await;
    let fx = std::sync::Arc::new(fx);

    let mut handles = Vec::new();
    for _ in 0..8 {
        let pool = db.pool.clone();
        let fx = fx.clone();
        handles.push(tokio::spawn(async move {
            let fx = Fixture {
                task_id: fx.task_id,
                run_id: fx.run_id,
                step_id: fx.step_id,
            };
            create_next_version(&pool, &fx).await
        }));
    }

    let mut versions = Vec::new();
    for handle in handles {
        versions.push(handle.await.unwrap());
    }
    versions.sort_unstable();

    // The FOR UPDATE lock serializes allocation: exactly 1..=8, no gaps,
    // no duplicates.
    assert_eq!(versions, (1..=8).collect::<Vec<i32>>());

    db.drop().await;
}

#[tokio::test]
async fn duplicate_version_insert_is_rejected_by_constraint() {
    let db = TestDb::create().await;
    let fx = seed(&db.pool).await;
    create_next_version(&db.pool, &fx).await;

    // Bypassing the allocator and re-using version 1 trips the unique
    // constraint.
    let mut tx = db.pool.begin().await.unwrap();
    let result = artifacts::insert_artifact(
        &mut *tx,
        &NewArtifact {
            task_id: fx.task_id,
            pipeline_run_id: fx.run_id,
            step_run_id: fx.step_id,
            artifact_type: ArtifactType::AnalysisReport,
            status: ArtifactStatus::Draft,
            version: 1,
            content: serde_json::json!({}),
        },
    )
    .await;
    assert!(result.is_err());

    db.drop().await;
}
