//! Cancel / resume / replay semantics.

mod support;

use serde_json::json;
use uuid::Uuid;

use kiln_core::ops;
use kiln_core::ops::replay::ReplayCommand;
use kiln_db::models::{PipelineStatus, StepStatus, StepType, TaskStatus};
use kiln_db::queries::{
    pipeline_runs as run_db, pipeline_steps as step_db, tasks as task_db,
};

use support::Harness;

/// Build a run mid-flight: step 1 completed, step 2 running, steps 3-4
/// pending.
async fn mid_flight_run(h: &Harness) -> (Uuid, Uuid) {
    let task_id = h.queued_task(json!({ "requirement": "x" })).await;
    task_db::transition_task_status(h.pool(), task_id, TaskStatus::Queued, TaskStatus::Running)
        .await
        .unwrap();

    let run = run_db::insert_run(h.pool(), task_id, h.tenant_id, PipelineStatus::Running, 2)
        .await
        .unwrap();

    let specs = [
        (1, "analysis", StepType::Analysis),
        (2, "user stories", StepType::UserStories),
        (3, "code skeleton", StepType::CodeSkeleton),
        (4, "test cases", StepType::TestCases),
    ];
    for (number, name, step_type) in specs {
        let step = step_db::insert_step(h.pool(), run.id, number, name, step_type, 3)
            .await
            .unwrap();
        if number == 1 {
            step_db::start_step(h.pool(), step.id).await.unwrap();
            step_db::complete_step(h.pool(), step.id, &json!({ "analysis": "done" }))
                .await
                .unwrap();
        } else if number == 2 {
            step_db::start_step(h.pool(), step.id).await.unwrap();
        }
    }

    (run.id, task_id)
}

#[tokio::test]
async fn cancel_mid_run_preserves_completed_steps() {
    let h = Harness::with_balance(1000).await;
    let (run_id, _task_id) = mid_flight_run(&h).await;

    let outcome = ops::cancel::cancel_pipeline(
        h.pool(),
        h.executor.audit.as_ref(),
        &h.hub,
        run_id,
        h.tenant_id,
        Uuid::new_v4(),
        Some("user request"),
    )
    .await
    .unwrap();

    assert_eq!(outcome.previous_status, PipelineStatus::Running);
    assert_eq!(outcome.new_status, PipelineStatus::Cancelled);
    assert_eq!(outcome.steps_completed, 1);
    // The running step and both pending steps go with the run.
    assert_eq!(outcome.steps_cancelled, 3);

    let steps = step_db::list_steps_for_run(h.pool(), run_id).await.unwrap();
    assert_eq!(steps[0].status, StepStatus::Completed);
    assert_eq!(steps[1].status, StepStatus::Cancelled);
    assert_eq!(steps[2].status, StepStatus::Cancelled);
    assert_eq!(steps[3].status, StepStatus::Cancelled);
    for cancelled in &steps[1..] {
        assert!(cancelled.completed_at.is_some());
    }

    assert_eq!(h.audit_events("pipeline_cancelled").await.len(), 1);

    h.teardown().await;
}

#[tokio::test]
async fn second_cancel_is_rejected_and_state_sticks() {
    let h = Harness::with_balance(1000).await;
    let (run_id, _task_id) = mid_flight_run(&h).await;

    ops::cancel::cancel_pipeline(
        h.pool(),
        h.executor.audit.as_ref(),
        &h.hub,
        run_id,
        h.tenant_id,
        Uuid::new_v4(),
        None,
    )
    .await
    .unwrap();

    let err = ops::cancel::cancel_pipeline(
        h.pool(),
        h.executor.audit.as_ref(),
        &h.hub,
        run_id,
        h.tenant_id,
        Uuid::new_v4(),
        None,
    )
    .await
    .unwrap_err();
    assert_eq!(err.code(), "CANNOT_CANCEL_COMPLETED");

    let run = run_db::get_run(h.pool(), run_id).await.unwrap().unwrap();
    assert_eq!(run.status, PipelineStatus::Cancelled);

    h.teardown().await;
}

#[tokio::test]
async fn cancel_enforces_tenant_ownership() {
    let h = Harness::with_balance(1000).await;
    let (run_id, _task_id) = mid_flight_run(&h).await;

    let err = ops::cancel::cancel_pipeline(
        h.pool(),
        h.executor.audit.as_ref(),
        &h.hub,
        run_id,
        Uuid::new_v4(), // wrong tenant
        Uuid::new_v4(),
        None,
    )
    .await
    .unwrap_err();
    assert_eq!(err.code(), "UNAUTHORIZED");

    // The run is untouched.
    let run = run_db::get_run(h.pool(), run_id).await.unwrap().unwrap();
    assert_eq!(run.status, PipelineStatus::Running);

    h.teardown().await;
}

#[tokio::test]
async fn resume_requires_a_paused_run() {
    let h = Harness::with_balance(1000).await;
    let (run_id, _task_id) = mid_flight_run(&h).await;

    let err = ops::resume::resume_pipeline(h.pool(), run_id, h.tenant_id)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "NOT_PAUSED");

    h.teardown().await;
}

#[tokio::test]
async fn replay_forks_from_a_named_step() {
    let h = Harness::with_balance(1000).await;
    let (run_id, task_id) = mid_flight_run(&h).await;

    let steps = step_db::list_steps_for_run(h.pool(), run_id).await.unwrap();
    let step3 = steps.iter().find(|s| s.step_number == 3).unwrap();

    let outcome = ops::replay::replay_pipeline(
        h.pool(),
        h.executor.audit.as_ref(),
        None,
        &ReplayCommand {
            pipeline_run_id: run_id,
            tenant_id: h.tenant_id,
            user_id: Uuid::new_v4(),
            from_step_id: Some(step3.id),
            preserve_approved_artifacts: true,
        },
    )
    .await
    .unwrap();

    assert_eq!(outcome.status, PipelineStatus::Running);
    assert_eq!(outcome.started_from_step, "CODE SKELETON");

    let new_run = run_db::get_run(h.pool(), outcome.new_pipeline_run_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(new_run.task_id, task_id);
    assert_eq!(new_run.current_step, 3);
    assert_eq!(new_run.status, PipelineStatus::Running);

    assert_eq!(h.audit_events("pipeline_replayed").await.len(), 1);

    h.teardown().await;
}

#[tokio::test]
async fn replay_falls_back_to_step_one() {
    let h = Harness::with_balance(1000).await;
    let (run_id, _task_id) = mid_flight_run(&h).await;

    // An unknown step ID starts the fork from the beginning.
    let outcome = ops::replay::replay_pipeline(
        h.pool(),
        h.executor.audit.as_ref(),
        None,
        &ReplayCommand {
            pipeline_run_id: run_id,
            tenant_id: h.tenant_id,
            user_id: Uuid::new_v4(),
            from_step_id: Some(Uuid::new_v4()),
            preserve_approved_artifacts: true,
        },
    )
    .await
    .unwrap();

    assert_eq!(outcome.started_from_step, "STEP_1");
    let new_run = run_db::get_run(h.pool(), outcome.new_pipeline_run_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(new_run.current_step, 1);

    h.teardown().await;
}

#[tokio::test]
async fn replay_is_opaque_across_tenants() {
    let h = Harness::with_balance(1000).await;
    let (run_id, _task_id) = mid_flight_run(&h).await;

    let err = ops::replay::replay_pipeline(
        h.pool(),
        h.executor.audit.as_ref(),
        None,
        &ReplayCommand {
            pipeline_run_id: run_id,
            tenant_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            from_step_id: None,
            preserve_approved_artifacts: true,
        },
    )
    .await
    .unwrap_err();
    assert_eq!(err.code(), "PIPELINE_RUN_NOT_FOUND");

    h.teardown().await;
}

#[tokio::test]
async fn terminal_runs_stay_immutable() {
    let h = Harness::with_balance(1000).await;
    let task_id = h.queued_task(json!({ "requirement": "x" })).await;
    let run_id = h.executor.execute(task_id, h.tenant_id).await.unwrap();

    let before = run_db::get_run(h.pool(), run_id).await.unwrap().unwrap();
    assert_eq!(before.status, PipelineStatus::Completed);

    // Every mutating operation bounces off the terminal run.
    assert_eq!(
        ops::cancel::cancel_pipeline(
            h.pool(),
            h.executor.audit.as_ref(),
            &h.hub,
            run_id,
            h.tenant_id,
            Uuid::new_v4(),
            None,
        )
        .await
        .unwrap_err()
        .code(),
        "CANNOT_CANCEL_COMPLETED"
    );
    assert_eq!(
        ops::resume::resume_pipeline(h.pool(), run_id, h.tenant_id)
            .await
            .unwrap_err()
            .code(),
        "NOT_PAUSED"
    );

    let after = run_db::get_run(h.pool(), run_id).await.unwrap().unwrap();
    assert_eq!(after.status, before.status);
    assert_eq!(after.completed_at, before.completed_at);
    assert_eq!(after.updated_at, before.updated_at);

    h.teardown().await;
}
