//! Billing-side operations: compensation window, deferred-billing retry
//! bounds, and idempotent consume replay.

mod support;

use rust_decimal::Decimal;
use serde_json::json;
use uuid::Uuid;

use kiln_core::billing::{BillingClient, CreditRequest};
use kiln_core::ops;
use kiln_core::ops::billing_unavailable::{BillingRetryPolicy, BillingUnavailableCommand};
use kiln_db::queries::pipeline_steps as step_db;

use support::Harness;

/// Run a pipeline to completion and return (run, step-2).
async fn completed_run(h: &Harness) -> (Uuid, Uuid) {
    let task_id = h.queued_task(json!({ "requirement": "x" })).await;
    let run_id = h.executor.execute(task_id, h.tenant_id).await.unwrap();
    let steps = step_db::list_steps_for_run(h.pool(), run_id).await.unwrap();
    (run_id, steps[1].id)
}

#[tokio::test]
async fn compensation_refunds_inside_the_window() {
    let h = Harness::with_balance(1000).await;
    let (run_id, step_id) = completed_run(&h).await;

    let outcome = ops::compensate::compensate_credits(
        h.pool(),
        h.billing.as_ref(),
        h.tenant_id,
        step_id,
        "STEP_INVALIDATED",
    )
    .await
    .unwrap();

    assert!(outcome.refunded);
    assert_eq!(outcome.amount, Decimal::from(30));
    assert!(outcome.transaction_id.is_some());

    // 850 after the run, +30 back.
    assert_eq!(
        h.billing.get_balance(h.tenant_id).await.unwrap().balance,
        Decimal::from(880)
    );

    // The refund key is deterministic; replaying the compensation does
    // not double-credit.
    let again = ops::compensate::compensate_credits(
        h.pool(),
        h.billing.as_ref(),
        h.tenant_id,
        step_id,
        "STEP_INVALIDATED",
    )
    .await
    .unwrap();
    assert!(again.refunded);
    assert_eq!(
        h.billing.get_balance(h.tenant_id).await.unwrap().balance,
        Decimal::from(880)
    );

    let refund_key = format!("refund:{run_id}:{step_id}");
    assert!(
        h.billing
            .transaction_log()
            .iter()
            .filter(|t| t.idempotency_key == refund_key)
            .count()
            == 1
    );

    h.teardown().await;
}

#[tokio::test]
async fn compensation_outside_window_escalates() {
    let h = Harness::with_balance(1000).await;
    let (_run_id, step_id) = completed_run(&h).await;

    // Age the step past the 15-minute window.
    sqlx::query(
        "UPDATE pipeline_step_runs \
         SET completed_at = now() - interval '16 minutes' WHERE id = $1",
    )
    .bind(step_id)
    .execute(h.pool())
    .await
    .unwrap();

    let outcome = ops::compensate::compensate_credits(
        h.pool(),
        h.billing.as_ref(),
        h.tenant_id,
        step_id,
        "STEP_INVALIDATED",
    )
    .await
    .unwrap();

    assert!(!outcome.refunded);
    assert!(outcome.message.contains("Outside automatic refund window"));
    // Nothing moved.
    assert_eq!(
        h.billing.get_balance(h.tenant_id).await.unwrap().balance,
        Decimal::from(850)
    );

    h.teardown().await;
}

#[tokio::test]
async fn compensation_survives_billing_failure() {
    let h = Harness::with_balance(1000).await;
    let (_run_id, step_id) = completed_run(&h).await;

    h.billing.fail_unavailable(true);

    // Best-effort: the caller gets a refunded=false answer, not an error.
    let outcome = ops::compensate::compensate_credits(
        h.pool(),
        h.billing.as_ref(),
        h.tenant_id,
        step_id,
        "STEP_INVALIDATED",
    )
    .await
    .unwrap();
    assert!(!outcome.refunded);
    assert!(outcome.message.contains("manual review"));

    h.teardown().await;
}

#[tokio::test]
async fn compensation_requires_an_agent_run() {
    let h = Harness::with_balance(1000).await;

    let err = ops::compensate::compensate_credits(
        h.pool(),
        h.billing.as_ref(),
        h.tenant_id,
        Uuid::new_v4(),
        "STEP_INVALIDATED",
    )
    .await
    .unwrap_err();
    assert_eq!(err.code(), "STEP_RUN_NOT_FOUND");

    h.teardown().await;
}

#[tokio::test]
async fn billing_retry_attempts_are_bounded() {
    let h = Harness::with_balance(1000).await;
    let (_run_id, step_id) = completed_run(&h).await;
    let policy = BillingRetryPolicy::default();

    let command = BillingUnavailableCommand {
        step_run_id: step_id,
        tenant_id: h.tenant_id,
        amount: Decimal::from(30),
        idempotency_key: "key".to_owned(),
        retry_attempt: 0,
        error_message: Some("connect refused".to_owned()),
    };

    // Attempt 0 schedules ~60s out.
    let scheduled = ops::billing_unavailable::handle(
        h.pool(),
        h.executor.audit.as_ref(),
        &policy,
        &command,
    )
    .await
    .unwrap();
    assert_eq!(scheduled.retry_attempt, 1);
    let delay = (scheduled.scheduled_at - chrono::Utc::now()).num_seconds();
    assert!((50..=60).contains(&delay), "delay was {delay}s");

    // Attempt 2 schedules ~240s out.
    let scheduled = ops::billing_unavailable::handle(
        h.pool(),
        h.executor.audit.as_ref(),
        &policy,
        &BillingUnavailableCommand {
            retry_attempt: 2,
            ..command.clone()
        },
    )
    .await
    .unwrap();
    let delay = (scheduled.scheduled_at - chrono::Utc::now()).num_seconds();
    assert!((230..=240).contains(&delay), "delay was {delay}s");

    // The cap refuses attempt 5.
    let err = ops::billing_unavailable::handle(
        h.pool(),
        h.executor.audit.as_ref(),
        &policy,
        &BillingUnavailableCommand {
            retry_attempt: 5,
            ..command
        },
    )
    .await
    .unwrap_err();
    assert_eq!(err.code(), "MAX_RETRIES_EXCEEDED");

    // Two audit records, one per scheduled retry.
    assert_eq!(h.audit_events("billing_unavailable").await.len(), 2);

    h.teardown().await;
}

#[tokio::test]
async fn consume_replay_returns_original_transaction() {
    let h = Harness::with_balance(100).await;

    let request = CreditRequest::new(h.tenant_id, Decimal::from(40), "replay-key");
    let first = h.billing.consume_credits(&request).await.unwrap();
    let second = h.billing.consume_credits(&request).await.unwrap();

    assert_eq!(first.transaction_id, second.transaction_id);
    assert_eq!(
        h.billing.get_balance(h.tenant_id).await.unwrap().balance,
        Decimal::from(60)
    );

    h.teardown().await;
}
