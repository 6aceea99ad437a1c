use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{Duration, Utc};

use opsflow_core::delegation::NewDelegation;
use opsflow_core::directory::InMemoryDirectory;
use opsflow_core::domain::history::HistoryAction;
use opsflow_core::domain::request::{Priority, RequestId, RequestStatus, Visibility};
use opsflow_core::domain::step::StepStatus;
use opsflow_core::domain::workflow::WorkflowId;
use opsflow_core::engine::{EngineStores, NewRequest, WorkflowEngine};
use opsflow_core::ledger::HistoryLedger;
use opsflow_db::{
    connect_with_settings, migrations, DbPool, DemoWorkflows, SqlDelegationStore,
    SqlHistoryStore, SqlPolicyStore, SqlRequestStore,
};

const KEY: &str = "sqlite-engine-test-signing-key-01";

async fn migrated_pool() -> DbPool {
    let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
    migrations::run_pending(&pool).await.expect("migrate");
    DemoWorkflows::load(&pool).await.expect("seed demo workflows");
    pool
}

fn engine(pool: &DbPool) -> Arc<WorkflowEngine> {
    let directory = InMemoryDirectory::default()
        .with_member("u-req", "field-service")
        .with_member("u-ops-1", "operations")
        .with_member("u-ops-2", "operations")
        .with_member("u-ops-3", "operations")
        .with_role("u-fin-1", "finance-approver")
        .with_role("u-fin-2", "finance-approver")
        .with_role("u-lead-1", "engineering-lead")
        .with_role("u-lead-2", "engineering-lead")
        .with_member("u-qa-1", "quality")
        .with_role("u-mgr", "line-manager");

    Arc::new(WorkflowEngine::new(
        EngineStores {
            policies: Arc::new(SqlPolicyStore::new(pool.clone())),
            requests: Arc::new(SqlRequestStore::new(pool.clone())),
            history: Arc::new(SqlHistoryStore::new(pool.clone())),
            delegations: Arc::new(SqlDelegationStore::new(pool.clone())),
        },
        Arc::new(directory),
        HistoryLedger::new(KEY),
    )
    .with_administrators(["u-ops-admin".to_string()]))
}

fn request_for(workflow_id: &str, metadata: serde_json::Value) -> NewRequest {
    NewRequest {
        workflow_id: WorkflowId(workflow_id.to_string()),
        title: "Field service request".to_string(),
        description: String::new(),
        requester_id: "u-req".to_string(),
        priority: Priority::Normal,
        metadata,
        visibility: Visibility::default(),
        subject: None,
        due_at: None,
    }
}

async fn submit(engine: &WorkflowEngine, workflow_id: &str, metadata: serde_json::Value) -> RequestId {
    let request = engine.create_request(request_for(workflow_id, metadata)).await.expect("create");
    engine.submit(&request.id, "u-req").await.expect("submit");
    request.id
}

async fn approve_as(engine: &WorkflowEngine, request_id: &RequestId, approver: &str) {
    let view = engine.get_request(request_id).await.expect("view");
    let step = view
        .steps
        .iter()
        .find(|step| step.approver_id == approver && step.status == StepStatus::Pending)
        .unwrap_or_else(|| panic!("no pending step for {approver}"));
    engine.approve(&step.id, approver, None).await.expect("approve");
}

#[tokio::test]
async fn purchase_request_runs_both_levels_over_sqlite() {
    let pool = migrated_pool().await;
    let engine = engine(&pool);
    let request_id = submit(&engine, "wf-purchase-request", serde_json::json!({"amount": 8000})).await;

    approve_as(&engine, &request_id, "u-ops-1").await;
    approve_as(&engine, &request_id, "u-ops-2").await;

    let view = engine.get_request(&request_id).await.expect("view after level 1");
    assert_eq!(view.request.current_level, 2);
    let skipped = view
        .steps
        .iter()
        .filter(|step| step.level_number == 1 && step.status == StepStatus::Skipped)
        .count();
    assert_eq!(skipped, 1);

    let pending = engine.list_pending_for("u-fin-2").await.expect("pending for finance");
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].request.id, request_id);

    approve_as(&engine, &request_id, "u-fin-2").await;

    let view = engine.get_request(&request_id).await.expect("final view");
    assert_eq!(view.request.status, RequestStatus::Approved);
    assert!(view.request.completed_at.is_some());
    assert!(engine.list_pending_for("u-fin-1").await.expect("pending").is_empty());

    let history = engine.get_history(&request_id).await.expect("history");
    assert_eq!(history.first().map(|entry| entry.action), Some(HistoryAction::Created));
    assert_eq!(history.last().map(|entry| entry.action), Some(HistoryAction::Approved));
    for (index, entry) in history.iter().enumerate() {
        assert_eq!(entry.sequence, index as u64 + 1);
    }
    assert!(engine.verify_history(&request_id).await.expect("verify").valid);
}

#[tokio::test]
async fn small_purchase_auto_approves_after_department_review() {
    let pool = migrated_pool().await;
    let engine = engine(&pool);
    let request_id = submit(&engine, "wf-purchase-request", serde_json::json!({"amount": 120})).await;

    approve_as(&engine, &request_id, "u-ops-1").await;
    approve_as(&engine, &request_id, "u-ops-3").await;

    let view = engine.get_request(&request_id).await.expect("view");
    assert_eq!(view.request.status, RequestStatus::Approved);
    assert!(view.steps.iter().all(|step| step.level_number == 1));
}

#[tokio::test]
async fn design_change_rejection_is_persisted() {
    let pool = migrated_pool().await;
    let engine = engine(&pool);
    let request_id = submit(&engine, "wf-design-change", serde_json::json!({})).await;

    let view = engine.get_request(&request_id).await.expect("view");
    let step = view
        .steps
        .iter()
        .find(|step| step.approver_id == "u-lead-1")
        .expect("lead step");
    engine
        .reject(&step.id, "u-lead-1", "tolerance stack-up not analysed")
        .await
        .expect("reject");

    let status: String = sqlx::query_scalar("SELECT status FROM approval_request WHERE id = ?")
        .bind(&request_id.0)
        .fetch_one(&pool)
        .await
        .expect("status");
    assert_eq!(status, "REJECTED");

    let other = engine.get_request(&request_id).await.expect("view");
    let untouched = other
        .steps
        .iter()
        .find(|step| step.approver_id == "u-lead-2")
        .expect("second lead step");
    assert_eq!(untouched.status, StepStatus::Pending);
    assert!(!engine.can_user_approve(&request_id, "u-lead-2").await.expect("can approve"));
}

#[tokio::test]
async fn concurrent_any_one_approvals_commit_once() {
    let pool = migrated_pool().await;
    let engine = engine(&pool);
    let request_id = submit(&engine, "wf-design-change", serde_json::json!({})).await;
    let view = engine.get_request(&request_id).await.expect("view");

    let mut handles = Vec::new();
    for step in view.steps.into_iter().filter(|step| step.level_number == 1) {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            let approver = step.approver_id.clone();
            engine.approve(&step.id, &approver, None).await
        }));
    }

    let mut succeeded = 0;
    for handle in handles {
        if handle.await.expect("task").is_ok() {
            succeeded += 1;
        }
    }
    assert_eq!(succeeded, 1);

    let view = engine.get_request(&request_id).await.expect("view");
    assert_eq!(view.request.current_level, 2);
    assert_eq!(view.steps.iter().filter(|step| step.level_number == 2).count(), 1);
    assert!(engine.verify_history(&request_id).await.expect("verify").valid);
}

#[tokio::test]
async fn overdue_leave_request_escalates_once() {
    let pool = migrated_pool().await;
    let engine = engine(&pool);
    let request_id = submit(&engine, "wf-leave-request", serde_json::json!({"days": 3})).await;

    let later = Utc::now() + Duration::hours(25);
    let sweep = engine.escalate_overdue(later, 50).await.expect("sweep");
    assert_eq!(sweep.escalated, vec![request_id.clone()]);
    assert!(sweep.failed.is_empty());

    let again = engine.escalate_overdue(later, 50).await.expect("second sweep");
    assert!(again.escalated.is_empty());

    approve_as(&engine, &request_id, "u-mgr").await;
    let view = engine.get_request(&request_id).await.expect("view");
    assert_eq!(view.request.status, RequestStatus::Approved);

    let escalations = engine
        .get_history(&request_id)
        .await
        .expect("history")
        .iter()
        .filter(|entry| entry.action == HistoryAction::Escalated)
        .count();
    assert_eq!(escalations, 1);
}

#[tokio::test]
async fn history_rows_cannot_be_rewritten() {
    let pool = migrated_pool().await;
    let engine = engine(&pool);
    let request_id = submit(&engine, "wf-leave-request", serde_json::json!({})).await;

    let tampered = sqlx::query("UPDATE approval_history SET actor_id = 'u-mallory' WHERE request_id = ?")
        .bind(&request_id.0)
        .execute(&pool)
        .await;
    assert!(tampered.is_err());
    assert!(engine.verify_history(&request_id).await.expect("verify").valid);
}

#[tokio::test]
async fn bounded_sweeps_reach_every_overdue_request() {
    let pool = migrated_pool().await;
    let engine = engine(&pool);
    let first = submit(&engine, "wf-leave-request", serde_json::json!({"days": 2})).await;
    let second = submit(&engine, "wf-leave-request", serde_json::json!({"days": 4})).await;

    let later = Utc::now() + Duration::hours(25);
    let mut flagged = Vec::new();
    for _ in 0..3 {
        flagged.extend(engine.escalate_overdue(later, 1).await.expect("sweep").escalated);
    }
    flagged.sort_by(|left, right| left.0.cmp(&right.0));
    let mut expected = vec![first, second];
    expected.sort_by(|left, right| left.0.cmp(&right.0));
    assert_eq!(flagged, expected);
}

#[tokio::test]
async fn racing_approvals_of_one_step_commit_once() {
    let pool = migrated_pool().await;
    let engine = engine(&pool);
    let request_id = submit(&engine, "wf-design-change", serde_json::json!({})).await;
    let view = engine.get_request(&request_id).await.expect("view");
    let step = view
        .steps
        .iter()
        .find(|step| step.approver_id == "u-lead-1")
        .expect("lead step")
        .clone();

    let mut handles = Vec::new();
    for _ in 0..2 {
        let engine = engine.clone();
        let step_id = step.id.clone();
        handles.push(tokio::spawn(async move { engine.approve(&step_id, "u-lead-1", None).await }));
    }

    let mut succeeded = 0;
    for handle in handles {
        match handle.await.expect("task") {
            Ok(_) => succeeded += 1,
            Err(error) => assert!(error.is_invalid_state(), "{error:?}"),
        }
    }
    assert_eq!(succeeded, 1);

    let approvals: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM approval_history WHERE request_id = ? AND action = 'APPROVED'
           AND actor_id = 'u-lead-1'",
    )
    .bind(&request_id.0)
    .fetch_one(&pool)
    .await
    .expect("count");
    assert_eq!(approvals, 1);
}

#[tokio::test]
async fn cancel_racing_approval_leaves_one_outcome() {
    let pool = migrated_pool().await;
    let engine = engine(&pool);
    let request_id = submit(&engine, "wf-leave-request", serde_json::json!({})).await;
    let view = engine.get_request(&request_id).await.expect("view");
    let step_id = view.steps[0].id.clone();

    let approver = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.approve(&step_id, "u-mgr", None).await })
    };
    let canceller = {
        let engine = engine.clone();
        let request_id = request_id.clone();
        tokio::spawn(async move { engine.cancel(&request_id, "u-req", None).await })
    };
    let approved = approver.await.expect("task");
    let cancelled = canceller.await.expect("task");
    assert!(approved.is_ok() != cancelled.is_ok(), "{approved:?} / {cancelled:?}");

    let status: String = sqlx::query_scalar("SELECT status FROM approval_request WHERE id = ?")
        .bind(&request_id.0)
        .fetch_one(&pool)
        .await
        .expect("status");
    let expected = if approved.is_ok() { "APPROVED" } else { "CANCELLED" };
    assert_eq!(status, expected);
    assert!(engine.verify_history(&request_id).await.expect("verify").valid);
}

#[tokio::test]
async fn deactivated_delegation_row_is_kept() {
    let pool = migrated_pool().await;
    let engine = engine(&pool);
    let now = Utc::now();
    let delegation = engine
        .create_delegation(NewDelegation {
            delegator_id: "u-mgr".to_string(),
            delegate_id: "u-ops-1".to_string(),
            workflow_type_scope: BTreeSet::new(),
            start_at: now - Duration::minutes(1),
            end_at: now + Duration::days(5),
            reason: Some("offsite".to_string()),
        })
        .await
        .expect("delegation");

    let refused = engine.deactivate_delegation(&delegation.id, "u-ops-2").await;
    assert!(refused.is_err());

    engine.deactivate_delegation(&delegation.id, "u-ops-admin").await.expect("admin deactivates");

    let is_active: bool = sqlx::query_scalar("SELECT is_active FROM delegation WHERE id = ?")
        .bind(&delegation.id.0)
        .fetch_one(&pool)
        .await
        .expect("row kept");
    assert!(!is_active);

    let request_id = submit(&engine, "wf-leave-request", serde_json::json!({})).await;
    let view = engine.get_request(&request_id).await.expect("view");
    assert_eq!(view.steps[0].approver_id, "u-mgr");
}
