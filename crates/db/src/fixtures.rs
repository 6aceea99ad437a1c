use chrono::{TimeZone, Utc};
use rust_decimal::Decimal;
use tracing::info;

use opsflow_core::conditions::Condition;
use opsflow_core::domain::workflow::{
    ApprovalMode, ApproverSelector, Level, LevelId, Workflow, WorkflowId, WorkflowType,
};
use opsflow_core::store::{PolicyStore, StoreError};

use crate::connection::DbPool;
use crate::repositories::SqlPolicyStore;

/// Demo workflow definitions and the shape each must have after seeding.
const SEED_WORKFLOWS: &[SeedWorkflowContract] = &[
    SeedWorkflowContract {
        workflow_id: "wf-purchase-request",
        workflow_type: WorkflowType::PurchaseRequest,
        name: "Purchase request",
        description: "Department majority, then finance sign-off above 5000",
        expected_levels: 2,
    },
    SeedWorkflowContract {
        workflow_id: "wf-design-change",
        workflow_type: WorkflowType::DesignChange,
        name: "Design change",
        description: "Any engineering lead, then every quality reviewer",
        expected_levels: 2,
    },
    SeedWorkflowContract {
        workflow_id: "wf-leave-request",
        workflow_type: WorkflowType::LeaveRequest,
        name: "Leave request",
        description: "Line manager approval with a 24 hour SLA",
        expected_levels: 1,
    },
];

/// Deterministic demo workflows used by `opsflow seed` and integration tests.
pub struct DemoWorkflows;

impl DemoWorkflows {
    /// Upserts every demo workflow. Re-running replaces the definitions in place.
    pub async fn load(pool: &DbPool) -> Result<SeedResult, StoreError> {
        let store = SqlPolicyStore::new(pool.clone());
        for workflow in Self::definitions() {
            let workflow_id = workflow.id.0.clone();
            store.save_workflow(workflow).await?;
            info!(event_name = "db.seed.workflow_upserted", workflow_id = %workflow_id, "seeded demo workflow");
        }

        let workflows_seeded = SEED_WORKFLOWS
            .iter()
            .map(|contract| WorkflowSeedInfo {
                workflow_id: contract.workflow_id,
                workflow_type: contract.workflow_type.as_str(),
                description: contract.description,
            })
            .collect();

        Ok(SeedResult { workflows_seeded })
    }

    pub async fn verify(pool: &DbPool) -> Result<SeedVerification, StoreError> {
        let store = SqlPolicyStore::new(pool.clone());
        let mut checks = Vec::with_capacity(SEED_WORKFLOWS.len());

        for contract in SEED_WORKFLOWS {
            let found = store.find_workflow(&WorkflowId(contract.workflow_id.to_string())).await?;
            let passed = found.is_some_and(|workflow| {
                workflow.is_active
                    && workflow.workflow_type == contract.workflow_type
                    && workflow.levels.len() == contract.expected_levels
                    && workflow.validate_levels().is_ok()
            });
            checks.push((contract.workflow_id, passed));
        }

        Ok(SeedVerification { all_present: checks.iter().all(|(_, passed)| *passed), checks })
    }

    pub fn definitions() -> Vec<Workflow> {
        vec![purchase_request(), design_change(), leave_request()]
    }
}

fn purchase_request() -> Workflow {
    let id = WorkflowId("wf-purchase-request".to_string());
    Workflow {
        id: id.clone(),
        workflow_type: WorkflowType::PurchaseRequest,
        name: "Purchase request".to_string(),
        description: "Department majority, then finance sign-off above 5000".to_string(),
        is_active: true,
        requires_all_levels: false,
        auto_approve_conditions: Some(Condition::less_than("amount", Decimal::new(500, 0))),
        levels: vec![
            Level {
                id: LevelId("wf-purchase-request-L1".to_string()),
                workflow_id: id.clone(),
                level_number: 1,
                name: "Department review".to_string(),
                approval_mode: ApprovalMode::Majority,
                approver_selectors: vec![ApproverSelector::Department {
                    department_id: "operations".to_string(),
                }],
                skip_if_requester_is_approver: true,
                required_conditions: None,
                sla_hours: Some(48),
            },
            Level {
                id: LevelId("wf-purchase-request-L2".to_string()),
                workflow_id: id,
                level_number: 2,
                name: "Finance sign-off".to_string(),
                approval_mode: ApprovalMode::AnyOne,
                approver_selectors: vec![ApproverSelector::Role {
                    role: "finance-approver".to_string(),
                }],
                skip_if_requester_is_approver: true,
                required_conditions: Some(Condition::greater_or_equal(
                    "amount",
                    Decimal::new(5000, 0),
                )),
                sla_hours: Some(72),
            },
        ],
        created_at: seeded_at(),
        updated_at: seeded_at(),
    }
}

fn design_change() -> Workflow {
    let id = WorkflowId("wf-design-change".to_string());
    Workflow {
        id: id.clone(),
        workflow_type: WorkflowType::DesignChange,
        name: "Design change".to_string(),
        description: "Any engineering lead, then every quality reviewer".to_string(),
        is_active: true,
        requires_all_levels: true,
        auto_approve_conditions: None,
        levels: vec![
            Level {
                id: LevelId("wf-design-change-L1".to_string()),
                workflow_id: id.clone(),
                level_number: 1,
                name: "Engineering lead".to_string(),
                approval_mode: ApprovalMode::AnyOne,
                approver_selectors: vec![ApproverSelector::Role {
                    role: "engineering-lead".to_string(),
                }],
                skip_if_requester_is_approver: false,
                required_conditions: None,
                sla_hours: Some(24),
            },
            Level {
                id: LevelId("wf-design-change-L2".to_string()),
                workflow_id: id,
                level_number: 2,
                name: "Quality review".to_string(),
                approval_mode: ApprovalMode::All,
                approver_selectors: vec![ApproverSelector::Department {
                    department_id: "quality".to_string(),
                }],
                skip_if_requester_is_approver: false,
                required_conditions: None,
                sla_hours: Some(48),
            },
        ],
        created_at: seeded_at(),
        updated_at: seeded_at(),
    }
}

fn leave_request() -> Workflow {
    let id = WorkflowId("wf-leave-request".to_string());
    Workflow {
        id: id.clone(),
        workflow_type: WorkflowType::LeaveRequest,
        name: "Leave request".to_string(),
        description: "Line manager approval with a 24 hour SLA".to_string(),
        is_active: true,
        requires_all_levels: true,
        auto_approve_conditions: None,
        levels: vec![Level {
            id: LevelId("wf-leave-request-L1".to_string()),
            workflow_id: id,
            level_number: 1,
            name: "Line manager".to_string(),
            approval_mode: ApprovalMode::Sequential,
            approver_selectors: vec![ApproverSelector::Role { role: "line-manager".to_string() }],
            skip_if_requester_is_approver: true,
            required_conditions: None,
            sla_hours: Some(24),
        }],
        created_at: seeded_at(),
        updated_at: seeded_at(),
    }
}

fn seeded_at() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).single().unwrap_or_default()
}

#[derive(Debug, Clone, Copy)]
struct SeedWorkflowContract {
    workflow_id: &'static str,
    workflow_type: WorkflowType,
    name: &'static str,
    description: &'static str,
    expected_levels: usize,
}

#[derive(Debug)]
pub struct SeedResult {
    pub workflows_seeded: Vec<WorkflowSeedInfo>,
}

#[derive(Debug)]
pub struct WorkflowSeedInfo {
    pub workflow_id: &'static str,
    pub workflow_type: &'static str,
    pub description: &'static str,
}

#[derive(Debug)]
pub struct SeedVerification {
    pub all_present: bool,
    pub checks: Vec<(&'static str, bool)>,
}
