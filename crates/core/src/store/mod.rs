//! Persistence seams for the engine. SQLite adapters live in `opsflow-db`.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::domain::delegation::{Delegation, DelegationId};
use crate::domain::history::ApprovalHistory;
use crate::domain::request::{ApprovalRequest, RequestId};
use crate::domain::step::{ApprovalStep, StepId};
use crate::domain::workflow::{Workflow, WorkflowId};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("request `{request_id}` changed concurrently (expected version {expected_version})")]
    VersionConflict { request_id: String, expected_version: u64 },
    #[error("step `{step_id}` is no longer pending")]
    StepConflict { step_id: String },
}

/// Everything one engine operation writes, applied all-or-nothing.
///
/// `request.version` must already be bumped; the store rejects the commit when
/// the persisted version is not `expected_version`. Updated steps are only
/// written while the persisted row is still `PENDING`.
#[derive(Clone, Debug, PartialEq)]
pub struct RequestCommit {
    pub request: ApprovalRequest,
    pub expected_version: Option<u64>,
    pub inserted_steps: Vec<ApprovalStep>,
    pub updated_steps: Vec<ApprovalStep>,
}

impl RequestCommit {
    pub fn new(request: ApprovalRequest, expected_version: Option<u64>) -> Self {
        Self { request, expected_version, inserted_steps: Vec::new(), updated_steps: Vec::new() }
    }
}

#[async_trait]
pub trait PolicyStore: Send + Sync {
    async fn find_workflow(&self, id: &WorkflowId) -> Result<Option<Workflow>, StoreError>;
    async fn save_workflow(&self, workflow: Workflow) -> Result<(), StoreError>;
    async fn list_workflows(&self) -> Result<Vec<Workflow>, StoreError>;
}

#[async_trait]
pub trait DelegationStore: Send + Sync {
    async fn find_delegation(&self, id: &DelegationId) -> Result<Option<Delegation>, StoreError>;
    async fn save_delegation(&self, delegation: Delegation) -> Result<(), StoreError>;
    async fn list_for_delegator(&self, delegator_id: &str) -> Result<Vec<Delegation>, StoreError>;
}

#[async_trait]
pub trait RequestStore: Send + Sync {
    async fn find_request(&self, id: &RequestId) -> Result<Option<ApprovalRequest>, StoreError>;
    async fn find_step(&self, id: &StepId) -> Result<Option<ApprovalStep>, StoreError>;
    async fn list_steps(&self, request_id: &RequestId) -> Result<Vec<ApprovalStep>, StoreError>;
    async fn list_pending_steps_for(&self, approver_id: &str)
        -> Result<Vec<ApprovalStep>, StoreError>;
    /// Submitted or in-progress requests whose current level was activated
    /// before `before`, oldest activation first. Already escalated requests
    /// are excluded before `limit` applies.
    async fn list_escalation_candidates(
        &self,
        before: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<ApprovalRequest>, StoreError>;
    async fn commit(&self, commit: RequestCommit) -> Result<(), StoreError>;
}

#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn append(&self, entry: ApprovalHistory) -> Result<(), StoreError>;
    async fn latest(&self, request_id: &RequestId) -> Result<Option<ApprovalHistory>, StoreError>;
    async fn list(&self, request_id: &RequestId) -> Result<Vec<ApprovalHistory>, StoreError>;
}
