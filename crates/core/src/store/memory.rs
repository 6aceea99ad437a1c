use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::domain::delegation::{Delegation, DelegationId};
use crate::domain::history::ApprovalHistory;
use crate::domain::request::{ApprovalRequest, RequestId};
use crate::domain::step::{ApprovalStep, StepId};
use crate::domain::workflow::{Workflow, WorkflowId};

use super::{DelegationStore, HistoryStore, PolicyStore, RequestCommit, RequestStore, StoreError};

#[derive(Default)]
pub struct InMemoryPolicyStore {
    workflows: RwLock<HashMap<String, Workflow>>,
}

#[async_trait::async_trait]
impl PolicyStore for InMemoryPolicyStore {
    async fn find_workflow(&self, id: &WorkflowId) -> Result<Option<Workflow>, StoreError> {
        let workflows = self.workflows.read().await;
        Ok(workflows.get(&id.0).cloned())
    }

    async fn save_workflow(&self, workflow: Workflow) -> Result<(), StoreError> {
        workflow.validate_levels().map_err(StoreError::Decode)?;
        let mut workflows = self.workflows.write().await;
        workflows.insert(workflow.id.0.clone(), workflow);
        Ok(())
    }

    async fn list_workflows(&self) -> Result<Vec<Workflow>, StoreError> {
        let workflows = self.workflows.read().await;
        let mut listed: Vec<Workflow> = workflows.values().cloned().collect();
        listed.sort_by(|left, right| left.id.0.cmp(&right.id.0));
        Ok(listed)
    }
}

#[derive(Default)]
pub struct InMemoryDelegationStore {
    delegations: RwLock<HashMap<String, Delegation>>,
}

#[async_trait::async_trait]
impl DelegationStore for InMemoryDelegationStore {
    async fn find_delegation(&self, id: &DelegationId) -> Result<Option<Delegation>, StoreError> {
        let delegations = self.delegations.read().await;
        Ok(delegations.get(&id.0).cloned())
    }

    async fn save_delegation(&self, delegation: Delegation) -> Result<(), StoreError> {
        let mut delegations = self.delegations.write().await;
        delegations.insert(delegation.id.0.clone(), delegation);
        Ok(())
    }

    async fn list_for_delegator(&self, delegator_id: &str) -> Result<Vec<Delegation>, StoreError> {
        let delegations = self.delegations.read().await;
        let mut listed: Vec<Delegation> = delegations
            .values()
            .filter(|delegation| delegation.delegator_id == delegator_id)
            .cloned()
            .collect();
        listed.sort_by(|left, right| left.start_at.cmp(&right.start_at));
        Ok(listed)
    }
}

#[derive(Default)]
struct RequestTables {
    requests: HashMap<String, ApprovalRequest>,
    steps: HashMap<String, ApprovalStep>,
}

/// Requests and steps share one lock so a commit is applied atomically.
#[derive(Default)]
pub struct InMemoryRequestStore {
    tables: RwLock<RequestTables>,
}

#[async_trait::async_trait]
impl RequestStore for InMemoryRequestStore {
    async fn find_request(&self, id: &RequestId) -> Result<Option<ApprovalRequest>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables.requests.get(&id.0).cloned())
    }

    async fn find_step(&self, id: &StepId) -> Result<Option<ApprovalStep>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables.steps.get(&id.0).cloned())
    }

    async fn list_steps(&self, request_id: &RequestId) -> Result<Vec<ApprovalStep>, StoreError> {
        let tables = self.tables.read().await;
        let mut steps: Vec<ApprovalStep> =
            tables.steps.values().filter(|step| &step.request_id == request_id).cloned().collect();
        steps.sort_by(|left, right| {
            left.level_number
                .cmp(&right.level_number)
                .then_with(|| left.created_at.cmp(&right.created_at))
                .then_with(|| left.id.0.cmp(&right.id.0))
        });
        Ok(steps)
    }

    async fn list_pending_steps_for(
        &self,
        approver_id: &str,
    ) -> Result<Vec<ApprovalStep>, StoreError> {
        let tables = self.tables.read().await;
        let mut steps: Vec<ApprovalStep> = tables
            .steps
            .values()
            .filter(|step| step.is_pending() && step.approver_id == approver_id)
            .cloned()
            .collect();
        steps.sort_by(|left, right| left.created_at.cmp(&right.created_at));
        Ok(steps)
    }

    async fn list_escalation_candidates(
        &self,
        before: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<ApprovalRequest>, StoreError> {
        let tables = self.tables.read().await;
        let mut requests: Vec<ApprovalRequest> = tables
            .requests
            .values()
            .filter(|request| request.status.is_escalatable())
            .filter(|request| request.level_activated_at.is_some_and(|at| at < before))
            .cloned()
            .collect();
        requests.sort_by(|left, right| left.level_activated_at.cmp(&right.level_activated_at));
        requests.truncate(limit as usize);
        Ok(requests)
    }

    async fn commit(&self, commit: RequestCommit) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;

        let persisted_version = tables.requests.get(&commit.request.id.0).map(|r| r.version);
        if persisted_version != commit.expected_version {
            return Err(StoreError::VersionConflict {
                request_id: commit.request.id.0.clone(),
                expected_version: commit.expected_version.unwrap_or_default(),
            });
        }
        for step in &commit.updated_steps {
            let still_pending =
                tables.steps.get(&step.id.0).map(ApprovalStep::is_pending).unwrap_or(false);
            if !still_pending {
                return Err(StoreError::StepConflict { step_id: step.id.0.clone() });
            }
        }
        for step in &commit.inserted_steps {
            if tables.steps.contains_key(&step.id.0) {
                return Err(StoreError::StepConflict { step_id: step.id.0.clone() });
            }
        }

        for step in commit.inserted_steps.into_iter().chain(commit.updated_steps) {
            tables.steps.insert(step.id.0.clone(), step);
        }
        tables.requests.insert(commit.request.id.0.clone(), commit.request);
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryHistoryStore {
    entries: RwLock<HashMap<String, Vec<ApprovalHistory>>>,
}

#[cfg(test)]
impl InMemoryHistoryStore {
    /// Overwrites a stored entry in place, bypassing the append-only contract.
    pub(crate) async fn replace(&self, entry: ApprovalHistory) {
        let mut entries = self.entries.write().await;
        if let Some(chain) = entries.get_mut(&entry.request_id.0) {
            if let Some(slot) = chain.iter_mut().find(|existing| existing.id == entry.id) {
                *slot = entry;
            }
        }
    }
}

#[async_trait::async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn append(&self, entry: ApprovalHistory) -> Result<(), StoreError> {
        let mut entries = self.entries.write().await;
        let chain = entries.entry(entry.request_id.0.clone()).or_default();
        let expected = chain.last().map(|last| last.sequence + 1).unwrap_or(1);
        if entry.sequence != expected {
            return Err(StoreError::Database(format!(
                "history sequence {} out of order for `{}` (expected {expected})",
                entry.sequence, entry.request_id
            )));
        }
        chain.push(entry);
        Ok(())
    }

    async fn latest(&self, request_id: &RequestId) -> Result<Option<ApprovalHistory>, StoreError> {
        let entries = self.entries.read().await;
        Ok(entries.get(&request_id.0).and_then(|chain| chain.last().cloned()))
    }

    async fn list(&self, request_id: &RequestId) -> Result<Vec<ApprovalHistory>, StoreError> {
        let entries = self.entries.read().await;
        Ok(entries.get(&request_id.0).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::{InMemoryHistoryStore, InMemoryRequestStore};
    use crate::domain::history::{HistoryAction, HistoryDraft};
    use crate::domain::request::{ApprovalRequest, Priority, RequestId, RequestStatus, Visibility};
    use crate::domain::workflow::{WorkflowId, WorkflowType};
    use crate::ledger::HistoryLedger;
    use crate::store::{HistoryStore, RequestCommit, RequestStore, StoreError};

    fn request(version: u64) -> ApprovalRequest {
        let now = Utc::now();
        ApprovalRequest {
            id: RequestId("REQ-1".to_string()),
            workflow_id: WorkflowId("wf-1".to_string()),
            workflow_type: WorkflowType::ExpenseClaim,
            title: "Conference travel".to_string(),
            description: String::new(),
            requester_id: "u-req".to_string(),
            status: RequestStatus::Draft,
            current_level: 0,
            level_activated_at: None,
            submitted_at: None,
            completed_at: None,
            due_at: None,
            visibility: Visibility::default(),
            priority: Priority::Normal,
            subject: None,
            metadata: serde_json::json!({}),
            version,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn stale_commit_is_a_version_conflict() {
        let store = InMemoryRequestStore::default();
        store.commit(RequestCommit::new(request(1), None)).await.expect("insert");
        store.commit(RequestCommit::new(request(2), Some(1))).await.expect("update");

        let stale = store.commit(RequestCommit::new(request(2), Some(1))).await;
        assert!(matches!(stale, Err(StoreError::VersionConflict { expected_version: 1, .. })));

        let persisted = store.find_request(&RequestId("REQ-1".to_string())).await.expect("find");
        assert_eq!(persisted.map(|r| r.version), Some(2));
    }

    #[tokio::test]
    async fn history_rejects_gaps_in_sequence() {
        let store = InMemoryHistoryStore::default();
        let ledger = HistoryLedger::new("test-key-test-key-test-key-0001");
        let request_id = RequestId("REQ-1".to_string());

        let first = ledger.seal(
            HistoryDraft::new(request_id.clone(), HistoryAction::Created, "u-req"),
            None,
            Utc::now(),
        );
        store.append(first.clone()).await.expect("append first");

        let mut skipped = ledger.seal(
            HistoryDraft::new(request_id.clone(), HistoryAction::Submitted, "u-req"),
            Some(&first),
            Utc::now(),
        );
        skipped.sequence = 5;
        assert!(store.append(skipped).await.is_err());
        assert_eq!(store.list(&request_id).await.expect("list").len(), 1);
    }
}
