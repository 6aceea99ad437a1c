//! Approval workflow engine.
//!
//! Every mutating operation follows the same shape: take the request's lock,
//! load the request and its steps into a [`Transition`], apply the action and
//! all derived effects (level completion, activation of the next level,
//! finalization) in memory, commit the result as one unit, then append the
//! history entries and dispatch notifications collected along the way.

pub mod completion;
pub mod locks;

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::audit::{AuditCategory, AuditEvent, AuditOutcome, AuditSink, TracingAuditSink};
use crate::conditions::{ConditionEvaluator, MetadataConditionEvaluator};
use crate::delegation::{DelegationRegistry, NewDelegation};
use crate::directory::{resolve_selectors, DirectoryLookup};
use crate::domain::delegation::{Delegation, DelegationId};
use crate::domain::history::{ApprovalHistory, HistoryAction, HistoryDraft};
use crate::domain::request::{
    ApprovalRequest, Priority, RequestId, RequestStatus, SubjectRef, Visibility,
};
use crate::domain::step::{ApprovalStep, StepId, StepStatus};
use crate::domain::workflow::{Level, Workflow, WorkflowId};
use crate::errors::{ApplicationError, DomainError};
use crate::ledger::{HistoryLedger, VerificationResult};
use crate::notify::{NotificationEvent, NotificationGateway, TracingNotificationGateway};
use crate::store::{DelegationStore, HistoryStore, PolicyStore, RequestCommit, RequestStore};
use crate::visibility;

use self::completion::{evaluate_level, LevelOutcome};
use self::locks::RequestLocks;

/// Actor recorded on entries the engine writes on its own behalf.
pub const SYSTEM_ACTOR: &str = "system";

#[derive(Clone)]
pub struct EngineStores {
    pub policies: Arc<dyn PolicyStore>,
    pub requests: Arc<dyn RequestStore>,
    pub history: Arc<dyn HistoryStore>,
    pub delegations: Arc<dyn DelegationStore>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewRequest {
    pub workflow_id: WorkflowId,
    pub title: String,
    pub description: String,
    pub requester_id: String,
    pub priority: Priority,
    pub metadata: serde_json::Value,
    pub visibility: Visibility,
    pub subject: Option<SubjectRef>,
    pub due_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RequestView {
    pub request: ApprovalRequest,
    pub steps: Vec<ApprovalStep>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PendingApproval {
    pub step: ApprovalStep,
    pub request: ApprovalRequest,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct EscalationSweep {
    pub escalated: Vec<RequestId>,
    pub failed: Vec<(RequestId, String)>,
}

/// Working set of one operation on one request.
struct Transition {
    request: ApprovalRequest,
    expected_version: Option<u64>,
    steps: Vec<ApprovalStep>,
    inserted: Vec<StepId>,
    updated: Vec<StepId>,
    history: Vec<HistoryDraft>,
    notifications: Vec<NotificationEvent>,
}

impl Transition {
    fn fresh(request: ApprovalRequest) -> Self {
        Self::with_version(request, Vec::new(), None)
    }

    fn load(request: ApprovalRequest, steps: Vec<ApprovalStep>) -> Self {
        let version = request.version;
        Self::with_version(request, steps, Some(version))
    }

    fn with_version(
        request: ApprovalRequest,
        steps: Vec<ApprovalStep>,
        expected_version: Option<u64>,
    ) -> Self {
        Self {
            request,
            expected_version,
            steps,
            inserted: Vec::new(),
            updated: Vec::new(),
            history: Vec::new(),
            notifications: Vec::new(),
        }
    }

    fn step(&self, id: &StepId) -> Option<&ApprovalStep> {
        self.steps.iter().find(|step| &step.id == id)
    }

    fn update_step<F>(&mut self, id: &StepId, apply: F)
    where
        F: FnOnce(&mut ApprovalStep),
    {
        if let Some(step) = self.steps.iter_mut().find(|step| &step.id == id) {
            apply(step);
            if !self.inserted.contains(id) && !self.updated.contains(id) {
                self.updated.push(id.clone());
            }
        }
    }

    fn insert_step(&mut self, step: ApprovalStep) {
        self.inserted.push(step.id.clone());
        self.steps.push(step);
    }

    fn record(&mut self, draft: HistoryDraft) {
        self.history.push(draft);
    }

    fn notify(&mut self, event: NotificationEvent) {
        self.notifications.push(event);
    }

    fn into_commit(
        mut self,
        now: DateTime<Utc>,
    ) -> (RequestCommit, Vec<HistoryDraft>, Vec<NotificationEvent>) {
        self.request.version = self.expected_version.map(|version| version + 1).unwrap_or(1);
        self.request.updated_at = now;

        let mut commit = RequestCommit::new(self.request, self.expected_version);
        for step in self.steps {
            if self.inserted.contains(&step.id) {
                commit.inserted_steps.push(step);
            } else if self.updated.contains(&step.id) {
                commit.updated_steps.push(step);
            }
        }
        (commit, self.history, self.notifications)
    }
}

enum LevelDecision {
    Waiting { approved: usize, required: usize },
    Complete,
    Rejected { approver_id: String, comments: Option<String> },
}

pub struct WorkflowEngine {
    stores: EngineStores,
    delegations: DelegationRegistry,
    directory: Arc<dyn DirectoryLookup>,
    conditions: Arc<dyn ConditionEvaluator>,
    notifications: Arc<dyn NotificationGateway>,
    audit: Arc<dyn AuditSink>,
    ledger: HistoryLedger,
    locks: RequestLocks,
}

impl WorkflowEngine {
    pub fn new(
        stores: EngineStores,
        directory: Arc<dyn DirectoryLookup>,
        ledger: HistoryLedger,
    ) -> Self {
        let delegations = DelegationRegistry::new(stores.delegations.clone(), directory.clone());
        Self {
            stores,
            delegations,
            directory,
            conditions: Arc::new(MetadataConditionEvaluator),
            notifications: Arc::new(TracingNotificationGateway),
            audit: Arc::new(TracingAuditSink),
            ledger,
            locks: RequestLocks::default(),
        }
    }

    pub fn with_notifications(mut self, gateway: Arc<dyn NotificationGateway>) -> Self {
        self.notifications = gateway;
        self
    }

    pub fn with_audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = sink;
        self
    }

    pub fn with_condition_evaluator(mut self, evaluator: Arc<dyn ConditionEvaluator>) -> Self {
        self.conditions = evaluator;
        self
    }

    /// Users treated as administrators in addition to the directory's own.
    pub fn with_administrators<I>(mut self, user_ids: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        self.delegations = self.delegations.with_administrators(user_ids);
        self
    }

    pub fn delegations(&self) -> &DelegationRegistry {
        &self.delegations
    }

    pub async fn create_request(&self, input: NewRequest) -> Result<ApprovalRequest, ApplicationError> {
        let title = input.title.trim();
        if title.is_empty() {
            return Err(DomainError::Validation("request title is required".to_string()).into());
        }
        let requester_id = input.requester_id.trim();
        if requester_id.is_empty() {
            return Err(DomainError::Validation("requester is required".to_string()).into());
        }
        let metadata = match input.metadata {
            serde_json::Value::Null => serde_json::Value::Object(serde_json::Map::new()),
            value @ serde_json::Value::Object(_) => value,
            _ => {
                return Err(DomainError::Validation(
                    "request metadata must be a JSON object".to_string(),
                )
                .into())
            }
        };

        let workflow = self.load_workflow(&input.workflow_id).await?;
        if !workflow.is_active {
            return Err(DomainError::Validation(format!(
                "workflow `{}` is inactive",
                workflow.id.0
            ))
            .into());
        }
        self.check_conditions_readable(&workflow, &metadata)?;

        let now = Utc::now();
        let request = ApprovalRequest {
            id: RequestId(format!("REQ-{}", Uuid::new_v4())),
            workflow_id: workflow.id.clone(),
            workflow_type: workflow.workflow_type,
            title: title.to_string(),
            description: input.description,
            requester_id: requester_id.to_string(),
            status: RequestStatus::Draft,
            current_level: 0,
            level_activated_at: None,
            submitted_at: None,
            completed_at: None,
            due_at: input.due_at,
            visibility: input.visibility,
            priority: input.priority,
            subject: input.subject,
            metadata,
            version: 0,
            created_at: now,
            updated_at: now,
        };

        let mut tx = Transition::fresh(request);
        tx.record(HistoryDraft::new(tx.request.id.clone(), HistoryAction::Created, requester_id));
        let request = self.finish(tx, now).await?;

        info!(
            event_name = "engine.request.created",
            request_id = %request.id,
            workflow_id = %request.workflow_id.0,
            requester_id = %request.requester_id,
            "approval request created"
        );
        Ok(request)
    }

    pub async fn submit(
        &self,
        request_id: &RequestId,
        actor_id: &str,
    ) -> Result<ApprovalRequest, ApplicationError> {
        let _guard = self.locks.acquire(request_id).await;
        let mut tx = self.load_transition(request_id).await?;

        if tx.request.requester_id != actor_id {
            return Err(DomainError::NotAuthorized(format!(
                "only the requester can submit request `{request_id}`"
            ))
            .into());
        }
        if tx.request.status != RequestStatus::Draft {
            return Err(DomainError::InvalidState(format!(
                "request `{request_id}` is {} and cannot be submitted",
                tx.request.status.as_str()
            ))
            .into());
        }
        let workflow = self.load_workflow(&tx.request.workflow_id).await?;
        if !workflow.is_active {
            return Err(DomainError::InvalidState(format!(
                "workflow `{}` was deactivated",
                workflow.id.0
            ))
            .into());
        }
        self.check_conditions_readable(&workflow, &tx.request.metadata)?;

        let now = Utc::now();
        tx.request.status = RequestStatus::Submitted;
        tx.request.submitted_at = Some(now);
        tx.record(HistoryDraft::new(request_id.clone(), HistoryAction::Submitted, actor_id));
        self.activate_level(&mut tx, &workflow, 1, now).await?;

        let request = self.finish(tx, now).await?;
        info!(
            event_name = "engine.request.submitted",
            request_id = %request.id,
            status = request.status.as_str(),
            current_level = request.current_level,
            "approval request submitted"
        );
        Ok(request)
    }

    pub async fn approve(
        &self,
        step_id: &StepId,
        actor_id: &str,
        comments: Option<String>,
    ) -> Result<ApprovalRequest, ApplicationError> {
        let request_id = self.request_id_for_step(step_id).await?;
        let _guard = self.locks.acquire(&request_id).await;
        let mut tx = self.load_transition(&request_id).await?;
        let level_number = check_actionable(&tx, step_id, actor_id)?;
        let workflow = self.load_workflow(&tx.request.workflow_id).await?;

        let now = Utc::now();
        let comments = clean(comments);
        tx.update_step(step_id, |step| {
            step.status = StepStatus::Approved;
            step.approved_at = Some(now);
            step.comments = comments.clone();
        });
        tx.record(
            HistoryDraft::new(request_id.clone(), HistoryAction::Approved, actor_id)
                .with_step(step_id.clone())
                .with_comments(comments)
                .with_metadata("level", level_number.to_string()),
        );
        self.evaluate_level_completion(&mut tx, &workflow, now).await?;

        let request = self.finish(tx, now).await?;
        info!(
            event_name = "engine.step.approved",
            request_id = %request.id,
            step_id = %step_id,
            actor_id,
            status = request.status.as_str(),
            "approval step approved"
        );
        Ok(request)
    }

    pub async fn reject(
        &self,
        step_id: &StepId,
        actor_id: &str,
        comments: &str,
    ) -> Result<ApprovalRequest, ApplicationError> {
        let comments = comments.trim();
        if comments.is_empty() {
            return Err(DomainError::Validation("a rejection requires comments".to_string()).into());
        }

        let request_id = self.request_id_for_step(step_id).await?;
        let _guard = self.locks.acquire(&request_id).await;
        let mut tx = self.load_transition(&request_id).await?;
        let level_number = check_actionable(&tx, step_id, actor_id)?;

        let now = Utc::now();
        tx.update_step(step_id, |step| {
            step.status = StepStatus::Rejected;
            step.rejected_at = Some(now);
            step.comments = Some(comments.to_string());
        });
        tx.record(
            HistoryDraft::new(request_id.clone(), HistoryAction::Rejected, actor_id)
                .with_step(step_id.clone())
                .with_comments(Some(comments.to_string()))
                .with_metadata("level", level_number.to_string()),
        );
        self.finalize_rejected(&mut tx, actor_id, Some(comments.to_string()), now);

        let request = self.finish(tx, now).await?;
        info!(
            event_name = "engine.step.rejected",
            request_id = %request.id,
            step_id = %step_id,
            actor_id,
            "approval step rejected"
        );
        Ok(request)
    }

    /// Hands a pending step to another user. The original row becomes
    /// `DELEGATED` and is never touched again; the delegate gets a new step.
    pub async fn delegate_step(
        &self,
        step_id: &StepId,
        actor_id: &str,
        delegate_user_id: &str,
        reason: Option<String>,
    ) -> Result<ApprovalRequest, ApplicationError> {
        let delegate_id = delegate_user_id.trim();
        if delegate_id.is_empty() {
            return Err(DomainError::Validation("a delegate user is required".to_string()).into());
        }
        if delegate_id == actor_id {
            return Err(DomainError::Validation(format!(
                "user `{actor_id}` cannot delegate a step to themselves"
            ))
            .into());
        }

        let request_id = self.request_id_for_step(step_id).await?;
        let _guard = self.locks.acquire(&request_id).await;
        let mut tx = self.load_transition(&request_id).await?;
        let level_number = check_actionable(&tx, step_id, actor_id)?;
        let workflow = self.load_workflow(&tx.request.workflow_id).await?;

        let already_pending = tx.steps.iter().any(|step| {
            step.level_number == level_number && step.is_pending() && step.approver_id == delegate_id
        });
        if already_pending {
            return Err(DomainError::Validation(format!(
                "`{delegate_id}` already has a pending step at level {level_number}"
            ))
            .into());
        }
        let Some(level_id) = tx.step(step_id).map(|step| step.level_id.clone()) else {
            return Err(DomainError::not_found("step", step_id.0.clone()).into());
        };

        let now = Utc::now();
        let reason = clean(reason);
        tx.update_step(step_id, |step| {
            step.status = StepStatus::Delegated;
            step.delegated_at = Some(now);
            step.delegated_to_id = Some(delegate_id.to_string());
            step.comments = reason.clone();
        });

        let derived = new_step(&request_id, level_id, level_number, delegate_id, now);
        let derived = ApprovalStep { delegated_from_step_id: Some(step_id.clone()), ..derived };
        tx.notify(NotificationEvent::RequestSubmittedToApprover {
            request_id: request_id.clone(),
            step_id: derived.id.clone(),
            approver_id: delegate_id.to_string(),
        });
        tx.record(
            HistoryDraft::new(request_id.clone(), HistoryAction::Delegated, actor_id)
                .with_step(step_id.clone())
                .with_comments(reason)
                .with_metadata("delegate_id", delegate_id)
                .with_metadata("new_step_id", derived.id.0.clone())
                .with_metadata("level", level_number.to_string()),
        );
        tx.insert_step(derived);
        self.evaluate_level_completion(&mut tx, &workflow, now).await?;

        let request = self.finish(tx, now).await?;
        info!(
            event_name = "engine.step.delegated",
            request_id = %request.id,
            step_id = %step_id,
            actor_id,
            delegate_id,
            "approval step delegated"
        );
        Ok(request)
    }

    pub async fn cancel(
        &self,
        request_id: &RequestId,
        actor_id: &str,
        reason: Option<String>,
    ) -> Result<ApprovalRequest, ApplicationError> {
        let _guard = self.locks.acquire(request_id).await;
        let mut tx = self.load_transition(request_id).await?;

        if tx.request.requester_id != actor_id && !self.is_administrator(actor_id)? {
            return Err(DomainError::NotAuthorized(format!(
                "`{actor_id}` may not cancel request `{request_id}`"
            ))
            .into());
        }
        if tx.request.is_terminal() {
            return Err(DomainError::InvalidState(format!(
                "request `{request_id}` is already {}",
                tx.request.status.as_str()
            ))
            .into());
        }

        let now = Utc::now();
        tx.request.status = RequestStatus::Cancelled;
        tx.request.completed_at = Some(now);
        tx.record(
            HistoryDraft::new(request_id.clone(), HistoryAction::Cancelled, actor_id)
                .with_comments(clean(reason)),
        );

        let request = self.finish(tx, now).await?;
        info!(
            event_name = "engine.request.cancelled",
            request_id = %request.id,
            actor_id,
            "approval request cancelled"
        );
        Ok(request)
    }

    /// Appends a COMMENTED entry. Any user who can see the request may comment.
    pub async fn comment(
        &self,
        request_id: &RequestId,
        actor_id: &str,
        text: &str,
        internal: bool,
    ) -> Result<ApprovalHistory, ApplicationError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(DomainError::Validation("comment text is required".to_string()).into());
        }

        let _guard = self.locks.acquire(request_id).await;
        let view = self.load_view(request_id).await?;
        if !self.visible_to(&view, actor_id)? {
            return Err(DomainError::NotAuthorized(format!(
                "`{actor_id}` cannot see request `{request_id}`"
            ))
            .into());
        }

        let mut draft = HistoryDraft::new(request_id.clone(), HistoryAction::Commented, actor_id)
            .with_comments(Some(text.to_string()));
        if internal {
            draft = draft.internal();
        }
        let previous = self.stores.history.latest(request_id).await?;
        let entry = self.ledger.seal(draft, previous.as_ref(), Utc::now());
        self.stores.history.append(entry.clone()).await?;
        Ok(entry)
    }

    /// Flags the request `ESCALATED` when its current level has outlived its
    /// SLA. Advisory only: nothing is reassigned.
    pub async fn check_escalation(
        &self,
        request_id: &RequestId,
        now: DateTime<Utc>,
    ) -> Result<ApprovalRequest, ApplicationError> {
        let _guard = self.locks.acquire(request_id).await;
        let mut tx = self.load_transition(request_id).await?;
        if !matches!(tx.request.status, RequestStatus::Submitted | RequestStatus::InProgress) {
            return Ok(tx.request);
        }

        let workflow = self.load_workflow(&tx.request.workflow_id).await?;
        let Some(sla_hours) = overdue_sla(&tx.request, &workflow, now) else {
            return Ok(tx.request);
        };

        let level_number = tx.request.current_level;
        tx.request.status = RequestStatus::Escalated;
        tx.record(
            HistoryDraft::new(request_id.clone(), HistoryAction::Escalated, SYSTEM_ACTOR)
                .with_metadata("level", level_number.to_string())
                .with_metadata("sla_hours", sla_hours.to_string()),
        );
        tx.notify(NotificationEvent::RequestEscalated {
            request_id: request_id.clone(),
            requester_id: tx.request.requester_id.clone(),
            level_number,
        });

        let request = self.finish(tx, now).await?;
        warn!(
            event_name = "engine.request.escalated",
            request_id = %request.id,
            level = level_number,
            sla_hours,
            "approval level exceeded its SLA"
        );
        Ok(request)
    }

    /// Runs [`Self::check_escalation`] over requests that are not yet
    /// escalated. A failure on one request is reported and does not stop the
    /// sweep.
    pub async fn escalate_overdue(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<EscalationSweep, ApplicationError> {
        let candidates = self.stores.requests.list_escalation_candidates(now, limit).await?;
        let mut sweep = EscalationSweep::default();

        for candidate in candidates {
            match self.check_escalation(&candidate.id, now).await {
                Ok(request) if request.status == RequestStatus::Escalated => {
                    sweep.escalated.push(request.id)
                }
                Ok(_) => {}
                Err(error) => {
                    warn!(
                        event_name = "engine.escalation.failed",
                        request_id = %candidate.id,
                        error = %error,
                        "escalation check failed"
                    );
                    sweep.failed.push((candidate.id, error.to_string()));
                }
            }
        }
        Ok(sweep)
    }

    pub async fn create_delegation(
        &self,
        input: NewDelegation,
    ) -> Result<Delegation, ApplicationError> {
        let delegation = self.delegations.create(input, Utc::now()).await?;
        self.audit_delegation(
            "delegation.created",
            &delegation.id,
            &delegation.delegator_id,
            AuditOutcome::Success,
        );
        Ok(delegation)
    }

    /// Refused attempts are audited alongside successful ones.
    pub async fn deactivate_delegation(
        &self,
        id: &DelegationId,
        actor_id: &str,
    ) -> Result<Delegation, ApplicationError> {
        let result = self.delegations.deactivate(id, actor_id, Utc::now()).await;
        let outcome = match &result {
            Ok(_) => Some(AuditOutcome::Success),
            Err(ApplicationError::Domain(DomainError::NotAuthorized(_))) => {
                Some(AuditOutcome::Rejected)
            }
            Err(_) => None,
        };
        if let Some(outcome) = outcome {
            self.audit_delegation("delegation.deactivated", id, actor_id, outcome);
        }
        result
    }

    pub async fn get_request(&self, request_id: &RequestId) -> Result<RequestView, ApplicationError> {
        self.load_view(request_id).await
    }

    /// Pending steps at the current level of live requests, oldest first.
    pub async fn list_pending_for(
        &self,
        user_id: &str,
    ) -> Result<Vec<PendingApproval>, ApplicationError> {
        let steps = self.stores.requests.list_pending_steps_for(user_id).await?;
        let mut pending = Vec::with_capacity(steps.len());
        for step in steps {
            let Some(request) = self.stores.requests.find_request(&step.request_id).await? else {
                continue;
            };
            if request.status.is_in_flight() && step.level_number == request.current_level {
                pending.push(PendingApproval { step, request });
            }
        }
        pending.sort_by(|left, right| left.step.created_at.cmp(&right.step.created_at));
        Ok(pending)
    }

    pub async fn get_history(
        &self,
        request_id: &RequestId,
    ) -> Result<Vec<ApprovalHistory>, ApplicationError> {
        Ok(self.stores.history.list(request_id).await?)
    }

    pub async fn verify_history(
        &self,
        request_id: &RequestId,
    ) -> Result<VerificationResult, ApplicationError> {
        let entries = self.stores.history.list(request_id).await?;
        Ok(self.ledger.verify_chain(request_id, &entries))
    }

    pub async fn can_user_see(
        &self,
        request_id: &RequestId,
        user_id: &str,
    ) -> Result<bool, ApplicationError> {
        let view = self.load_view(request_id).await?;
        self.visible_to(&view, user_id)
    }

    pub async fn can_user_approve(
        &self,
        request_id: &RequestId,
        user_id: &str,
    ) -> Result<bool, ApplicationError> {
        let view = self.load_view(request_id).await?;
        Ok(visibility::can_user_approve(&view.request, &view.steps, user_id))
    }

    async fn activate_level(
        &self,
        tx: &mut Transition,
        workflow: &Workflow,
        from_level: u32,
        now: DateTime<Utc>,
    ) -> Result<(), ApplicationError> {
        let mut level_number = from_level;
        loop {
            let Some(level) = workflow.level(level_number) else {
                self.finalize_approved(tx, now, false);
                return Ok(());
            };

            if let Some(condition) = &level.required_conditions {
                if !self.conditions.evaluate(condition, &tx.request.metadata)? {
                    tx.record(level_skipped(&tx.request.id, level, "conditions_not_met"));
                    level_number += 1;
                    continue;
                }
            }

            let approvers = self.resolve_level_approvers(&tx.request, level, now).await?;
            if approvers.is_empty() {
                tx.record(level_skipped(&tx.request.id, level, "no_eligible_approvers"));
                level_number += 1;
                continue;
            }

            for (approver_id, substituted_for_id) in approvers {
                let step = ApprovalStep {
                    substituted_for_id,
                    ..new_step(&tx.request.id, level.id.clone(), level_number, &approver_id, now)
                };
                tx.notify(NotificationEvent::RequestSubmittedToApprover {
                    request_id: tx.request.id.clone(),
                    step_id: step.id.clone(),
                    approver_id,
                });
                tx.insert_step(step);
            }
            tx.request.current_level = level_number;
            tx.request.level_activated_at = Some(now);
            tx.request.status = RequestStatus::InProgress;

            info!(
                event_name = "engine.level.activated",
                request_id = %tx.request.id,
                level = level_number,
                mode = level.approval_mode.as_str(),
                "approval level activated"
            );
            return Ok(());
        }
    }

    /// Configured approvers minus the requester (when the level says so),
    /// each replaced by their current delegate, de-duplicated.
    async fn resolve_level_approvers(
        &self,
        request: &ApprovalRequest,
        level: &Level,
        now: DateTime<Utc>,
    ) -> Result<Vec<(String, Option<String>)>, ApplicationError> {
        let mut configured = resolve_selectors(self.directory.as_ref(), &level.approver_selectors)
            .map_err(ApplicationError::Integration)?;
        if level.skip_if_requester_is_approver {
            configured.remove(&request.requester_id);
        }

        let mut seen = BTreeSet::new();
        let mut resolved = Vec::with_capacity(configured.len());
        for approver in configured {
            let entry = match self
                .delegations
                .resolve_approver(&approver, request.workflow_type, now)
                .await?
            {
                Some(delegate) => (delegate, Some(approver)),
                None => (approver, None),
            };
            if seen.insert(entry.0.clone()) {
                resolved.push(entry);
            }
        }
        Ok(resolved)
    }

    async fn evaluate_level_completion(
        &self,
        tx: &mut Transition,
        workflow: &Workflow,
        now: DateTime<Utc>,
    ) -> Result<(), ApplicationError> {
        let level_number = tx.request.current_level;
        let level = workflow.level(level_number).ok_or_else(|| {
            DomainError::not_found("level", format!("{}#{level_number}", workflow.id.0))
        })?;

        let decision = {
            let level_steps: Vec<&ApprovalStep> =
                tx.steps.iter().filter(|step| step.level_id == level.id).collect();
            match evaluate_level(level.approval_mode, &level_steps) {
                LevelOutcome::Pending { approved, required } => {
                    LevelDecision::Waiting { approved, required }
                }
                LevelOutcome::Complete => LevelDecision::Complete,
                LevelOutcome::Rejected { step_index } => LevelDecision::Rejected {
                    approver_id: level_steps[step_index].approver_id.clone(),
                    comments: level_steps[step_index].comments.clone(),
                },
            }
        };

        match decision {
            LevelDecision::Waiting { approved, required } => {
                debug!(
                    event_name = "engine.level.waiting",
                    request_id = %tx.request.id,
                    level = level_number,
                    approved,
                    required,
                    "approval level still pending"
                );
                Ok(())
            }
            LevelDecision::Rejected { approver_id, comments } => {
                self.finalize_rejected(tx, &approver_id, comments, now);
                Ok(())
            }
            LevelDecision::Complete => {
                // Approvers the level no longer needs (ANY_ONE, MAJORITY) are closed out.
                let leftover: Vec<StepId> = tx
                    .steps
                    .iter()
                    .filter(|step| step.level_id == level.id && step.is_pending())
                    .map(|step| step.id.clone())
                    .collect();
                for step_id in &leftover {
                    tx.update_step(step_id, |step| step.status = StepStatus::Skipped);
                }
                info!(
                    event_name = "engine.level.completed",
                    request_id = %tx.request.id,
                    level = level_number,
                    skipped_steps = leftover.len(),
                    "approval level completed"
                );

                if !workflow.requires_all_levels {
                    if let Some(condition) = &workflow.auto_approve_conditions {
                        if self.conditions.evaluate(condition, &tx.request.metadata)? {
                            self.finalize_approved(tx, now, true);
                            return Ok(());
                        }
                    }
                }
                self.activate_level(tx, workflow, level_number + 1, now).await
            }
        }
    }

    fn finalize_approved(&self, tx: &mut Transition, now: DateTime<Utc>, auto_approved: bool) {
        tx.request.status = RequestStatus::Approved;
        tx.request.completed_at = Some(now);

        let mut draft =
            HistoryDraft::new(tx.request.id.clone(), HistoryAction::Approved, SYSTEM_ACTOR)
                .with_metadata("final", "true");
        if auto_approved {
            draft = draft.with_metadata("auto_approved", "true");
        }
        tx.record(draft);
        tx.notify(NotificationEvent::RequestApproved {
            request_id: tx.request.id.clone(),
            requester_id: tx.request.requester_id.clone(),
        });
    }

    /// Other pending steps at the level are left untouched; the terminal
    /// request makes them inert.
    fn finalize_rejected(
        &self,
        tx: &mut Transition,
        rejecting_approver_id: &str,
        comments: Option<String>,
        now: DateTime<Utc>,
    ) {
        tx.request.status = RequestStatus::Rejected;
        tx.request.completed_at = Some(now);
        tx.record(
            HistoryDraft::new(tx.request.id.clone(), HistoryAction::Rejected, rejecting_approver_id)
                .with_comments(comments.clone())
                .with_metadata("final", "true"),
        );
        tx.notify(NotificationEvent::RequestRejected {
            request_id: tx.request.id.clone(),
            requester_id: tx.request.requester_id.clone(),
            reason: comments.unwrap_or_default(),
        });
    }

    async fn finish(
        &self,
        tx: Transition,
        now: DateTime<Utc>,
    ) -> Result<ApprovalRequest, ApplicationError> {
        let (commit, history, notifications) = tx.into_commit(now);
        let request = commit.request.clone();
        self.stores.requests.commit(commit).await?;

        self.append_history(&request.id, history, now).await;
        self.dispatch(notifications);
        Ok(request)
    }

    /// History is appended after the state commit. A failure here is an
    /// operator problem: the caller's transition already succeeded.
    async fn append_history(
        &self,
        request_id: &RequestId,
        drafts: Vec<HistoryDraft>,
        now: DateTime<Utc>,
    ) {
        if drafts.is_empty() {
            return;
        }

        let mut previous = match self.stores.history.latest(request_id).await {
            Ok(previous) => previous,
            Err(store_error) => {
                self.report_history_loss(request_id, &drafts, &store_error.to_string());
                return;
            }
        };

        for (index, draft) in drafts.iter().enumerate() {
            let entry = self.ledger.seal(draft.clone(), previous.as_ref(), now);
            if let Err(store_error) = self.stores.history.append(entry.clone()).await {
                self.report_history_loss(request_id, &drafts[index..], &store_error.to_string());
                return;
            }
            previous = Some(entry);
        }
    }

    fn report_history_loss(&self, request_id: &RequestId, lost: &[HistoryDraft], reason: &str) {
        let actions =
            lost.iter().map(|draft| draft.action.as_str()).collect::<Vec<_>>().join(",");
        error!(
            event_name = "engine.history.append_failed",
            request_id = %request_id,
            lost_entries = lost.len(),
            actions = %actions,
            error = reason,
            "history append failed after committed transition"
        );
        self.audit.emit(
            AuditEvent::new(
                Some(request_id.clone()),
                request_id.0.clone(),
                "history.append_failed",
                AuditCategory::History,
                SYSTEM_ACTOR,
                AuditOutcome::Failed,
            )
            .with_metadata("lost_entries", lost.len().to_string())
            .with_metadata("actions", actions)
            .with_metadata("error", reason),
        );
    }

    fn dispatch(&self, notifications: Vec<NotificationEvent>) {
        for event in notifications {
            if let Err(dispatch_error) = self.notifications.dispatch(&event) {
                warn!(
                    event_name = "notification.dispatch_failed",
                    request_id = %event.request_id(),
                    kind = event.kind(),
                    error = %dispatch_error,
                    "notification dispatch failed"
                );
                self.audit.emit(
                    AuditEvent::new(
                        Some(event.request_id().clone()),
                        event.request_id().0.clone(),
                        "notification.dispatch_failed",
                        AuditCategory::Notification,
                        SYSTEM_ACTOR,
                        AuditOutcome::Failed,
                    )
                    .with_metadata("kind", event.kind())
                    .with_metadata("recipient", event.recipient())
                    .with_metadata("error", dispatch_error.to_string()),
                );
            }
        }
    }

    async fn load_workflow(&self, id: &WorkflowId) -> Result<Workflow, ApplicationError> {
        self.stores
            .policies
            .find_workflow(id)
            .await?
            .ok_or_else(|| DomainError::not_found("workflow", id.0.clone()).into())
    }

    async fn load_view(&self, request_id: &RequestId) -> Result<RequestView, ApplicationError> {
        let request = self
            .stores
            .requests
            .find_request(request_id)
            .await?
            .ok_or_else(|| DomainError::not_found("request", request_id.0.clone()))?;
        let steps = self.stores.requests.list_steps(request_id).await?;
        Ok(RequestView { request, steps })
    }

    async fn load_transition(&self, request_id: &RequestId) -> Result<Transition, ApplicationError> {
        let view = self.load_view(request_id).await?;
        Ok(Transition::load(view.request, view.steps))
    }

    async fn request_id_for_step(&self, step_id: &StepId) -> Result<RequestId, ApplicationError> {
        self.stores
            .requests
            .find_step(step_id)
            .await?
            .map(|step| step.request_id)
            .ok_or_else(|| DomainError::not_found("step", step_id.0.clone()).into())
    }

    fn visible_to(&self, view: &RequestView, user_id: &str) -> Result<bool, ApplicationError> {
        let department =
            self.directory.department_of(user_id).map_err(ApplicationError::Integration)?;
        Ok(visibility::can_user_see(&view.request, &view.steps, user_id, department.as_deref()))
    }

    fn is_administrator(&self, user_id: &str) -> Result<bool, ApplicationError> {
        self.delegations.is_administrator(user_id)
    }

    /// Every level condition and the auto-approve condition must be
    /// evaluable against the metadata, so a request cannot stall later on a
    /// value its approvers cannot change.
    fn check_conditions_readable(
        &self,
        workflow: &Workflow,
        metadata: &serde_json::Value,
    ) -> Result<(), ApplicationError> {
        let conditions = workflow
            .levels
            .iter()
            .filter_map(|level| level.required_conditions.as_ref())
            .chain(workflow.auto_approve_conditions.as_ref());
        for condition in conditions {
            self.conditions.evaluate(condition, metadata)?;
        }
        Ok(())
    }

    fn audit_delegation(
        &self,
        event_type: &str,
        delegation_id: &DelegationId,
        actor_id: &str,
        outcome: AuditOutcome,
    ) {
        self.audit.emit(AuditEvent::new(
            None,
            delegation_id.0.clone(),
            event_type,
            AuditCategory::Delegation,
            actor_id,
            outcome,
        ));
    }
}

/// Returns the step's level number when `actor_id` may act on it now.
fn check_actionable(
    tx: &Transition,
    step_id: &StepId,
    actor_id: &str,
) -> Result<u32, ApplicationError> {
    let step = tx.step(step_id).ok_or_else(|| DomainError::not_found("step", step_id.0.clone()))?;

    if step.approver_id != actor_id {
        return Err(DomainError::NotAuthorized(format!(
            "step `{step_id}` is assigned to another approver"
        ))
        .into());
    }
    if !step.is_pending() {
        return Err(DomainError::InvalidState(format!(
            "step `{step_id}` is already {}",
            step.status.as_str()
        ))
        .into());
    }
    if !tx.request.status.is_in_flight() {
        return Err(DomainError::InvalidState(format!(
            "request `{}` is {}",
            tx.request.id,
            tx.request.status.as_str()
        ))
        .into());
    }
    if step.level_number != tx.request.current_level {
        return Err(DomainError::InvalidState(format!(
            "step `{step_id}` belongs to level {} but the request is at level {}",
            step.level_number, tx.request.current_level
        ))
        .into());
    }
    Ok(step.level_number)
}

fn overdue_sla(request: &ApprovalRequest, workflow: &Workflow, now: DateTime<Utc>) -> Option<u32> {
    let level = workflow.level(request.current_level)?;
    let sla_hours = level.sla_hours?;
    let activated_at = request.level_activated_at?;
    (now - activated_at > Duration::hours(i64::from(sla_hours))).then_some(sla_hours)
}

fn new_step(
    request_id: &RequestId,
    level_id: crate::domain::workflow::LevelId,
    level_number: u32,
    approver_id: &str,
    now: DateTime<Utc>,
) -> ApprovalStep {
    ApprovalStep {
        id: StepId(format!("STP-{}", Uuid::new_v4())),
        request_id: request_id.clone(),
        level_id,
        level_number,
        approver_id: approver_id.to_string(),
        status: StepStatus::Pending,
        approved_at: None,
        rejected_at: None,
        delegated_at: None,
        comments: None,
        delegated_to_id: None,
        delegated_from_step_id: None,
        substituted_for_id: None,
        created_at: now,
    }
}

fn level_skipped(request_id: &RequestId, level: &Level, reason: &str) -> HistoryDraft {
    HistoryDraft::new(request_id.clone(), HistoryAction::Commented, SYSTEM_ACTOR)
        .with_metadata("event", "level_skipped")
        .with_metadata("level", level.level_number.to_string())
        .with_metadata("reason", reason)
        .internal()
}

fn clean(value: Option<String>) -> Option<String> {
    value.map(|text| text.trim().to_string()).filter(|text| !text.is_empty())
}
