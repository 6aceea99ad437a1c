use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::directory::DirectoryLookup;
use crate::domain::delegation::{Delegation, DelegationId};
use crate::domain::workflow::WorkflowType;
use crate::errors::{ApplicationError, DomainError};
use crate::store::DelegationStore;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewDelegation {
    pub delegator_id: String,
    pub delegate_id: String,
    pub workflow_type_scope: BTreeSet<WorkflowType>,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub reason: Option<String>,
}

impl NewDelegation {
    pub fn validate(&self) -> Result<(), DomainError> {
        let delegator = self.delegator_id.trim();
        let delegate = self.delegate_id.trim();
        if delegator.is_empty() || delegate.is_empty() {
            return Err(DomainError::Validation(
                "delegator and delegate must both be set".to_string(),
            ));
        }
        if delegator == delegate {
            return Err(DomainError::Validation(format!(
                "user `{delegator}` cannot delegate to themselves"
            )));
        }
        if self.end_at <= self.start_at {
            return Err(DomainError::Validation(format!(
                "delegation window ends ({}) before it starts ({})",
                self.end_at.to_rfc3339(),
                self.start_at.to_rfc3339()
            )));
        }
        Ok(())
    }
}

/// Picks the delegate standing in for `original_approver_id`, if any.
///
/// Not chained: a delegate's own delegations are never followed. When several
/// delegations match, the one that started most recently wins.
pub fn select_delegate<'a>(
    delegations: &'a [Delegation],
    original_approver_id: &str,
    workflow_type: WorkflowType,
    as_of: DateTime<Utc>,
) -> Option<&'a Delegation> {
    delegations
        .iter()
        .filter(|delegation| delegation.delegator_id == original_approver_id)
        .filter(|delegation| delegation.is_current(as_of))
        .filter(|delegation| delegation.covers(workflow_type))
        .max_by(|left, right| {
            left.start_at.cmp(&right.start_at).then_with(|| left.created_at.cmp(&right.created_at))
        })
}

#[derive(Clone)]
pub struct DelegationRegistry {
    store: Arc<dyn DelegationStore>,
    directory: Arc<dyn DirectoryLookup>,
    administrators: BTreeSet<String>,
}

impl DelegationRegistry {
    pub fn new(store: Arc<dyn DelegationStore>, directory: Arc<dyn DirectoryLookup>) -> Self {
        Self { store, directory, administrators: BTreeSet::new() }
    }

    /// Users treated as administrators in addition to the directory's own.
    pub fn with_administrators<I>(mut self, user_ids: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        self.administrators.extend(user_ids);
        self
    }

    pub async fn create(
        &self,
        input: NewDelegation,
        now: DateTime<Utc>,
    ) -> Result<Delegation, ApplicationError> {
        input.validate()?;

        let delegation = Delegation {
            id: DelegationId(format!("DLG-{}", Uuid::new_v4())),
            delegator_id: input.delegator_id.trim().to_string(),
            delegate_id: input.delegate_id.trim().to_string(),
            workflow_type_scope: input.workflow_type_scope,
            start_at: input.start_at,
            end_at: input.end_at,
            is_active: true,
            reason: input.reason.filter(|reason| !reason.trim().is_empty()),
            created_at: now,
            updated_at: now,
        };
        self.store.save_delegation(delegation.clone()).await?;

        tracing::info!(
            event_name = "delegation.created",
            delegation_id = %delegation.id.0,
            delegator_id = %delegation.delegator_id,
            delegate_id = %delegation.delegate_id,
            "delegation created"
        );
        Ok(delegation)
    }

    /// Only the delegator or an administrator may deactivate. The row is kept.
    pub async fn deactivate(
        &self,
        id: &DelegationId,
        actor_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Delegation, ApplicationError> {
        let mut delegation = self
            .store
            .find_delegation(id)
            .await?
            .ok_or_else(|| DomainError::not_found("delegation", id.0.clone()))?;

        if delegation.delegator_id != actor_id && !self.is_administrator(actor_id)? {
            return Err(DomainError::NotAuthorized(format!(
                "`{actor_id}` cannot deactivate delegation `{}`",
                id.0
            ))
            .into());
        }
        if !delegation.is_active {
            return Err(DomainError::InvalidState(format!(
                "delegation `{}` is already inactive",
                id.0
            ))
            .into());
        }

        delegation.is_active = false;
        delegation.updated_at = now;
        self.store.save_delegation(delegation.clone()).await?;

        tracing::info!(
            event_name = "delegation.deactivated",
            delegation_id = %delegation.id.0,
            actor_id,
            "delegation deactivated"
        );
        Ok(delegation)
    }

    pub async fn resolve_approver(
        &self,
        original_approver_id: &str,
        workflow_type: WorkflowType,
        as_of: DateTime<Utc>,
    ) -> Result<Option<String>, ApplicationError> {
        let delegations = self.store.list_for_delegator(original_approver_id).await?;
        Ok(select_delegate(&delegations, original_approver_id, workflow_type, as_of)
            .map(|delegation| delegation.delegate_id.clone()))
    }

    pub async fn list_for(&self, delegator_id: &str) -> Result<Vec<Delegation>, ApplicationError> {
        Ok(self.store.list_for_delegator(delegator_id).await?)
    }

    pub fn is_administrator(&self, user_id: &str) -> Result<bool, ApplicationError> {
        if self.administrators.contains(user_id) {
            return Ok(true);
        }
        self.directory.is_administrator(user_id).map_err(ApplicationError::Integration)
    }
}
