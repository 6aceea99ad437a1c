use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::workflow::WorkflowType;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DelegationId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delegation {
    pub id: DelegationId,
    pub delegator_id: String,
    pub delegate_id: String,
    /// Empty means every workflow type.
    pub workflow_type_scope: BTreeSet<WorkflowType>,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub is_active: bool,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Delegation {
    pub fn is_current(&self, now: DateTime<Utc>) -> bool {
        self.is_active && self.start_at <= now && now <= self.end_at
    }

    pub fn covers(&self, workflow_type: WorkflowType) -> bool {
        self.workflow_type_scope.is_empty() || self.workflow_type_scope.contains(&workflow_type)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use chrono::{Duration, Utc};

    use super::{Delegation, DelegationId};
    use crate::domain::workflow::WorkflowType;

    fn delegation(scope: &[WorkflowType]) -> Delegation {
        let now = Utc::now();
        Delegation {
            id: DelegationId("DLG-1".to_string()),
            delegator_id: "u-boss".to_string(),
            delegate_id: "u-deputy".to_string(),
            workflow_type_scope: scope.iter().copied().collect::<BTreeSet<_>>(),
            start_at: now - Duration::days(1),
            end_at: now + Duration::days(1),
            is_active: true,
            reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn current_only_inside_window_and_while_active() {
        let mut record = delegation(&[]);
        let now = Utc::now();
        assert!(record.is_current(now));
        assert!(!record.is_current(now + Duration::days(2)));
        assert!(!record.is_current(now - Duration::days(2)));

        record.is_active = false;
        assert!(!record.is_current(now));
    }

    #[test]
    fn empty_scope_covers_every_type() {
        assert!(delegation(&[]).covers(WorkflowType::LeaveRequest));

        let scoped = delegation(&[WorkflowType::PurchaseRequest]);
        assert!(scoped.covers(WorkflowType::PurchaseRequest));
        assert!(!scoped.covers(WorkflowType::LeaveRequest));
    }
}
