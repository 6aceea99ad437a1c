use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::conditions::Condition;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkflowId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LevelId(pub String);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowType {
    PurchaseRequest,
    DesignChange,
    LeaveRequest,
    ExpenseClaim,
    QualityDeviation,
    Custom,
}

impl WorkflowType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PurchaseRequest => "PURCHASE_REQUEST",
            Self::DesignChange => "DESIGN_CHANGE",
            Self::LeaveRequest => "LEAVE_REQUEST",
            Self::ExpenseClaim => "EXPENSE_CLAIM",
            Self::QualityDeviation => "QUALITY_DEVIATION",
            Self::Custom => "CUSTOM",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "PURCHASE_REQUEST" => Some(Self::PurchaseRequest),
            "DESIGN_CHANGE" => Some(Self::DesignChange),
            "LEAVE_REQUEST" => Some(Self::LeaveRequest),
            "EXPENSE_CLAIM" => Some(Self::ExpenseClaim),
            "QUALITY_DEVIATION" => Some(Self::QualityDeviation),
            "CUSTOM" => Some(Self::Custom),
            _ => None,
        }
    }
}

/// How many of a level's approvers must approve before the level completes.
///
/// `Sequential`, `Parallel` and `All` share the same completion rule: every
/// step at the level must be approved. All steps of a level are materialized
/// at once regardless of mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApprovalMode {
    Sequential,
    Parallel,
    AnyOne,
    Majority,
    All,
}

impl ApprovalMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sequential => "SEQUENTIAL",
            Self::Parallel => "PARALLEL",
            Self::AnyOne => "ANY_ONE",
            Self::Majority => "MAJORITY",
            Self::All => "ALL",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "SEQUENTIAL" => Some(Self::Sequential),
            "PARALLEL" => Some(Self::Parallel),
            "ANY_ONE" => Some(Self::AnyOne),
            "MAJORITY" => Some(Self::Majority),
            "ALL" => Some(Self::All),
            _ => None,
        }
    }
}

/// A principal reference resolved against the directory when a level activates.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApproverSelector {
    ExplicitUsers { user_ids: Vec<String> },
    Department { department_id: String },
    Role { role: String },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Level {
    pub id: LevelId,
    pub workflow_id: WorkflowId,
    pub level_number: u32,
    pub name: String,
    pub approval_mode: ApprovalMode,
    pub approver_selectors: Vec<ApproverSelector>,
    pub skip_if_requester_is_approver: bool,
    pub required_conditions: Option<Condition>,
    pub sla_hours: Option<u32>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub id: WorkflowId,
    pub workflow_type: WorkflowType,
    pub name: String,
    pub description: String,
    pub is_active: bool,
    pub requires_all_levels: bool,
    pub auto_approve_conditions: Option<Condition>,
    pub levels: Vec<Level>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Workflow {
    pub fn level(&self, level_number: u32) -> Option<&Level> {
        self.levels.iter().find(|level| level.level_number == level_number)
    }

    pub fn level_count(&self) -> u32 {
        self.levels.iter().map(|level| level.level_number).max().unwrap_or(0)
    }

    /// Level numbers must start at 1, be unique and carry no gaps.
    pub fn validate_levels(&self) -> Result<(), String> {
        let mut numbers: Vec<u32> = self.levels.iter().map(|level| level.level_number).collect();
        numbers.sort_unstable();
        for (index, number) in numbers.iter().enumerate() {
            let expected = u32::try_from(index).unwrap_or(u32::MAX).saturating_add(1);
            if *number != expected {
                return Err(format!(
                    "workflow `{}` levels must be numbered 1..=n without gaps; found {:?}",
                    self.id.0, numbers
                ));
            }
        }

        if let Some(level) = self.levels.iter().find(|level| level.workflow_id != self.id) {
            return Err(format!(
                "level `{}` belongs to workflow `{}`, not `{}`",
                level.id.0, level.workflow_id.0, self.id.0
            ));
        }

        if let Some(level) = self.levels.iter().find(|level| level.approver_selectors.is_empty()) {
            return Err(format!("level `{}` has no approver selectors", level.id.0));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::{ApprovalMode, ApproverSelector, Level, LevelId, Workflow, WorkflowId, WorkflowType};

    fn level(workflow: &str, number: u32) -> Level {
        Level {
            id: LevelId(format!("{workflow}-L{number}")),
            workflow_id: WorkflowId(workflow.to_string()),
            level_number: number,
            name: format!("Level {number}"),
            approval_mode: ApprovalMode::All,
            approver_selectors: vec![ApproverSelector::ExplicitUsers {
                user_ids: vec!["u-a".to_string()],
            }],
            skip_if_requester_is_approver: false,
            required_conditions: None,
            sla_hours: None,
        }
    }

    fn workflow(levels: Vec<Level>) -> Workflow {
        Workflow {
            id: WorkflowId("wf-1".to_string()),
            workflow_type: WorkflowType::PurchaseRequest,
            name: "Purchase".to_string(),
            description: String::new(),
            is_active: true,
            requires_all_levels: true,
            auto_approve_conditions: None,
            levels,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn level_numbers_must_be_contiguous() {
        assert!(workflow(vec![level("wf-1", 1), level("wf-1", 2)]).validate_levels().is_ok());
        assert!(workflow(vec![level("wf-1", 1), level("wf-1", 3)]).validate_levels().is_err());
        assert!(workflow(vec![level("wf-1", 1), level("wf-1", 1)]).validate_levels().is_err());
    }

    #[test]
    fn level_from_another_workflow_is_rejected() {
        let error = workflow(vec![level("wf-2", 1)]).validate_levels().expect_err("foreign level");
        assert!(error.contains("wf-2"));
    }

    #[test]
    fn enum_tags_parse_case_insensitively() {
        assert_eq!(WorkflowType::parse("purchase_request"), Some(WorkflowType::PurchaseRequest));
        assert_eq!(ApprovalMode::parse(" any_one "), Some(ApprovalMode::AnyOne));
        assert_eq!(ApprovalMode::parse("quorum"), None);
    }

    #[test]
    fn selector_serializes_with_kind_tag() {
        let json = serde_json::to_value(ApproverSelector::Role { role: "qa_lead".to_string() })
            .expect("serialize selector");
        assert_eq!(json["kind"], "ROLE");
        assert_eq!(json["role"], "qa_lead");
    }
}
