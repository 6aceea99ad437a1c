use crate::domain::step::{ApprovalStep, StepStatus};
use crate::domain::workflow::ApprovalMode;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LevelOutcome {
    Pending { approved: usize, required: usize },
    Complete,
    /// A single rejection decides the level whatever the mode.
    Rejected { step_index: usize },
}

/// Decides a level from its steps. Delegated and skipped rows are not counted:
/// a delegate's derived step takes the delegator's place in the denominator.
pub fn evaluate_level(mode: ApprovalMode, steps: &[&ApprovalStep]) -> LevelOutcome {
    if let Some(step_index) = steps.iter().position(|step| step.status == StepStatus::Rejected) {
        return LevelOutcome::Rejected { step_index };
    }

    let total = steps
        .iter()
        .filter(|step| !matches!(step.status, StepStatus::Delegated | StepStatus::Skipped))
        .count();
    let approved = steps.iter().filter(|step| step.status == StepStatus::Approved).count();
    let required = required_approvals(mode, total);

    if total > 0 && approved >= required {
        LevelOutcome::Complete
    } else {
        LevelOutcome::Pending { approved, required }
    }
}

pub fn required_approvals(mode: ApprovalMode, total: usize) -> usize {
    match mode {
        ApprovalMode::AnyOne => 1.min(total),
        ApprovalMode::Majority => total / 2 + 1,
        ApprovalMode::All | ApprovalMode::Sequential | ApprovalMode::Parallel => total,
    }
}
