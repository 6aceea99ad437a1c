use crate::domain::request::ApprovalRequest;
use crate::domain::step::ApprovalStep;

/// Whether `user_id` may see the request. Every approver who ever held a step
/// on it keeps visibility, including after the request is closed or the step
/// was handed to someone else.
pub fn can_user_see(
    request: &ApprovalRequest,
    steps: &[ApprovalStep],
    user_id: &str,
    user_department_id: Option<&str>,
) -> bool {
    if request.requester_id == user_id || request.visibility.visible_to_all {
        return true;
    }
    if request.visibility.user_ids.contains(user_id) {
        return true;
    }
    if steps.iter().any(|step| {
        step.approver_id == user_id || step.substituted_for_id.as_deref() == Some(user_id)
    }) {
        return true;
    }

    user_department_id
        .map(|department| {
            let department = department.trim();
            request
                .visibility
                .department_ids
                .iter()
                .any(|candidate| candidate.trim().eq_ignore_ascii_case(department))
        })
        .unwrap_or(false)
}

/// Whether `user_id` holds a pending step at the request's current level.
pub fn can_user_approve(request: &ApprovalRequest, steps: &[ApprovalStep], user_id: &str) -> bool {
    if !request.status.is_in_flight() {
        return false;
    }
    steps.iter().any(|step| {
        step.is_pending() && step.level_number == request.current_level && step.approver_id == user_id
    })
}
