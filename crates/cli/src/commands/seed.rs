use opsflow_db::{DemoWorkflows, WorkflowSeedInfo};

use crate::commands::{open_pool, prepare, CommandFailure, CommandResult};

pub fn run() -> CommandResult {
    let (config, runtime) = match prepare("seed") {
        Ok(prepared) => prepared,
        Err(failure) => return failure,
    };

    let result = runtime.block_on(async {
        let pool = open_pool(&config).await?;

        let seeded = DemoWorkflows::load(&pool)
            .await
            .map_err(|error| ("seed_execution", error.to_string(), 6u8))?;
        let verification = DemoWorkflows::verify(&pool)
            .await
            .map_err(|error| ("seed_verification", error.to_string(), 6u8))?;
        pool.close().await;

        if verification.all_present {
            Ok(seeded.workflows_seeded)
        } else {
            let failed_checks = verification
                .checks
                .iter()
                .filter_map(|(check, passed)| (!passed).then_some(*check))
                .collect::<Vec<_>>();
            Err::<_, CommandFailure>(("seed_verification", verification_message(&failed_checks), 6u8))
        }
    });

    match result {
        Ok(workflows) => CommandResult::success("seed", summary(&workflows)),
        Err(failure) => CommandResult::from_failure("seed", failure),
    }
}

fn summary(workflows: &[WorkflowSeedInfo]) -> String {
    let lines = workflows
        .iter()
        .map(|info| format!("  - {}: {} ({})", info.workflow_type, info.workflow_id, info.description))
        .collect::<Vec<_>>();
    format!("demo workflows seeded:\n{}", lines.join("\n"))
}

fn verification_message(failed_checks: &[&str]) -> String {
    if failed_checks.is_empty() {
        "Some demo workflows failed to load".to_string()
    } else {
        format!("Seed verification failed for workflows: {}", failed_checks.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use opsflow_db::WorkflowSeedInfo;

    use super::{summary, verification_message};

    #[test]
    fn verification_message_names_failed_workflows() {
        assert_eq!(
            verification_message(&["wf-design-change", "wf-leave-request"]),
            "Seed verification failed for workflows: wf-design-change, wf-leave-request"
        );
    }

    #[test]
    fn verification_message_falls_back_when_no_labels() {
        assert_eq!(verification_message(&[]), "Some demo workflows failed to load");
    }

    #[test]
    fn summary_lists_one_line_per_workflow() {
        let message = summary(&[WorkflowSeedInfo {
            workflow_id: "wf-leave-request",
            workflow_type: "LEAVE_REQUEST",
            description: "Line manager approval",
        }]);
        assert_eq!(
            message,
            "demo workflows seeded:\n  - LEAVE_REQUEST: wf-leave-request (Line manager approval)"
        );
    }
}
