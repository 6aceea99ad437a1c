use chrono::{DateTime, Utc};
use tracing::info;

use crate::commands::{open_pool, prepare, sql_engine, CommandFailure, CommandResult};

/// Runs the SLA sweep once. `as_of` replaces the current time, which lets an
/// operator replay a sweep for a past instant.
pub fn run(limit: Option<u32>, as_of: Option<DateTime<Utc>>) -> CommandResult {
    let (config, runtime) = match prepare("escalate") {
        Ok(prepared) => prepared,
        Err(failure) => return failure,
    };

    let limit = limit.unwrap_or(config.engine.escalation_batch_limit);
    if limit == 0 {
        return CommandResult::failure("escalate", "invalid_argument", "--limit must be positive", 2);
    }
    let now = as_of.unwrap_or_else(Utc::now);

    let result = runtime.block_on(async {
        let pool = open_pool(&config).await?;
        let engine = sql_engine(&config, &pool);
        let sweep = engine
            .escalate_overdue(now, limit)
            .await
            .map_err(|error| ("escalation", error.to_string(), 6u8))?;
        pool.close().await;
        Ok::<_, CommandFailure>(sweep)
    });

    let sweep = match result {
        Ok(sweep) => sweep,
        Err(failure) => return CommandResult::from_failure("escalate", failure),
    };

    info!(
        event_name = "cli.escalate.completed",
        escalated = sweep.escalated.len(),
        failed = sweep.failed.len(),
        "escalation sweep finished"
    );

    let details = serde_json::json!({
        "as_of": now.to_rfc3339(),
        "limit": limit,
        "escalated": sweep.escalated.iter().map(|id| id.0.clone()).collect::<Vec<_>>(),
        "failed": sweep
            .failed
            .iter()
            .map(|(id, reason)| serde_json::json!({ "request_id": id.0, "reason": reason }))
            .collect::<Vec<_>>(),
    });

    if sweep.failed.is_empty() {
        CommandResult::success_with_details(
            "escalate",
            format!("escalated {} request(s)", sweep.escalated.len()),
            Some(details),
        )
    } else {
        CommandResult::failure_with_details(
            "escalate",
            "escalation_partial",
            format!(
                "escalated {} request(s); {} check(s) failed",
                sweep.escalated.len(),
                sweep.failed.len()
            ),
            7,
            Some(details),
        )
    }
}
