use opsflow_core::domain::request::RequestId;
use opsflow_core::errors::{ApplicationError, DomainError};

use crate::commands::{open_pool, prepare, sql_engine, CommandFailure, CommandResult};

pub fn run(request_id: &str) -> CommandResult {
    let (config, runtime) = match prepare("verify-history") {
        Ok(prepared) => prepared,
        Err(failure) => return failure,
    };
    let request_id = RequestId(request_id.trim().to_string());

    let result = runtime.block_on(async {
        let pool = open_pool(&config).await?;
        let engine = sql_engine(&config, &pool);

        engine.get_request(&request_id).await.map_err(|error| match error {
            ApplicationError::Domain(DomainError::NotFound { .. }) => {
                ("not_found", error.to_string(), 6u8)
            }
            other => ("persistence", other.to_string(), 4u8),
        })?;
        let verification = engine
            .verify_history(&request_id)
            .await
            .map_err(|error| ("persistence", error.to_string(), 4u8))?;
        pool.close().await;
        Ok::<_, CommandFailure>(verification)
    });

    let verification = match result {
        Ok(verification) => verification,
        Err(failure) => return CommandResult::from_failure("verify-history", failure),
    };

    let details = serde_json::json!({
        "request_id": verification.request_id.0,
        "verified_entries": verification.verified_entries,
        "latest_hash": verification.latest_hash,
        "failure_reason": verification.failure_reason,
    });

    if verification.valid {
        CommandResult::success_with_details(
            "verify-history",
            format!("history chain intact ({} entries)", verification.verified_entries),
            Some(details),
        )
    } else {
        CommandResult::failure_with_details(
            "verify-history",
            "history_tampered",
            verification
                .failure_reason
                .clone()
                .unwrap_or_else(|| "history chain failed verification".to_string()),
            7,
            Some(details),
        )
    }
}
