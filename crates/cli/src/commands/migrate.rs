use opsflow_db::migrations;

use crate::commands::{open_pool, prepare, CommandFailure, CommandResult};

pub fn run() -> CommandResult {
    let (config, runtime) = match prepare("migrate") {
        Ok(prepared) => prepared,
        Err(failure) => return failure,
    };

    let result = runtime.block_on(async {
        let pool = open_pool(&config).await?;
        let applied = migrations::applied_versions(&pool)
            .await
            .map_err(|error| ("migration", error.to_string(), 5u8))?;
        pool.close().await;
        Ok::<_, CommandFailure>(applied)
    });

    match result {
        Ok(applied) => CommandResult::success_with_details(
            "migrate",
            "applied pending migrations",
            Some(serde_json::json!({ "applied_versions": applied })),
        ),
        Err(failure) => CommandResult::from_failure("migrate", failure),
    }
}
