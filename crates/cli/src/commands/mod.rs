pub mod config;
pub mod doctor;
pub mod escalate;
pub mod migrate;
pub mod seed;
pub mod verify_history;

use std::sync::Arc;

use opsflow_core::config::{AppConfig, LoadOptions};
use opsflow_core::directory::InMemoryDirectory;
use opsflow_core::engine::{EngineStores, WorkflowEngine};
use opsflow_core::ledger::HistoryLedger;
use opsflow_db::{
    connect_with_settings, migrations, DbPool, SqlDelegationStore, SqlHistoryStore,
    SqlPolicyStore, SqlRequestStore,
};
use secrecy::ExposeSecret;
use serde::Serialize;
use tokio::runtime::Runtime;

#[derive(Debug, Clone)]
pub struct CommandResult {
    pub exit_code: u8,
    pub output: String,
}

#[derive(Debug, Serialize)]
struct CommandOutcome {
    command: String,
    status: String,
    error_class: Option<String>,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
}

/// `(error_class, message, exit_code)` carried out of a command's async block.
pub(crate) type CommandFailure = (&'static str, String, u8);

impl CommandResult {
    pub fn success(command: &str, message: impl Into<String>) -> Self {
        Self::success_with_details(command, message, None)
    }

    pub fn success_with_details(
        command: &str,
        message: impl Into<String>,
        details: Option<serde_json::Value>,
    ) -> Self {
        let payload = CommandOutcome {
            command: command.to_string(),
            status: "ok".to_string(),
            error_class: None,
            message: message.into(),
            details,
        };
        Self { exit_code: 0, output: serialize_payload(payload) }
    }

    pub fn failure(
        command: &str,
        error_class: &str,
        message: impl Into<String>,
        exit_code: u8,
    ) -> Self {
        Self::failure_with_details(command, error_class, message, exit_code, None)
    }

    pub fn failure_with_details(
        command: &str,
        error_class: &str,
        message: impl Into<String>,
        exit_code: u8,
        details: Option<serde_json::Value>,
    ) -> Self {
        let payload = CommandOutcome {
            command: command.to_string(),
            status: "error".to_string(),
            error_class: Some(error_class.to_string()),
            message: message.into(),
            details,
        };
        Self { exit_code, output: serialize_payload(payload) }
    }

    fn from_failure(command: &str, (error_class, message, exit_code): CommandFailure) -> Self {
        Self::failure(command, error_class, message, exit_code)
    }
}

fn serialize_payload(payload: CommandOutcome) -> String {
    serde_json::to_string(&payload).unwrap_or_else(|error| {
        format!(
            "{{\"command\":\"unknown\",\"status\":\"error\",\"error_class\":\"serialization\",\"message\":\"{}\"}}",
            error.to_string().replace('\\', "\\\\").replace('"', "\\\"")
        )
    })
}

/// Loads config and a current-thread runtime, or the failure every command
/// reports for them (exit codes 2 and 3).
pub(crate) fn prepare(command: &str) -> Result<(AppConfig, Runtime), CommandResult> {
    let config = AppConfig::load(LoadOptions::default()).map_err(|error| {
        CommandResult::failure(
            command,
            "config_validation",
            format!("configuration issue: {error}"),
            2,
        )
    })?;

    let runtime =
        tokio::runtime::Builder::new_current_thread().enable_all().build().map_err(|error| {
            CommandResult::failure(
                command,
                "runtime_init",
                format!("failed to initialize async runtime: {error}"),
                3,
            )
        })?;

    Ok((config, runtime))
}

/// Connects and applies pending migrations (exit codes 4 and 5).
pub(crate) async fn open_pool(config: &AppConfig) -> Result<DbPool, CommandFailure> {
    let pool = connect_with_settings(
        &config.database.url,
        config.database.max_connections,
        config.database.timeout_secs,
    )
    .await
    .map_err(|error| ("db_connectivity", error.to_string(), 4u8))?;

    migrations::run_pending(&pool).await.map_err(|error| ("migration", error.to_string(), 5u8))?;
    Ok(pool)
}

/// Engine over the SQL stores. The CLI has no directory service, so only
/// operations that never resolve approvers are safe to run through it.
pub(crate) fn sql_engine(config: &AppConfig, pool: &DbPool) -> WorkflowEngine {
    WorkflowEngine::new(
        EngineStores {
            policies: Arc::new(SqlPolicyStore::new(pool.clone())),
            requests: Arc::new(SqlRequestStore::new(pool.clone())),
            history: Arc::new(SqlHistoryStore::new(pool.clone())),
            delegations: Arc::new(SqlDelegationStore::new(pool.clone())),
        },
        Arc::new(InMemoryDirectory::default()),
        HistoryLedger::new(config.engine.history_signing_key.expose_secret()),
    )
    .with_administrators(config.engine.administrator_user_ids.iter().cloned())
}
