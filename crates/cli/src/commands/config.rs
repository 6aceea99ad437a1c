use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use opsflow_core::config::{AppConfig, LoadOptions};
use serde_json::{Map, Value as JsonValue};
use toml::Value;

use crate::commands::CommandResult;

/// Every reported key with the environment variables that can set it.
const FIELDS: &[(&str, &[&str])] = &[
    ("database.url", &["OPSFLOW_DATABASE_URL"]),
    ("database.max_connections", &["OPSFLOW_DATABASE_MAX_CONNECTIONS"]),
    ("database.timeout_secs", &["OPSFLOW_DATABASE_TIMEOUT_SECS"]),
    ("engine.history_signing_key", &["OPSFLOW_ENGINE_HISTORY_SIGNING_KEY"]),
    ("engine.administrator_user_ids", &["OPSFLOW_ENGINE_ADMINISTRATORS"]),
    ("engine.escalation_batch_limit", &["OPSFLOW_ENGINE_ESCALATION_BATCH_LIMIT"]),
    ("logging.level", &["OPSFLOW_LOGGING_LEVEL", "OPSFLOW_LOG_LEVEL"]),
    ("logging.format", &["OPSFLOW_LOGGING_FORMAT", "OPSFLOW_LOG_FORMAT"]),
];

pub fn run() -> CommandResult {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => {
            return CommandResult::failure(
                "config",
                "config_validation",
                format!("config validation failed: {error}"),
                2,
            );
        }
    };

    let config_file_path = detect_config_path();
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());

    let mut sources = Map::new();
    for (key_path, env_keys) in FIELDS {
        sources.insert(
            (*key_path).to_string(),
            JsonValue::String(field_source(
                key_path,
                env_keys,
                config_file_doc.as_ref(),
                config_file_path.as_deref(),
            )),
        );
    }

    CommandResult::success_with_details(
        "config",
        "effective config (source precedence: env > file > default)",
        Some(serde_json::json!({
            "values": config.redacted(),
            "sources": sources,
        })),
    )
}

fn detect_config_path() -> Option<PathBuf> {
    [PathBuf::from("opsflow.toml"), PathBuf::from("config/opsflow.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let raw = fs::read_to_string(path?).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_keys: &[&str],
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if let Some(env_key) = env_keys.iter().find(|key| env::var_os(key).is_some()) {
        return format!("env ({env_key})");
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, key_path) {
            let file_path = config_file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}
