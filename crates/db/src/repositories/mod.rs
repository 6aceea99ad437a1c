use chrono::{DateTime, Utc};
use thiserror::Error;

use opsflow_core::store::StoreError;

pub mod delegation;
pub mod history;
pub mod request;
pub mod workflow;

pub use delegation::SqlDelegationStore;
pub use history::SqlHistoryStore;
pub use request::SqlRequestStore;
pub use workflow::SqlPolicyStore;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error(transparent)]
    Conflict(StoreError),
}

impl From<RepositoryError> for StoreError {
    fn from(error: RepositoryError) -> Self {
        match error {
            RepositoryError::Database(error) => StoreError::Database(error.to_string()),
            RepositoryError::Decode(message) => StoreError::Decode(message),
            RepositoryError::Conflict(conflict) => conflict,
        }
    }
}

pub(crate) fn decode_error(column: &str, error: impl std::fmt::Display) -> RepositoryError {
    RepositoryError::Decode(format!("{column}: {error}"))
}

pub(crate) fn parse_timestamp(column: &str, value: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(value)
        .map(|timestamp| timestamp.with_timezone(&Utc))
        .map_err(|error| decode_error(column, error))
}

pub(crate) fn parse_optional_timestamp(
    column: &str,
    value: Option<String>,
) -> Result<Option<DateTime<Utc>>, RepositoryError> {
    value.map(|value| parse_timestamp(column, &value)).transpose()
}

pub(crate) fn parse_json<T: serde::de::DeserializeOwned>(
    column: &str,
    value: &str,
) -> Result<T, RepositoryError> {
    serde_json::from_str(value).map_err(|error| decode_error(column, error))
}

pub(crate) fn to_json<T: serde::Serialize>(column: &str, value: &T) -> Result<String, RepositoryError> {
    serde_json::to_string(value).map_err(|error| decode_error(column, error))
}

pub(crate) fn to_u32(column: &str, value: i64) -> Result<u32, RepositoryError> {
    u32::try_from(value).map_err(|error| decode_error(column, error))
}

pub(crate) fn to_u64(column: &str, value: i64) -> Result<u64, RepositoryError> {
    u64::try_from(value).map_err(|error| decode_error(column, error))
}

pub(crate) fn to_i64(column: &str, value: u64) -> Result<i64, RepositoryError> {
    i64::try_from(value).map_err(|error| decode_error(column, error))
}
