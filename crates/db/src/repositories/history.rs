use std::collections::BTreeMap;

use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use opsflow_core::domain::history::{ApprovalHistory, HistoryAction, HistoryId};
use opsflow_core::domain::request::RequestId;
use opsflow_core::domain::step::StepId;
use opsflow_core::store::{HistoryStore, StoreError};

use super::{decode_error, parse_json, parse_timestamp, to_i64, to_json, to_u64, RepositoryError};
use crate::DbPool;

const HISTORY_COLUMNS: &str = "id, request_id, sequence, step_id, action, actor_id, timestamp,
     comments, metadata, is_internal, prev_hash, entry_hash, signature";

/// Insert-only access to `approval_history`. The schema refuses updates and
/// deletes, and `(request_id, sequence)` is unique.
pub struct SqlHistoryStore {
    pool: DbPool,
}

impl SqlHistoryStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn insert(&self, entry: &ApprovalHistory) -> Result<(), RepositoryError> {
        let metadata = to_json("metadata", &entry.metadata)?;
        sqlx::query(
            "INSERT INTO approval_history (id, request_id, sequence, step_id, action, actor_id,
                 timestamp, comments, metadata, is_internal, prev_hash, entry_hash, signature)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&entry.id.0)
        .bind(&entry.request_id.0)
        .bind(to_i64("sequence", entry.sequence)?)
        .bind(entry.step_id.as_ref().map(|id| id.0.clone()))
        .bind(entry.action.as_str())
        .bind(&entry.actor_id)
        .bind(entry.timestamp.to_rfc3339())
        .bind(&entry.comments)
        .bind(&metadata)
        .bind(entry.is_internal)
        .bind(&entry.prev_hash)
        .bind(&entry.entry_hash)
        .bind(&entry.signature)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fetch_latest(
        &self,
        request_id: &RequestId,
    ) -> Result<Option<ApprovalHistory>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {HISTORY_COLUMNS} FROM approval_history
             WHERE request_id = ? ORDER BY sequence DESC LIMIT 1"
        ))
        .bind(&request_id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_history).transpose()
    }

    async fn fetch_all(&self, request_id: &RequestId) -> Result<Vec<ApprovalHistory>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {HISTORY_COLUMNS} FROM approval_history
             WHERE request_id = ? ORDER BY sequence"
        ))
        .bind(&request_id.0)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_history).collect()
    }
}

fn row_to_history(row: &SqliteRow) -> Result<ApprovalHistory, RepositoryError> {
    let id: String = row.try_get("id").map_err(|e| decode_error("id", e))?;
    let request_id: String =
        row.try_get("request_id").map_err(|e| decode_error("request_id", e))?;
    let sequence: i64 = row.try_get("sequence").map_err(|e| decode_error("sequence", e))?;
    let step_id: Option<String> = row.try_get("step_id").map_err(|e| decode_error("step_id", e))?;
    let action: String = row.try_get("action").map_err(|e| decode_error("action", e))?;
    let actor_id: String = row.try_get("actor_id").map_err(|e| decode_error("actor_id", e))?;
    let timestamp: String = row.try_get("timestamp").map_err(|e| decode_error("timestamp", e))?;
    let comments: Option<String> = row.try_get("comments").map_err(|e| decode_error("comments", e))?;
    let metadata: String = row.try_get("metadata").map_err(|e| decode_error("metadata", e))?;
    let is_internal: bool =
        row.try_get("is_internal").map_err(|e| decode_error("is_internal", e))?;
    let prev_hash: Option<String> =
        row.try_get("prev_hash").map_err(|e| decode_error("prev_hash", e))?;
    let entry_hash: String = row.try_get("entry_hash").map_err(|e| decode_error("entry_hash", e))?;
    let signature: String = row.try_get("signature").map_err(|e| decode_error("signature", e))?;

    Ok(ApprovalHistory {
        id: HistoryId(id),
        request_id: RequestId(request_id),
        sequence: to_u64("sequence", sequence)?,
        step_id: step_id.map(StepId),
        action: HistoryAction::parse(&action)
            .ok_or_else(|| decode_error("action", format!("unknown `{action}`")))?,
        actor_id,
        timestamp: parse_timestamp("timestamp", &timestamp)?,
        comments,
        metadata: parse_json::<BTreeMap<String, String>>("metadata", &metadata)?,
        is_internal,
        prev_hash,
        entry_hash,
        signature,
    })
}

#[async_trait::async_trait]
impl HistoryStore for SqlHistoryStore {
    async fn append(&self, entry: ApprovalHistory) -> Result<(), StoreError> {
        Ok(self.insert(&entry).await?)
    }

    async fn latest(&self, request_id: &RequestId) -> Result<Option<ApprovalHistory>, StoreError> {
        Ok(self.fetch_latest(request_id).await?)
    }

    async fn list(&self, request_id: &RequestId) -> Result<Vec<ApprovalHistory>, StoreError> {
        Ok(self.fetch_all(request_id).await?)
    }
}
