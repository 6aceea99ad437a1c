use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, Transaction};

use opsflow_core::domain::request::{
    ApprovalRequest, Priority, RequestId, RequestStatus, SubjectRef, Visibility,
};
use opsflow_core::domain::step::{ApprovalStep, StepId, StepStatus};
use opsflow_core::domain::workflow::{LevelId, WorkflowId, WorkflowType};
use opsflow_core::store::{RequestCommit, RequestStore, StoreError};

use super::{
    decode_error, parse_json, parse_optional_timestamp, parse_timestamp, to_i64, to_json, to_u32,
    to_u64, RepositoryError,
};
use crate::DbPool;

const REQUEST_COLUMNS: &str = "id, workflow_id, workflow_type, title, description, requester_id,
     status, current_level, level_activated_at, submitted_at, completed_at, due_at, visibility,
     priority, subject_type, subject_id, metadata, version, created_at, updated_at";

const STEP_COLUMNS: &str = "id, request_id, level_id, level_number, approver_id, status,
     approved_at, rejected_at, delegated_at, comments, delegated_to_id, delegated_from_step_id,
     substituted_for_id, created_at";

const ESCALATABLE: &str = "('SUBMITTED', 'IN_PROGRESS')";

pub struct SqlRequestStore {
    pool: DbPool,
}

impl SqlRequestStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn fetch_request(&self, id: &RequestId) -> Result<Option<ApprovalRequest>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {REQUEST_COLUMNS} FROM approval_request WHERE id = ?"))
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_request).transpose()
    }

    async fn fetch_step(&self, id: &StepId) -> Result<Option<ApprovalStep>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {STEP_COLUMNS} FROM approval_step WHERE id = ?"))
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_step).transpose()
    }

    async fn fetch_steps(&self, request_id: &RequestId) -> Result<Vec<ApprovalStep>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {STEP_COLUMNS} FROM approval_step WHERE request_id = ?
             ORDER BY level_number, created_at, id"
        ))
        .bind(&request_id.0)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_step).collect()
    }

    async fn fetch_pending_for(&self, approver_id: &str) -> Result<Vec<ApprovalStep>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {STEP_COLUMNS} FROM approval_step
             WHERE approver_id = ? AND status = 'PENDING'
             ORDER BY created_at, id"
        ))
        .bind(approver_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_step).collect()
    }

    async fn fetch_escalation_candidates(
        &self,
        before: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<ApprovalRequest>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {REQUEST_COLUMNS} FROM approval_request
             WHERE status IN {ESCALATABLE}
               AND level_activated_at IS NOT NULL
               AND level_activated_at < ?
             ORDER BY level_activated_at, id
             LIMIT ?"
        ))
        .bind(before.to_rfc3339())
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_request).collect()
    }

    /// One transaction: version-checked request write, step inserts, and
    /// compare-and-set step updates. Any conflict rolls the whole commit back.
    async fn apply(&self, commit: RequestCommit) -> Result<(), RepositoryError> {
        let mut tx = self.pool.begin().await?;

        write_request(&mut tx, &commit.request, commit.expected_version).await?;
        for step in &commit.inserted_steps {
            insert_step(&mut tx, step).await?;
        }
        for step in &commit.updated_steps {
            update_pending_step(&mut tx, step).await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

async fn write_request(
    tx: &mut Transaction<'_, Sqlite>,
    request: &ApprovalRequest,
    expected_version: Option<u64>,
) -> Result<(), RepositoryError> {
    let visibility = to_json("visibility", &request.visibility)?;
    let metadata = to_json("metadata", &request.metadata)?;
    let version = to_i64("version", request.version)?;
    let subject_type = request.subject.as_ref().map(|subject| subject.subject_type.clone());
    let subject_id = request.subject.as_ref().map(|subject| subject.subject_id.clone());

    let result = match expected_version {
        None => {
            sqlx::query(
                "INSERT INTO approval_request (id, workflow_id, workflow_type, title, description,
                     requester_id, status, current_level, level_activated_at, submitted_at,
                     completed_at, due_at, visibility, priority, subject_type, subject_id,
                     metadata, version, created_at, updated_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(id) DO NOTHING",
            )
            .bind(&request.id.0)
            .bind(&request.workflow_id.0)
            .bind(request.workflow_type.as_str())
            .bind(&request.title)
            .bind(&request.description)
            .bind(&request.requester_id)
            .bind(request.status.as_str())
            .bind(i64::from(request.current_level))
            .bind(request.level_activated_at.map(|at| at.to_rfc3339()))
            .bind(request.submitted_at.map(|at| at.to_rfc3339()))
            .bind(request.completed_at.map(|at| at.to_rfc3339()))
            .bind(request.due_at.map(|at| at.to_rfc3339()))
            .bind(&visibility)
            .bind(request.priority.as_str())
            .bind(&subject_type)
            .bind(&subject_id)
            .bind(&metadata)
            .bind(version)
            .bind(request.created_at.to_rfc3339())
            .bind(request.updated_at.to_rfc3339())
            .execute(&mut **tx)
            .await?
        }
        Some(expected) => {
            sqlx::query(
                "UPDATE approval_request SET
                     title = ?, description = ?, status = ?, current_level = ?,
                     level_activated_at = ?, submitted_at = ?, completed_at = ?, due_at = ?,
                     visibility = ?, priority = ?, subject_type = ?, subject_id = ?,
                     metadata = ?, version = ?, updated_at = ?
                 WHERE id = ? AND version = ?",
            )
            .bind(&request.title)
            .bind(&request.description)
            .bind(request.status.as_str())
            .bind(i64::from(request.current_level))
            .bind(request.level_activated_at.map(|at| at.to_rfc3339()))
            .bind(request.submitted_at.map(|at| at.to_rfc3339()))
            .bind(request.completed_at.map(|at| at.to_rfc3339()))
            .bind(request.due_at.map(|at| at.to_rfc3339()))
            .bind(&visibility)
            .bind(request.priority.as_str())
            .bind(&subject_type)
            .bind(&subject_id)
            .bind(&metadata)
            .bind(version)
            .bind(request.updated_at.to_rfc3339())
            .bind(&request.id.0)
            .bind(to_i64("version", expected)?)
            .execute(&mut **tx)
            .await?
        }
    };

    if result.rows_affected() == 1 {
        Ok(())
    } else {
        Err(RepositoryError::Conflict(StoreError::VersionConflict {
            request_id: request.id.0.clone(),
            expected_version: expected_version.unwrap_or_default(),
        }))
    }
}

async fn insert_step(
    tx: &mut Transaction<'_, Sqlite>,
    step: &ApprovalStep,
) -> Result<(), RepositoryError> {
    let result = sqlx::query(
        "INSERT INTO approval_step (id, request_id, level_id, level_number, approver_id, status,
             approved_at, rejected_at, delegated_at, comments, delegated_to_id,
             delegated_from_step_id, substituted_for_id, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(id) DO NOTHING",
    )
    .bind(&step.id.0)
    .bind(&step.request_id.0)
    .bind(&step.level_id.0)
    .bind(i64::from(step.level_number))
    .bind(&step.approver_id)
    .bind(step.status.as_str())
    .bind(step.approved_at.map(|at| at.to_rfc3339()))
    .bind(step.rejected_at.map(|at| at.to_rfc3339()))
    .bind(step.delegated_at.map(|at| at.to_rfc3339()))
    .bind(&step.comments)
    .bind(&step.delegated_to_id)
    .bind(step.delegated_from_step_id.as_ref().map(|id| id.0.clone()))
    .bind(&step.substituted_for_id)
    .bind(step.created_at.to_rfc3339())
    .execute(&mut **tx)
    .await?;

    if result.rows_affected() == 1 {
        Ok(())
    } else {
        Err(RepositoryError::Conflict(StoreError::StepConflict { step_id: step.id.0.clone() }))
    }
}

async fn update_pending_step(
    tx: &mut Transaction<'_, Sqlite>,
    step: &ApprovalStep,
) -> Result<(), RepositoryError> {
    let result = sqlx::query(
        "UPDATE approval_step SET
             status = ?, approved_at = ?, rejected_at = ?, delegated_at = ?, comments = ?,
             delegated_to_id = ?
         WHERE id = ? AND status = 'PENDING'",
    )
    .bind(step.status.as_str())
    .bind(step.approved_at.map(|at| at.to_rfc3339()))
    .bind(step.rejected_at.map(|at| at.to_rfc3339()))
    .bind(step.delegated_at.map(|at| at.to_rfc3339()))
    .bind(&step.comments)
    .bind(&step.delegated_to_id)
    .bind(&step.id.0)
    .execute(&mut **tx)
    .await?;

    if result.rows_affected() == 1 {
        Ok(())
    } else {
        Err(RepositoryError::Conflict(StoreError::StepConflict { step_id: step.id.0.clone() }))
    }
}

fn row_to_request(row: &SqliteRow) -> Result<ApprovalRequest, RepositoryError> {
    let id: String = row.try_get("id").map_err(|e| decode_error("id", e))?;
    let workflow_id: String =
        row.try_get("workflow_id").map_err(|e| decode_error("workflow_id", e))?;
    let workflow_type: String =
        row.try_get("workflow_type").map_err(|e| decode_error("workflow_type", e))?;
    let title: String = row.try_get("title").map_err(|e| decode_error("title", e))?;
    let description: String =
        row.try_get("description").map_err(|e| decode_error("description", e))?;
    let requester_id: String =
        row.try_get("requester_id").map_err(|e| decode_error("requester_id", e))?;
    let status: String = row.try_get("status").map_err(|e| decode_error("status", e))?;
    let current_level: i64 =
        row.try_get("current_level").map_err(|e| decode_error("current_level", e))?;
    let level_activated_at: Option<String> =
        row.try_get("level_activated_at").map_err(|e| decode_error("level_activated_at", e))?;
    let submitted_at: Option<String> =
        row.try_get("submitted_at").map_err(|e| decode_error("submitted_at", e))?;
    let completed_at: Option<String> =
        row.try_get("completed_at").map_err(|e| decode_error("completed_at", e))?;
    let due_at: Option<String> = row.try_get("due_at").map_err(|e| decode_error("due_at", e))?;
    let visibility: String = row.try_get("visibility").map_err(|e| decode_error("visibility", e))?;
    let priority: String = row.try_get("priority").map_err(|e| decode_error("priority", e))?;
    let subject_type: Option<String> =
        row.try_get("subject_type").map_err(|e| decode_error("subject_type", e))?;
    let subject_id: Option<String> =
        row.try_get("subject_id").map_err(|e| decode_error("subject_id", e))?;
    let metadata: String = row.try_get("metadata").map_err(|e| decode_error("metadata", e))?;
    let version: i64 = row.try_get("version").map_err(|e| decode_error("version", e))?;
    let created_at: String = row.try_get("created_at").map_err(|e| decode_error("created_at", e))?;
    let updated_at: String = row.try_get("updated_at").map_err(|e| decode_error("updated_at", e))?;

    let subject = match (subject_type, subject_id) {
        (Some(subject_type), Some(subject_id)) => Some(SubjectRef { subject_type, subject_id }),
        _ => None,
    };

    Ok(ApprovalRequest {
        id: RequestId(id),
        workflow_id: WorkflowId(workflow_id),
        workflow_type: WorkflowType::parse(&workflow_type)
            .ok_or_else(|| decode_error("workflow_type", format!("unknown `{workflow_type}`")))?,
        title,
        description,
        requester_id,
        status: RequestStatus::parse(&status)
            .ok_or_else(|| decode_error("status", format!("unknown `{status}`")))?,
        current_level: to_u32("current_level", current_level)?,
        level_activated_at: parse_optional_timestamp("level_activated_at", level_activated_at)?,
        submitted_at: parse_optional_timestamp("submitted_at", submitted_at)?,
        completed_at: parse_optional_timestamp("completed_at", completed_at)?,
        due_at: parse_optional_timestamp("due_at", due_at)?,
        visibility: parse_json::<Visibility>("visibility", &visibility)?,
        priority: Priority::parse(&priority)
            .ok_or_else(|| decode_error("priority", format!("unknown `{priority}`")))?,
        subject,
        metadata: parse_json::<serde_json::Value>("metadata", &metadata)?,
        version: to_u64("version", version)?,
        created_at: parse_timestamp("created_at", &created_at)?,
        updated_at: parse_timestamp("updated_at", &updated_at)?,
    })
}

fn row_to_step(row: &SqliteRow) -> Result<ApprovalStep, RepositoryError> {
    let id: String = row.try_get("id").map_err(|e| decode_error("id", e))?;
    let request_id: String =
        row.try_get("request_id").map_err(|e| decode_error("request_id", e))?;
    let level_id: String = row.try_get("level_id").map_err(|e| decode_error("level_id", e))?;
    let level_number: i64 =
        row.try_get("level_number").map_err(|e| decode_error("level_number", e))?;
    let approver_id: String =
        row.try_get("approver_id").map_err(|e| decode_error("approver_id", e))?;
    let status: String = row.try_get("status").map_err(|e| decode_error("status", e))?;
    let approved_at: Option<String> =
        row.try_get("approved_at").map_err(|e| decode_error("approved_at", e))?;
    let rejected_at: Option<String> =
        row.try_get("rejected_at").map_err(|e| decode_error("rejected_at", e))?;
    let delegated_at: Option<String> =
        row.try_get("delegated_at").map_err(|e| decode_error("delegated_at", e))?;
    let comments: Option<String> = row.try_get("comments").map_err(|e| decode_error("comments", e))?;
    let delegated_to_id: Option<String> =
        row.try_get("delegated_to_id").map_err(|e| decode_error("delegated_to_id", e))?;
    let delegated_from_step_id: Option<String> = row
        .try_get("delegated_from_step_id")
        .map_err(|e| decode_error("delegated_from_step_id", e))?;
    let substituted_for_id: Option<String> =
        row.try_get("substituted_for_id").map_err(|e| decode_error("substituted_for_id", e))?;
    let created_at: String = row.try_get("created_at").map_err(|e| decode_error("created_at", e))?;

    Ok(ApprovalStep {
        id: StepId(id),
        request_id: RequestId(request_id),
        level_id: LevelId(level_id),
        level_number: to_u32("level_number", level_number)?,
        approver_id,
        status: StepStatus::parse(&status)
            .ok_or_else(|| decode_error("status", format!("unknown `{status}`")))?,
        approved_at: parse_optional_timestamp("approved_at", approved_at)?,
        rejected_at: parse_optional_timestamp("rejected_at", rejected_at)?,
        delegated_at: parse_optional_timestamp("delegated_at", delegated_at)?,
        comments,
        delegated_to_id,
        delegated_from_step_id: delegated_from_step_id.map(StepId),
        substituted_for_id,
        created_at: parse_timestamp("created_at", &created_at)?,
    })
}

#[async_trait::async_trait]
impl RequestStore for SqlRequestStore {
    async fn find_request(&self, id: &RequestId) -> Result<Option<ApprovalRequest>, StoreError> {
        Ok(self.fetch_request(id).await?)
    }

    async fn find_step(&self, id: &StepId) -> Result<Option<ApprovalStep>, StoreError> {
        Ok(self.fetch_step(id).await?)
    }

    async fn list_steps(&self, request_id: &RequestId) -> Result<Vec<ApprovalStep>, StoreError> {
        Ok(self.fetch_steps(request_id).await?)
    }

    async fn list_pending_steps_for(
        &self,
        approver_id: &str,
    ) -> Result<Vec<ApprovalStep>, StoreError> {
        Ok(self.fetch_pending_for(approver_id).await?)
    }

    async fn list_escalation_candidates(
        &self,
        before: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<ApprovalRequest>, StoreError> {
        Ok(self.fetch_escalation_candidates(before, limit).await?)
    }

    async fn commit(&self, commit: RequestCommit) -> Result<(), StoreError> {
        Ok(self.apply(commit).await?)
    }
}
