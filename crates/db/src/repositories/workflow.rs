use std::collections::HashMap;

use sqlx::Row;

use opsflow_core::conditions::Condition;
use opsflow_core::domain::workflow::{
    ApprovalMode, ApproverSelector, Level, LevelId, Workflow, WorkflowId, WorkflowType,
};
use opsflow_core::store::{PolicyStore, StoreError};

use super::{decode_error, parse_json, parse_timestamp, to_json, to_u32, RepositoryError};
use crate::DbPool;

pub struct SqlPolicyStore {
    pool: DbPool,
}

impl SqlPolicyStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn fetch(&self, id: &WorkflowId) -> Result<Option<Workflow>, RepositoryError> {
        let row = sqlx::query(
            "SELECT id, workflow_type, name, description, is_active, requires_all_levels,
                    auto_approve_conditions, created_at, updated_at
             FROM workflow WHERE id = ?",
        )
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let levels = self.fetch_levels(Some(id)).await?.remove(&id.0).unwrap_or_default();
        Ok(Some(row_to_workflow(&row, levels)?))
    }

    async fn fetch_all(&self) -> Result<Vec<Workflow>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, workflow_type, name, description, is_active, requires_all_levels,
                    auto_approve_conditions, created_at, updated_at
             FROM workflow ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut levels = self.fetch_levels(None).await?;
        rows.iter()
            .map(|row| {
                let id: String = row.try_get("id").map_err(|e| decode_error("id", e))?;
                row_to_workflow(row, levels.remove(&id).unwrap_or_default())
            })
            .collect()
    }

    async fn fetch_levels(
        &self,
        workflow_id: Option<&WorkflowId>,
    ) -> Result<HashMap<String, Vec<Level>>, RepositoryError> {
        let rows = match workflow_id {
            Some(id) => {
                sqlx::query(
                    "SELECT id, workflow_id, level_number, name, approval_mode, approver_selectors,
                            skip_if_requester_is_approver, required_conditions, sla_hours
                     FROM workflow_level WHERE workflow_id = ? ORDER BY level_number",
                )
                .bind(&id.0)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT id, workflow_id, level_number, name, approval_mode, approver_selectors,
                            skip_if_requester_is_approver, required_conditions, sla_hours
                     FROM workflow_level ORDER BY workflow_id, level_number",
                )
                .fetch_all(&self.pool)
                .await?
            }
        };

        let mut grouped: HashMap<String, Vec<Level>> = HashMap::new();
        for row in &rows {
            let level = row_to_level(row)?;
            grouped.entry(level.workflow_id.0.clone()).or_default().push(level);
        }
        Ok(grouped)
    }

    async fn store(&self, workflow: &Workflow) -> Result<(), RepositoryError> {
        workflow.validate_levels().map_err(RepositoryError::Decode)?;
        let auto_approve = workflow
            .auto_approve_conditions
            .as_ref()
            .map(|condition| to_json("auto_approve_conditions", condition))
            .transpose()?;

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO workflow (id, workflow_type, name, description, is_active,
                                   requires_all_levels, auto_approve_conditions, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                 workflow_type = excluded.workflow_type,
                 name = excluded.name,
                 description = excluded.description,
                 is_active = excluded.is_active,
                 requires_all_levels = excluded.requires_all_levels,
                 auto_approve_conditions = excluded.auto_approve_conditions,
                 updated_at = excluded.updated_at",
        )
        .bind(&workflow.id.0)
        .bind(workflow.workflow_type.as_str())
        .bind(&workflow.name)
        .bind(&workflow.description)
        .bind(workflow.is_active)
        .bind(workflow.requires_all_levels)
        .bind(&auto_approve)
        .bind(workflow.created_at.to_rfc3339())
        .bind(workflow.updated_at.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM workflow_level WHERE workflow_id = ?")
            .bind(&workflow.id.0)
            .execute(&mut *tx)
            .await?;

        for level in &workflow.levels {
            let selectors = to_json("approver_selectors", &level.approver_selectors)?;
            let conditions = level
                .required_conditions
                .as_ref()
                .map(|condition| to_json("required_conditions", condition))
                .transpose()?;
            sqlx::query(
                "INSERT INTO workflow_level (id, workflow_id, level_number, name, approval_mode,
                                             approver_selectors, skip_if_requester_is_approver,
                                             required_conditions, sla_hours)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&level.id.0)
            .bind(&workflow.id.0)
            .bind(i64::from(level.level_number))
            .bind(&level.name)
            .bind(level.approval_mode.as_str())
            .bind(&selectors)
            .bind(level.skip_if_requester_is_approver)
            .bind(&conditions)
            .bind(level.sla_hours.map(i64::from))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

fn row_to_workflow(
    row: &sqlx::sqlite::SqliteRow,
    levels: Vec<Level>,
) -> Result<Workflow, RepositoryError> {
    let id: String = row.try_get("id").map_err(|e| decode_error("id", e))?;
    let workflow_type: String =
        row.try_get("workflow_type").map_err(|e| decode_error("workflow_type", e))?;
    let name: String = row.try_get("name").map_err(|e| decode_error("name", e))?;
    let description: String =
        row.try_get("description").map_err(|e| decode_error("description", e))?;
    let is_active: bool = row.try_get("is_active").map_err(|e| decode_error("is_active", e))?;
    let requires_all_levels: bool = row
        .try_get("requires_all_levels")
        .map_err(|e| decode_error("requires_all_levels", e))?;
    let auto_approve: Option<String> = row
        .try_get("auto_approve_conditions")
        .map_err(|e| decode_error("auto_approve_conditions", e))?;
    let created_at: String = row.try_get("created_at").map_err(|e| decode_error("created_at", e))?;
    let updated_at: String = row.try_get("updated_at").map_err(|e| decode_error("updated_at", e))?;

    Ok(Workflow {
        id: WorkflowId(id),
        workflow_type: WorkflowType::parse(&workflow_type)
            .ok_or_else(|| decode_error("workflow_type", format!("unknown `{workflow_type}`")))?,
        name,
        description,
        is_active,
        requires_all_levels,
        auto_approve_conditions: auto_approve
            .map(|raw| parse_json::<Condition>("auto_approve_conditions", &raw))
            .transpose()?,
        levels,
        created_at: parse_timestamp("created_at", &created_at)?,
        updated_at: parse_timestamp("updated_at", &updated_at)?,
    })
}

fn row_to_level(row: &sqlx::sqlite::SqliteRow) -> Result<Level, RepositoryError> {
    let id: String = row.try_get("id").map_err(|e| decode_error("id", e))?;
    let workflow_id: String =
        row.try_get("workflow_id").map_err(|e| decode_error("workflow_id", e))?;
    let level_number: i64 =
        row.try_get("level_number").map_err(|e| decode_error("level_number", e))?;
    let name: String = row.try_get("name").map_err(|e| decode_error("name", e))?;
    let mode: String = row.try_get("approval_mode").map_err(|e| decode_error("approval_mode", e))?;
    let selectors: String =
        row.try_get("approver_selectors").map_err(|e| decode_error("approver_selectors", e))?;
    let skip_requester: bool = row
        .try_get("skip_if_requester_is_approver")
        .map_err(|e| decode_error("skip_if_requester_is_approver", e))?;
    let conditions: Option<String> =
        row.try_get("required_conditions").map_err(|e| decode_error("required_conditions", e))?;
    let sla_hours: Option<i64> = row.try_get("sla_hours").map_err(|e| decode_error("sla_hours", e))?;

    Ok(Level {
        id: LevelId(id),
        workflow_id: WorkflowId(workflow_id),
        level_number: to_u32("level_number", level_number)?,
        name,
        approval_mode: ApprovalMode::parse(&mode)
            .ok_or_else(|| decode_error("approval_mode", format!("unknown `{mode}`")))?,
        approver_selectors: parse_json::<Vec<ApproverSelector>>("approver_selectors", &selectors)?,
        skip_if_requester_is_approver: skip_requester,
        required_conditions: conditions
            .map(|raw| parse_json::<Condition>("required_conditions", &raw))
            .transpose()?,
        sla_hours: sla_hours.map(|hours| to_u32("sla_hours", hours)).transpose()?,
    })
}

#[async_trait::async_trait]
impl PolicyStore for SqlPolicyStore {
    async fn find_workflow(&self, id: &WorkflowId) -> Result<Option<Workflow>, StoreError> {
        Ok(self.fetch(id).await?)
    }

    async fn save_workflow(&self, workflow: Workflow) -> Result<(), StoreError> {
        Ok(self.store(&workflow).await?)
    }

    async fn list_workflows(&self) -> Result<Vec<Workflow>, StoreError> {
        Ok(self.fetch_all().await?)
    }
}
