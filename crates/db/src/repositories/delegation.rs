use std::collections::BTreeSet;

use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use opsflow_core::domain::delegation::{Delegation, DelegationId};
use opsflow_core::domain::workflow::WorkflowType;
use opsflow_core::store::{DelegationStore, StoreError};

use super::{decode_error, parse_json, parse_timestamp, to_json, RepositoryError};
use crate::DbPool;

pub struct SqlDelegationStore {
    pool: DbPool,
}

impl SqlDelegationStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn fetch(&self, id: &DelegationId) -> Result<Option<Delegation>, RepositoryError> {
        let row = sqlx::query(
            "SELECT id, delegator_id, delegate_id, workflow_type_scope, start_at, end_at,
                    is_active, reason, created_at, updated_at
             FROM delegation WHERE id = ?",
        )
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_delegation).transpose()
    }

    async fn fetch_for_delegator(&self, delegator_id: &str) -> Result<Vec<Delegation>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, delegator_id, delegate_id, workflow_type_scope, start_at, end_at,
                    is_active, reason, created_at, updated_at
             FROM delegation WHERE delegator_id = ? ORDER BY start_at, id",
        )
        .bind(delegator_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_delegation).collect()
    }

    async fn store(&self, delegation: &Delegation) -> Result<(), RepositoryError> {
        let scope: Vec<&str> =
            delegation.workflow_type_scope.iter().map(WorkflowType::as_str).collect();
        let scope = to_json("workflow_type_scope", &scope)?;

        sqlx::query(
            "INSERT INTO delegation (id, delegator_id, delegate_id, workflow_type_scope, start_at,
                                     end_at, is_active, reason, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                 workflow_type_scope = excluded.workflow_type_scope,
                 start_at = excluded.start_at,
                 end_at = excluded.end_at,
                 is_active = excluded.is_active,
                 reason = excluded.reason,
                 updated_at = excluded.updated_at",
        )
        .bind(&delegation.id.0)
        .bind(&delegation.delegator_id)
        .bind(&delegation.delegate_id)
        .bind(&scope)
        .bind(delegation.start_at.to_rfc3339())
        .bind(delegation.end_at.to_rfc3339())
        .bind(delegation.is_active)
        .bind(&delegation.reason)
        .bind(delegation.created_at.to_rfc3339())
        .bind(delegation.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn row_to_delegation(row: &SqliteRow) -> Result<Delegation, RepositoryError> {
    let id: String = row.try_get("id").map_err(|e| decode_error("id", e))?;
    let delegator_id: String =
        row.try_get("delegator_id").map_err(|e| decode_error("delegator_id", e))?;
    let delegate_id: String =
        row.try_get("delegate_id").map_err(|e| decode_error("delegate_id", e))?;
    let scope: String =
        row.try_get("workflow_type_scope").map_err(|e| decode_error("workflow_type_scope", e))?;
    let start_at: String = row.try_get("start_at").map_err(|e| decode_error("start_at", e))?;
    let end_at: String = row.try_get("end_at").map_err(|e| decode_error("end_at", e))?;
    let is_active: bool = row.try_get("is_active").map_err(|e| decode_error("is_active", e))?;
    let reason: Option<String> = row.try_get("reason").map_err(|e| decode_error("reason", e))?;
    let created_at: String = row.try_get("created_at").map_err(|e| decode_error("created_at", e))?;
    let updated_at: String = row.try_get("updated_at").map_err(|e| decode_error("updated_at", e))?;

    let workflow_type_scope = parse_json::<Vec<String>>("workflow_type_scope", &scope)?
        .iter()
        .map(|value| {
            WorkflowType::parse(value)
                .ok_or_else(|| decode_error("workflow_type_scope", format!("unknown `{value}`")))
        })
        .collect::<Result<BTreeSet<_>, _>>()?;

    Ok(Delegation {
        id: DelegationId(id),
        delegator_id,
        delegate_id,
        workflow_type_scope,
        start_at: parse_timestamp("start_at", &start_at)?,
        end_at: parse_timestamp("end_at", &end_at)?,
        is_active,
        reason,
        created_at: parse_timestamp("created_at", &created_at)?,
        updated_at: parse_timestamp("updated_at", &updated_at)?,
    })
}

#[async_trait::async_trait]
impl DelegationStore for SqlDelegationStore {
    async fn find_delegation(&self, id: &DelegationId) -> Result<Option<Delegation>, StoreError> {
        Ok(self.fetch(id).await?)
    }

    async fn save_delegation(&self, delegation: Delegation) -> Result<(), StoreError> {
        Ok(self.store(&delegation).await?)
    }

    async fn list_for_delegator(&self, delegator_id: &str) -> Result<Vec<Delegation>, StoreError> {
        Ok(self.fetch_for_delegator(delegator_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use chrono::{Duration, Utc};

    use opsflow_core::domain::delegation::{Delegation, DelegationId};
    use opsflow_core::domain::workflow::WorkflowType;
    use opsflow_core::store::DelegationStore;

    use super::SqlDelegationStore;
    use crate::{connect_with_settings, migrations};

    #[tokio::test]
    async fn scoped_delegation_round_trips() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrate");
        let store = SqlDelegationStore::new(pool);

        let now = Utc::now();
        let mut delegation = Delegation {
            id: DelegationId("DLG-1".to_string()),
            delegator_id: "u-ana".to_string(),
            delegate_id: "u-ben".to_string(),
            workflow_type_scope: BTreeSet::from([
                WorkflowType::LeaveRequest,
                WorkflowType::ExpenseClaim,
            ]),
            start_at: now,
            end_at: now + Duration::days(10),
            is_active: true,
            reason: Some("sabbatical".to_string()),
            created_at: now,
            updated_at: now,
        };
        store.save_delegation(delegation.clone()).await.expect("save");

        delegation.is_active = false;
        store.save_delegation(delegation).await.expect("deactivate");

        let listed = store.list_for_delegator("u-ana").await.expect("list");
        assert_eq!(listed.len(), 1);
        assert!(!listed[0].is_active);
        assert!(listed[0].covers(WorkflowType::LeaveRequest));
        assert!(!listed[0].covers(WorkflowType::DesignChange));
    }

    #[tokio::test]
    async fn self_delegation_is_refused_by_schema() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrate");
        let store = SqlDelegationStore::new(pool);

        let now = Utc::now();
        let invalid = Delegation {
            id: DelegationId("DLG-2".to_string()),
            delegator_id: "u-ana".to_string(),
            delegate_id: "u-ana".to_string(),
            workflow_type_scope: BTreeSet::new(),
            start_at: now,
            end_at: now + Duration::days(1),
            is_active: true,
            reason: None,
            created_at: now,
            updated_at: now,
        };
        assert!(store.save_delegation(invalid).await.is_err());
    }
}
