use sqlx::migrate::{MigrateError, Migrator};

use crate::DbPool;

pub static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

pub async fn run_pending(pool: &DbPool) -> Result<(), MigrateError> {
    MIGRATOR.run(pool).await
}

/// Up-migration versions embedded in this build, ascending.
pub fn known_versions() -> Vec<i64> {
    MIGRATOR
        .iter()
        .filter(|migration| !migration.migration_type.is_down_migration())
        .map(|migration| migration.version)
        .collect()
}

/// Versions the database has successfully applied. Fails when the schema has
/// never been migrated.
pub async fn applied_versions(pool: &DbPool) -> Result<Vec<i64>, sqlx::Error> {
    sqlx::query_scalar("SELECT version FROM _sqlx_migrations WHERE success = 1 ORDER BY version")
        .fetch_all(pool)
        .await
}

#[cfg(test)]
mod tests {
    use sqlx::Row;

    use super::{applied_versions, known_versions, run_pending};
    use crate::{connect_with_settings, migrations::MIGRATOR};

    const MANAGED_SCHEMA_OBJECTS: &[&str] = &[
        "workflow",
        "workflow_level",
        "approval_request",
        "approval_step",
        "approval_history",
        "delegation",
        "idx_workflow_level_workflow_id",
        "idx_approval_request_status",
        "idx_approval_request_requester_id",
        "idx_approval_request_level_activated_at",
        "idx_approval_step_request_id",
        "idx_approval_step_approver_status",
        "idx_approval_history_request_id",
        "idx_delegation_delegator_id",
    ];

    async fn table_count(pool: &sqlx::SqlitePool, name: &str) -> i64 {
        sqlx::query(
            "SELECT COUNT(*) AS count FROM sqlite_master WHERE type = 'table' AND name = ?",
        )
        .bind(name)
        .fetch_one(pool)
        .await
        .expect("check table")
        .get::<i64, _>("count")
    }

    #[tokio::test]
    async fn migrations_create_baseline_tables() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        run_pending(&pool).await.expect("run migrations");

        for table in [
            "workflow",
            "workflow_level",
            "approval_request",
            "approval_step",
            "approval_history",
            "delegation",
        ] {
            assert_eq!(table_count(&pool, table).await, 1, "missing table {table}");
        }
    }

    #[tokio::test]
    async fn history_rows_cannot_be_rewritten() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        run_pending(&pool).await.expect("run migrations");

        sqlx::query(
            "INSERT INTO workflow (id, workflow_type, name, created_at, updated_at)
             VALUES ('wf-1', 'CUSTOM', 'Custom', '2026-01-01T00:00:00+00:00', '2026-01-01T00:00:00+00:00')",
        )
        .execute(&pool)
        .await
        .expect("insert workflow");
        sqlx::query(
            "INSERT INTO approval_request (id, workflow_id, workflow_type, title, requester_id,
                                           status, visibility, priority, version, created_at, updated_at)
             VALUES ('REQ-1', 'wf-1', 'CUSTOM', 'Title', 'u-req', 'DRAFT', '{}', 'NORMAL', 1,
                     '2026-01-01T00:00:00+00:00', '2026-01-01T00:00:00+00:00')",
        )
        .execute(&pool)
        .await
        .expect("insert request");
        sqlx::query(
            "INSERT INTO approval_history (id, request_id, sequence, action, actor_id, timestamp,
                                           entry_hash, signature)
             VALUES ('H-1', 'REQ-1', 1, 'CREATED', 'u-req', '2026-01-01T00:00:00+00:00', 'h', 's')",
        )
        .execute(&pool)
        .await
        .expect("insert history");

        let update = sqlx::query("UPDATE approval_history SET actor_id = 'u-mallory'")
            .execute(&pool)
            .await;
        assert!(update.is_err(), "history updates must be refused");

        let delete = sqlx::query("DELETE FROM approval_history").execute(&pool).await;
        assert!(delete.is_err(), "history deletes must be refused");
    }

    #[tokio::test]
    async fn migrations_up_down_up_preserves_schema_signature() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        run_pending(&pool).await.expect("run migrations");

        let initial_signature = managed_schema_signature(&pool).await;
        assert_eq!(
            initial_signature.len(),
            MANAGED_SCHEMA_OBJECTS.len(),
            "initial migration pass should create all managed schema objects",
        );

        MIGRATOR.undo(&pool, 0).await.expect("undo migrations");

        let after_down_signature = managed_schema_signature(&pool).await;
        assert!(
            after_down_signature.is_empty(),
            "managed schema objects should be removed after full undo",
        );

        run_pending(&pool).await.expect("re-run migrations");

        let after_second_up_signature = managed_schema_signature(&pool).await;
        assert_eq!(
            after_second_up_signature, initial_signature,
            "up/down/up should preserve migration-managed schema signature",
        );
    }

    #[tokio::test]
    async fn applied_versions_track_embedded_migrations() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        assert!(applied_versions(&pool).await.is_err(), "unmigrated schema has no ledger");

        run_pending(&pool).await.expect("run migrations");
        let applied = applied_versions(&pool).await.expect("applied versions");
        assert_eq!(applied, known_versions());
        assert_eq!(applied, vec![1]);
    }

    async fn managed_schema_signature(pool: &sqlx::SqlitePool) -> Vec<(String, String, String)> {
        let mut signature: Vec<(String, String, String)> = sqlx::query(
            "SELECT type, name, IFNULL(sql, '') AS sql
             FROM sqlite_master
             WHERE type IN ('table', 'index')",
        )
        .fetch_all(pool)
        .await
        .expect("load schema objects")
        .into_iter()
        .filter_map(|row| {
            let name = row.get::<String, _>("name");
            if MANAGED_SCHEMA_OBJECTS.contains(&name.as_str()) {
                Some((row.get::<String, _>("type"), name, row.get::<String, _>("sql")))
            } else {
                None
            }
        })
        .collect();
        signature.sort();
        signature
    }
}
