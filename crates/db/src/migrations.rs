use sqlx::migrate::{MigrateError, Migrator};

use crate::DbPool;

pub static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

pub async fn run_pending(pool: &DbPool) -> Result<(), MigrateError> {
    MIGRATOR.run(pool).await
}

/// Whether the baseline schema is present. Used by readiness checks to tell
/// "connected but never migrated" apart from a healthy database.
pub async fn schema_ready(pool: &DbPool) -> Result<bool, sqlx::Error> {
    let count = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'lead'",
    )
    .fetch_one(pool)
    .await?;

    Ok(count == 1)
}

#[cfg(test)]
mod tests {
    use sqlx::Row;

    use super::run_pending;
    use crate::{connect_with_settings, migrations::MIGRATOR};

    const MANAGED_SCHEMA_OBJECTS: &[&str] = &[
        "lead",
        "assignment_rule",
        "assignment_member",
        "assignment_result",
        "scoring_rule",
        "score_history",
        "duplicate_pair",
        "merge_history",
        "activity",
        "communication",
        "opportunity",
        "batch_checkpoint",
        "idx_lead_tenant_id",
        "idx_lead_tenant_archived",
        "idx_lead_assigned_to",
        "idx_assignment_rule_tenant_priority",
        "idx_assignment_member_rule_id",
        "idx_assignment_result_lead_id",
        "idx_assignment_result_assigned_at",
        "idx_scoring_rule_tenant_id",
        "idx_score_history_lead_id",
        "idx_duplicate_pair_pending_unique",
        "idx_duplicate_pair_status_confidence",
        "idx_merge_history_survivor",
        "idx_merge_history_merged",
        "idx_activity_lead_id",
        "idx_communication_lead_id",
        "idx_opportunity_lead_id",
    ];

    #[tokio::test]
    async fn migrations_create_baseline_tables() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        run_pending(&pool).await.expect("run migrations");

        let table_count = sqlx::query(
            "SELECT COUNT(*) AS count FROM sqlite_master
             WHERE type = 'table' AND name IN (
                'lead', 'assignment_rule', 'assignment_member', 'assignment_result',
                'scoring_rule', 'score_history', 'duplicate_pair', 'merge_history',
                'activity', 'communication', 'opportunity', 'batch_checkpoint'
             )",
        )
        .fetch_one(&pool)
        .await
        .expect("count baseline tables")
        .get::<i64, _>("count");

        assert_eq!(table_count, 12);
    }

    #[tokio::test]
    async fn migrations_are_reversible() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        run_pending(&pool).await.expect("run migrations");

        MIGRATOR.undo(&pool, 0).await.expect("undo migrations");

        let lead_count = sqlx::query(
            "SELECT COUNT(*) AS count FROM sqlite_master WHERE type = 'table' AND name = 'lead'",
        )
        .fetch_one(&pool)
        .await
        .expect("check lead table removed")
        .get::<i64, _>("count");

        assert_eq!(lead_count, 0);
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
