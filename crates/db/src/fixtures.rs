use sqlx::Executor;

use crate::connection::DbPool;
use crate::repositories::RepositoryError;

const SEED_TENANT: &str = "tenant-demo";

const SEED_LEAD_IDS: &[&str] =
    &["lead-demo-001", "lead-demo-002", "lead-demo-003", "lead-demo-004"];

const SEED_ASSIGNMENT_RULE_IDS: &[&str] =
    &["rule-demo-territory", "rule-demo-rr", "rule-demo-load"];

const SEED_SCORING_RULE_IDS: &[&str] =
    &["srule-demo-email", "srule-demo-company", "srule-demo-engaged"];

/// Deterministic demo dataset covering all three assignment strategies, the
/// scoring signal sources, and an exact-email duplicate candidate.
pub struct DemoSeedDataset;

impl DemoSeedDataset {
    pub const SQL: &str = include_str!("../../../config/fixtures/demo_seed_data.sql");

    /// Loads the dataset in one transaction. Expects an empty (or cleaned)
    /// demo tenant; rerunning without [`DemoSeedDataset::clean`] fails on the
    /// primary keys rather than silently duplicating data.
    pub async fn load(pool: &DbPool) -> Result<SeedSummary, RepositoryError> {
        let mut tx = pool.begin().await?;
        tx.execute(sqlx::query(Self::SQL)).await?;
        tx.commit().await?;

        Ok(SeedSummary {
            tenant_id: SEED_TENANT.to_string(),
            leads: SEED_LEAD_IDS.len(),
            assignment_rules: SEED_ASSIGNMENT_RULE_IDS.len(),
            scoring_rules: SEED_SCORING_RULE_IDS.len(),
        })
    }

    pub async fn verify(pool: &DbPool) -> Result<SeedVerification, RepositoryError> {
        let mut checks = Vec::new();

        checks.push((
            "leads-present",
            count_ids(pool, "lead", SEED_LEAD_IDS).await? == SEED_LEAD_IDS.len() as i64,
        ));
        checks.push((
            "assignment-rules-present",
            count_ids(pool, "assignment_rule", SEED_ASSIGNMENT_RULE_IDS).await?
                == SEED_ASSIGNMENT_RULE_IDS.len() as i64,
        ));
        checks.push((
            "scoring-rules-present",
            count_ids(pool, "scoring_rule", SEED_SCORING_RULE_IDS).await?
                == SEED_SCORING_RULE_IDS.len() as i64,
        ));

        let member_count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM assignment_member WHERE rule_id IN (?, ?, ?)",
        )
        .bind(SEED_ASSIGNMENT_RULE_IDS[0])
        .bind(SEED_ASSIGNMENT_RULE_IDS[1])
        .bind(SEED_ASSIGNMENT_RULE_IDS[2])
        .fetch_one(pool)
        .await?;
        checks.push(("assignment-members-present", member_count == 7));

        let signal_count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM activity WHERE tenant_id = ? AND lead_id = 'lead-demo-001'",
        )
        .bind(SEED_TENANT)
        .fetch_one(pool)
        .await?;
        checks.push(("activity-signals-present", signal_count == 4));

        let all_present = checks.iter().all(|(_, passed)| *passed);
        Ok(SeedVerification { all_present, checks })
    }

    /// Removes the demo tenant's rows so `load` can run again.
    pub async fn clean(pool: &DbPool) -> Result<(), RepositoryError> {
        let mut tx = pool.begin().await?;

        for table in [
            "merge_history",
            "duplicate_pair",
            "score_history",
            "assignment_result",
            "opportunity",
            "communication",
            "activity",
            "scoring_rule",
            "lead",
        ] {
            let sql = format!("DELETE FROM {table} WHERE tenant_id = ?");
            sqlx::query(&sql).bind(SEED_TENANT).execute(&mut *tx).await?;
        }

        // Members hang off rules, which are not tenant-keyed in the member row.
        sqlx::query(
            "DELETE FROM assignment_member WHERE rule_id IN
                (SELECT id FROM assignment_rule WHERE tenant_id = ?)",
        )
        .bind(SEED_TENANT)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM assignment_rule WHERE tenant_id = ?")
            .bind(SEED_TENANT)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SeedSummary {
    pub tenant_id: String,
    pub leads: usize,
    pub assignment_rules: usize,
    pub scoring_rules: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SeedVerification {
    pub all_present: bool,
    pub checks: Vec<(&'static str, bool)>,
}
