use chrono::Utc;
use sqlx::{sqlite::SqliteRow, Row};
use uuid::Uuid;

use leadflow_core::conditions::ConditionSet;
use leadflow_core::domain::lead::{LeadId, TenantId};
use leadflow_core::domain::scoring::{
    RuleBreakdown, RuleContribution, ScoreHistoryEntry, ScoreHistoryId, ScoringRule, ScoringRuleId,
};
use leadflow_core::scoring::ScoreComputation;

use super::RepositoryError;
use crate::repositories::lead::parse_timestamp;
use crate::DbPool;

pub struct SqlScoringRepository {
    pool: DbPool,
}

impl SqlScoringRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn create_rule(&self, rule: &ScoringRule) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO scoring_rule (
                id, tenant_id, name, condition_set, point_delta, is_active,
                created_at, updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&rule.id.0)
        .bind(&rule.tenant_id.0)
        .bind(&rule.name)
        .bind(rule.condition_set.to_json())
        .bind(rule.point_delta)
        .bind(i64::from(rule.is_active))
        .bind(rule.created_at.to_rfc3339())
        .bind(rule.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn find_rule(
        &self,
        tenant_id: &TenantId,
        id: &ScoringRuleId,
    ) -> Result<Option<ScoringRule>, RepositoryError> {
        let row = sqlx::query(
            "SELECT id, tenant_id, name, condition_set, point_delta, is_active,
                    created_at, updated_at
             FROM scoring_rule
             WHERE tenant_id = ? AND id = ?",
        )
        .bind(&tenant_id.0)
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(rule_from_row).transpose()
    }

    pub async fn update_rule(&self, rule: &ScoringRule) -> Result<bool, RepositoryError> {
        let rows = sqlx::query(
            "UPDATE scoring_rule
             SET name = ?, condition_set = ?, point_delta = ?, is_active = ?, updated_at = ?
             WHERE tenant_id = ? AND id = ?",
        )
        .bind(&rule.name)
        .bind(rule.condition_set.to_json())
        .bind(rule.point_delta)
        .bind(i64::from(rule.is_active))
        .bind(Utc::now().to_rfc3339())
        .bind(&rule.tenant_id.0)
        .bind(&rule.id.0)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(rows > 0)
    }

    /// Deleting a rule never touches history: entries carry rule-name
    /// snapshots, so past contributions stay renderable.
    pub async fn delete_rule(
        &self,
        tenant_id: &TenantId,
        id: &ScoringRuleId,
    ) -> Result<bool, RepositoryError> {
        let rows = sqlx::query("DELETE FROM scoring_rule WHERE tenant_id = ? AND id = ?")
            .bind(&tenant_id.0)
            .bind(&id.0)
            .execute(&self.pool)
            .await?
            .rows_affected();

        Ok(rows > 0)
    }

    pub async fn list_rules(
        &self,
        tenant_id: &TenantId,
    ) -> Result<Vec<ScoringRule>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, tenant_id, name, condition_set, point_delta, is_active,
                    created_at, updated_at
             FROM scoring_rule
             WHERE tenant_id = ?
             ORDER BY id ASC",
        )
        .bind(&tenant_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(rule_from_row).collect()
    }

    pub async fn list_active_rules(
        &self,
        tenant_id: &TenantId,
    ) -> Result<Vec<ScoringRule>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, tenant_id, name, condition_set, point_delta, is_active,
                    created_at, updated_at
             FROM scoring_rule
             WHERE tenant_id = ? AND is_active = 1
             ORDER BY id ASC",
        )
        .bind(&tenant_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(rule_from_row).collect()
    }

    /// Appends the history row and updates the lead's cached score in one
    /// transaction, so `lead.score` can never drift from the newest entry.
    /// Returns `None` when the lead vanished or was archived mid-pass.
    pub async fn append_history(
        &self,
        tenant_id: &TenantId,
        lead_id: &LeadId,
        computation: &ScoreComputation,
    ) -> Result<Option<ScoreHistoryEntry>, RepositoryError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let rows = sqlx::query(
            "UPDATE lead SET score = ?, updated_at = ?
             WHERE tenant_id = ? AND id = ? AND is_archived = 0",
        )
        .bind(computation.resulting_score)
        .bind(now.to_rfc3339())
        .bind(&tenant_id.0)
        .bind(&lead_id.0)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if rows == 0 {
            tx.rollback().await?;
            return Ok(None);
        }

        let entry = ScoreHistoryEntry {
            id: ScoreHistoryId(Uuid::new_v4().to_string()),
            tenant_id: tenant_id.clone(),
            lead_id: lead_id.clone(),
            delta: computation.delta,
            resulting_score: computation.resulting_score,
            contributions: computation.contributions.clone(),
            recorded_at: now,
        };

        let contributions_json = serde_json::to_string(&entry.contributions)
            .map_err(|error| RepositoryError::Decode(error.to_string()))?;

        sqlx::query(
            "INSERT INTO score_history (
                id, tenant_id, lead_id, delta, resulting_score, contributions, recorded_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&entry.id.0)
        .bind(&entry.tenant_id.0)
        .bind(&entry.lead_id.0)
        .bind(entry.delta)
        .bind(entry.resulting_score)
        .bind(&contributions_json)
        .bind(entry.recorded_at.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some(entry))
    }

    pub async fn history_for_lead(
        &self,
        tenant_id: &TenantId,
        lead_id: &LeadId,
    ) -> Result<Vec<ScoreHistoryEntry>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, tenant_id, lead_id, delta, resulting_score, contributions, recorded_at
             FROM score_history
             WHERE tenant_id = ? AND lead_id = ?
             ORDER BY recorded_at DESC, id DESC",
        )
        .bind(&tenant_id.0)
        .bind(&lead_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(history_from_row).collect()
    }

    /// Derived read: replays history contributions grouped by rule. Built
    /// from the same log the cached score comes from, so the two can never
    /// disagree.
    pub async fn breakdown_for_lead(
        &self,
        tenant_id: &TenantId,
        lead_id: &LeadId,
    ) -> Result<Vec<RuleBreakdown>, RepositoryError> {
        let entries = self.history_for_lead(tenant_id, lead_id).await?;

        let mut by_rule: Vec<RuleBreakdown> = Vec::new();
        for entry in &entries {
            for contribution in &entry.contributions {
                match by_rule.iter_mut().find(|row| row.rule_id == contribution.rule_id) {
                    Some(row) => {
                        row.total_delta += contribution.delta;
                        row.times_fired += 1;
                    }
                    None => by_rule.push(RuleBreakdown {
                        rule_id: contribution.rule_id.clone(),
                        rule_name: contribution.rule_name.clone(),
                        total_delta: contribution.delta,
                        times_fired: 1,
                    }),
                }
            }
        }

        by_rule.sort_by(|a, b| {
            b.total_delta.cmp(&a.total_delta).then_with(|| a.rule_id.cmp(&b.rule_id))
        });
        Ok(by_rule)
    }

}

fn rule_from_row(row: SqliteRow) -> Result<ScoringRule, RepositoryError> {
    let condition_raw = row.try_get::<String, _>("condition_set")?;
    let condition_set = ConditionSet::parse_json(&condition_raw)
        .map_err(|error| RepositoryError::Decode(error.to_string()))?;

    Ok(ScoringRule {
        id: ScoringRuleId(row.try_get("id")?),
        tenant_id: TenantId(row.try_get("tenant_id")?),
        name: row.try_get("name")?,
        condition_set,
        point_delta: row.try_get("point_delta")?,
        is_active: row.try_get::<i64, _>("is_active")? != 0,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}

fn history_from_row(row: SqliteRow) -> Result<ScoreHistoryEntry, RepositoryError> {
    let contributions_raw = row.try_get::<String, _>("contributions")?;
    let contributions: Vec<RuleContribution> = serde_json::from_str(&contributions_raw)
        .map_err(|error| RepositoryError::Decode(error.to_string()))?;

    Ok(ScoreHistoryEntry {
        id: ScoreHistoryId(row.try_get("id")?),
        tenant_id: TenantId(row.try_get("tenant_id")?),
        lead_id: LeadId(row.try_get("lead_id")?),
        delta: row.try_get("delta")?,
        resulting_score: row.try_get("resulting_score")?,
        contributions,
        recorded_at: parse_timestamp("recorded_at", row.try_get("recorded_at")?)?,
    })
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Utc};

    use leadflow_core::conditions::ConditionSet;
    use leadflow_core::domain::lead::{Lead, LeadId, LeadStatus, TenantId};
    use leadflow_core::domain::scoring::{RuleContribution, ScoringRule, ScoringRuleId};
    use leadflow_core::scoring::ScoreComputation;

    use super::SqlScoringRepository;
    use crate::migrations;
    use crate::repositories::{LeadStore, SqlLeadRepository};
    use crate::{connect_with_settings, DbPool};

    async fn setup_pool() -> DbPool {
        let pool =
            connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect test pool");
        migrations::run_pending(&pool).await.expect("run migrations");
        pool
    }

    fn parse_ts(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value).expect("valid rfc3339").with_timezone(&Utc)
    }

    fn rule_fixture(id: &str, name: &str, delta: i64) -> ScoringRule {
        ScoringRule {
            id: ScoringRuleId(id.to_string()),
            tenant_id: TenantId("tenant-1".to_string()),
            name: name.to_string(),
            condition_set: ConditionSet::default(),
            point_delta: delta,
            is_active: true,
            created_at: parse_ts("2026-07-01T09:00:00Z"),
            updated_at: parse_ts("2026-07-01T09:00:00Z"),
        }
    }

    async fn insert_lead(pool: &DbPool, id: &str, score: i64) -> Lead {
        let lead = Lead {
            id: LeadId(id.to_string()),
            tenant_id: TenantId("tenant-1".to_string()),
            email: None,
            phone: None,
            first_name: None,
            last_name: None,
            company: None,
            city: None,
            state: None,
            country: None,
            status: LeadStatus::New,
            assigned_to: None,
            score,
            is_archived: false,
            merged_into_id: None,
            created_at: parse_ts("2026-07-01T09:00:00Z"),
            updated_at: parse_ts("2026-07-01T09:00:00Z"),
        };
        SqlLeadRepository::new(pool.clone()).insert(&lead).await.expect("insert lead");
        lead
    }

    fn computation(delta: i64, resulting: i64, rules: &[(&str, &str)]) -> ScoreComputation {
        ScoreComputation {
            delta,
            resulting_score: resulting,
            contributions: rules
                .iter()
                .map(|(id, name)| RuleContribution {
                    rule_id: ScoringRuleId(id.to_string()),
                    rule_name: name.to_string(),
                    delta: delta / rules.len() as i64,
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn rule_crud_round_trip() {
        let pool = setup_pool().await;
        let repo = SqlScoringRepository::new(pool.clone());
        let tenant = TenantId("tenant-1".to_string());

        let rule = rule_fixture("SR-CRUD-1", "HasEmail", 10);
        repo.create_rule(&rule).await.expect("create rule");
        assert_eq!(repo.find_rule(&tenant, &rule.id).await.expect("find"), Some(rule.clone()));

        let mut updated = rule.clone();
        updated.point_delta = 20;
        assert!(repo.update_rule(&updated).await.expect("update"));
        let reloaded = repo.find_rule(&tenant, &rule.id).await.expect("find").expect("present");
        assert_eq!(reloaded.point_delta, 20);

        assert!(repo.delete_rule(&tenant, &rule.id).await.expect("delete"));
        assert_eq!(repo.find_rule(&tenant, &rule.id).await.expect("find"), None);

        pool.close().await;
    }

    #[tokio::test]
    async fn append_keeps_cached_score_and_history_in_lockstep() {
        let pool = setup_pool().await;
        let repo = SqlScoringRepository::new(pool.clone());
        let tenant = TenantId("tenant-1".to_string());
        let lead = insert_lead(&pool, "L-SCORE-1", 20).await;

        let entry = repo
            .append_history(&tenant, &lead.id, &computation(15, 35, &[("SR-1", "HasEmail")]))
            .await
            .expect("append")
            .expect("lead present");
        assert_eq!(entry.resulting_score, 35);

        let reloaded = SqlLeadRepository::new(pool.clone())
            .find_by_id(&tenant, &lead.id)
            .await
            .expect("find lead")
            .expect("present");
        let history = repo.history_for_lead(&tenant, &lead.id).await.expect("history");
        assert_eq!(reloaded.score, history[0].resulting_score);

        pool.close().await;
    }

    #[tokio::test]
    async fn append_to_archived_lead_is_refused_without_history_row() {
        let pool = setup_pool().await;
        let repo = SqlScoringRepository::new(pool.clone());
        let tenant = TenantId("tenant-1".to_string());
        let lead = insert_lead(&pool, "L-SCORE-ARCHIVED", 20).await;
        sqlx::query("UPDATE lead SET is_archived = 1 WHERE id = ?")
            .bind(&lead.id.0)
            .execute(&pool)
            .await
            .expect("archive");

        let entry = repo
            .append_history(&tenant, &lead.id, &computation(10, 30, &[("SR-1", "HasEmail")]))
            .await
            .expect("append");
        assert!(entry.is_none());
        assert!(repo.history_for_lead(&tenant, &lead.id).await.expect("history").is_empty());

        pool.close().await;
    }

    #[tokio::test]
    async fn breakdown_replays_contributions_per_rule() {
        let pool = setup_pool().await;
        let repo = SqlScoringRepository::new(pool.clone());
        let tenant = TenantId("tenant-1".to_string());
        let lead = insert_lead(&pool, "L-BREAKDOWN-1", 0).await;

        repo.append_history(&tenant, &lead.id, &computation(10, 10, &[("SR-1", "HasEmail")]))
            .await
            .expect("append")
            .expect("present");
        repo.append_history(
            &tenant,
            &lead.id,
            &computation(20, 30, &[("SR-1", "HasEmail"), ("SR-2", "CompanySet")]),
        )
        .await
        .expect("append")
        .expect("present");

        let breakdown = repo.breakdown_for_lead(&tenant, &lead.id).await.expect("breakdown");
        assert_eq!(breakdown.len(), 2);
        assert_eq!(breakdown[0].rule_name, "HasEmail");
        assert_eq!(breakdown[0].total_delta, 20);
        assert_eq!(breakdown[0].times_fired, 2);
        assert_eq!(breakdown[1].rule_name, "CompanySet");
        assert_eq!(breakdown[1].total_delta, 10);

        pool.close().await;
    }

    #[tokio::test]
    async fn breakdown_survives_rule_deletion() {
        let pool = setup_pool().await;
        let repo = SqlScoringRepository::new(pool.clone());
        let tenant = TenantId("tenant-1".to_string());
        let lead = insert_lead(&pool, "L-SNAPSHOT-1", 0).await;

        let rule = rule_fixture("SR-GONE-1", "ShortLived", 10);
        repo.create_rule(&rule).await.expect("create rule");
        repo.append_history(&tenant, &lead.id, &computation(10, 10, &[("SR-GONE-1", "ShortLived")]))
            .await
            .expect("append")
            .expect("present");
        repo.delete_rule(&tenant, &rule.id).await.expect("delete rule");

        let breakdown = repo.breakdown_for_lead(&tenant, &lead.id).await.expect("breakdown");
        assert_eq!(breakdown[0].rule_name, "ShortLived", "name snapshot outlives the rule");

        pool.close().await;
    }

}
