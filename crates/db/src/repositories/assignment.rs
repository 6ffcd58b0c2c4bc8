use chrono::Utc;
use sqlx::{sqlite::SqliteRow, Row};
use uuid::Uuid;

use leadflow_core::conditions::ConditionSet;
use leadflow_core::domain::assignment::{
    AssignmentMember, AssignmentMemberId, AssignmentResult, AssignmentResultId, AssignmentRule,
    AssignmentRuleId, AssignmentStrategy,
};
use leadflow_core::domain::lead::{LeadId, TenantId, UserId};
use leadflow_core::routing::AssignmentDecision;

use super::RepositoryError;
use crate::repositories::lead::parse_timestamp;
use crate::DbPool;

/// Outcome of the transactional assignment commit. A conflict means one of
/// the version tokens captured at decision time went stale; the caller should
/// re-read state and decide again.
#[derive(Clone, Debug, PartialEq)]
pub enum AssignmentCommit {
    Applied(AssignmentResult),
    Conflict,
}

pub struct SqlAssignmentRepository {
    pool: DbPool,
}

impl SqlAssignmentRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn create_rule(&self, rule: &AssignmentRule) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO assignment_rule (
                id, tenant_id, name, strategy, priority, condition_set,
                is_active, round_robin_cursor, version, created_at, updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&rule.id.0)
        .bind(&rule.tenant_id.0)
        .bind(&rule.name)
        .bind(rule.strategy.as_str())
        .bind(rule.priority)
        .bind(rule.condition_set.to_json())
        .bind(i64::from(rule.is_active))
        .bind(rule.round_robin_cursor)
        .bind(rule.version)
        .bind(rule.created_at.to_rfc3339())
        .bind(rule.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn find_rule(
        &self,
        tenant_id: &TenantId,
        id: &AssignmentRuleId,
    ) -> Result<Option<AssignmentRule>, RepositoryError> {
        let row = sqlx::query(
            "SELECT id, tenant_id, name, strategy, priority, condition_set,
                    is_active, round_robin_cursor, version, created_at, updated_at
             FROM assignment_rule
             WHERE tenant_id = ? AND id = ?",
        )
        .bind(&tenant_id.0)
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(rule_from_row).transpose()
    }

    /// Admin edit. Bumps the version token so in-flight assignment decisions
    /// against the old definition fail their commit and re-read.
    pub async fn update_rule(&self, rule: &AssignmentRule) -> Result<bool, RepositoryError> {
        let rows = sqlx::query(
            "UPDATE assignment_rule
             SET name = ?, strategy = ?, priority = ?, condition_set = ?,
                 is_active = ?, version = version + 1, updated_at = ?
             WHERE tenant_id = ? AND id = ?",
        )
        .bind(&rule.name)
        .bind(rule.strategy.as_str())
        .bind(rule.priority)
        .bind(rule.condition_set.to_json())
        .bind(i64::from(rule.is_active))
        .bind(Utc::now().to_rfc3339())
        .bind(&rule.tenant_id.0)
        .bind(&rule.id.0)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(rows > 0)
    }

    pub async fn delete_rule(
        &self,
        tenant_id: &TenantId,
        id: &AssignmentRuleId,
    ) -> Result<bool, RepositoryError> {
        let rows = sqlx::query("DELETE FROM assignment_rule WHERE tenant_id = ? AND id = ?")
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
    ) -> Result<Vec<AssignmentRule>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, tenant_id, name, strategy, priority, condition_set,
                    is_active, round_robin_cursor, version, created_at, updated_at
             FROM assignment_rule
             WHERE tenant_id = ?
             ORDER BY priority ASC, id ASC",
        )
        .bind(&tenant_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(rule_from_row).collect()
    }

    /// Active rules in evaluation order, each with its active members ordered
    /// by id, exactly the shape the assignment engine consumes.
    pub async fn list_active_rules_with_members(
        &self,
        tenant_id: &TenantId,
    ) -> Result<Vec<(AssignmentRule, Vec<AssignmentMember>)>, RepositoryError> {
        let rule_rows = sqlx::query(
            "SELECT id, tenant_id, name, strategy, priority, condition_set,
                    is_active, round_robin_cursor, version, created_at, updated_at
             FROM assignment_rule
             WHERE tenant_id = ? AND is_active = 1
             ORDER BY priority ASC, id ASC",
        )
        .bind(&tenant_id.0)
        .fetch_all(&self.pool)
        .await?;

        let mut rules = Vec::with_capacity(rule_rows.len());
        for row in rule_rows {
            let rule = rule_from_row(row)?;
            let members = self.list_active_members(&rule.id).await?;
            rules.push((rule, members));
        }

        Ok(rules)
    }

    pub async fn create_member(&self, member: &AssignmentMember) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO assignment_member (
                id, rule_id, user_id, territory, capacity, current_load,
                is_active, version, created_at, updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&member.id.0)
        .bind(&member.rule_id.0)
        .bind(&member.user_id.0)
        .bind(member.territory.as_deref())
        .bind(member.capacity)
        .bind(member.current_load)
        .bind(i64::from(member.is_active))
        .bind(member.version)
        .bind(member.created_at.to_rfc3339())
        .bind(member.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn find_member(
        &self,
        rule_id: &AssignmentRuleId,
        id: &AssignmentMemberId,
    ) -> Result<Option<AssignmentMember>, RepositoryError> {
        let row = sqlx::query(
            "SELECT id, rule_id, user_id, territory, capacity, current_load,
                    is_active, version, created_at, updated_at
             FROM assignment_member
             WHERE rule_id = ? AND id = ?",
        )
        .bind(&rule_id.0)
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(member_from_row).transpose()
    }

    /// Admin edit; does not touch `current_load`, which only the assignment
    /// commit mutates. Bumps the version so in-flight decisions re-read.
    pub async fn update_member(&self, member: &AssignmentMember) -> Result<bool, RepositoryError> {
        let rows = sqlx::query(
            "UPDATE assignment_member
             SET user_id = ?, territory = ?, capacity = ?, is_active = ?,
                 version = version + 1, updated_at = ?
             WHERE rule_id = ? AND id = ?",
        )
        .bind(&member.user_id.0)
        .bind(member.territory.as_deref())
        .bind(member.capacity)
        .bind(i64::from(member.is_active))
        .bind(Utc::now().to_rfc3339())
        .bind(&member.rule_id.0)
        .bind(&member.id.0)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(rows > 0)
    }

    pub async fn delete_member(
        &self,
        rule_id: &AssignmentRuleId,
        id: &AssignmentMemberId,
    ) -> Result<bool, RepositoryError> {
        let rows = sqlx::query("DELETE FROM assignment_member WHERE rule_id = ? AND id = ?")
            .bind(&rule_id.0)
            .bind(&id.0)
            .execute(&self.pool)
            .await?
            .rows_affected();

        Ok(rows > 0)
    }

    pub async fn list_members(
        &self,
        rule_id: &AssignmentRuleId,
    ) -> Result<Vec<AssignmentMember>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, rule_id, user_id, territory, capacity, current_load,
                    is_active, version, created_at, updated_at
             FROM assignment_member
             WHERE rule_id = ?
             ORDER BY id ASC",
        )
        .bind(&rule_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(member_from_row).collect()
    }

    async fn list_active_members(
        &self,
        rule_id: &AssignmentRuleId,
    ) -> Result<Vec<AssignmentMember>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, rule_id, user_id, territory, capacity, current_load,
                    is_active, version, created_at, updated_at
             FROM assignment_member
             WHERE rule_id = ? AND is_active = 1
             ORDER BY id ASC",
        )
        .bind(&rule_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(member_from_row).collect()
    }

    /// Commits one automatic assignment atomically: the cursor or load
    /// mutation (guarded by the version captured at decision time), the
    /// lead's `assigned_to`, and the append-only result row. Partial
    /// application is never observable: any stale token rolls the whole
    /// transaction back and reports [`AssignmentCommit::Conflict`].
    pub async fn commit_auto_assignment(
        &self,
        tenant_id: &TenantId,
        lead_id: &LeadId,
        decision: &AssignmentDecision,
    ) -> Result<AssignmentCommit, RepositoryError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        if let Some(new_cursor) = decision.new_cursor {
            let rows = sqlx::query(
                "UPDATE assignment_rule
                 SET round_robin_cursor = ?, version = version + 1, updated_at = ?
                 WHERE tenant_id = ? AND id = ? AND version = ?",
            )
            .bind(new_cursor)
            .bind(now.to_rfc3339())
            .bind(&tenant_id.0)
            .bind(&decision.rule_id.0)
            .bind(decision.rule_version)
            .execute(&mut *tx)
            .await?
            .rows_affected();

            if rows == 0 {
                tx.rollback().await?;
                return Ok(AssignmentCommit::Conflict);
            }
        }

        if decision.increment_load {
            let rows = sqlx::query(
                "UPDATE assignment_member
                 SET current_load = current_load + 1, version = version + 1, updated_at = ?
                 WHERE rule_id = ? AND id = ? AND version = ? AND is_active = 1",
            )
            .bind(now.to_rfc3339())
            .bind(&decision.rule_id.0)
            .bind(&decision.member_id.0)
            .bind(decision.member_version)
            .execute(&mut *tx)
            .await?
            .rows_affected();

            if rows == 0 {
                tx.rollback().await?;
                return Ok(AssignmentCommit::Conflict);
            }
        } else {
            // Rotation strategies mutate no member row, so a member deleted
            // or deactivated since decision time is caught here instead.
            let member_intact = sqlx::query_scalar::<_, i64>(
                "SELECT COUNT(*) FROM assignment_member
                 WHERE rule_id = ? AND id = ? AND version = ? AND is_active = 1",
            )
            .bind(&decision.rule_id.0)
            .bind(&decision.member_id.0)
            .bind(decision.member_version)
            .fetch_one(&mut *tx)
            .await?;

            if member_intact == 0 {
                tx.rollback().await?;
                return Ok(AssignmentCommit::Conflict);
            }
        }

        let rows = sqlx::query(
            "UPDATE lead SET assigned_to = ?, updated_at = ?
             WHERE tenant_id = ? AND id = ? AND is_archived = 0",
        )
        .bind(&decision.assignee.0)
        .bind(now.to_rfc3339())
        .bind(&tenant_id.0)
        .bind(&lead_id.0)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if rows == 0 {
            tx.rollback().await?;
            return Ok(AssignmentCommit::Conflict);
        }

        let result = AssignmentResult {
            id: AssignmentResultId(Uuid::new_v4().to_string()),
            tenant_id: tenant_id.clone(),
            lead_id: lead_id.clone(),
            assigned_to: decision.assignee.clone(),
            rule_id: Some(decision.rule_id.clone()),
            strategy: Some(decision.strategy),
            assigned_at: now,
        };
        insert_result(&mut tx, &result).await?;

        tx.commit().await?;
        Ok(AssignmentCommit::Applied(result))
    }

    /// Manual override: writes `assigned_to` and the audit row, touching no
    /// rule cursor or member load. Returns `None` when the lead is missing or
    /// archived.
    pub async fn record_manual_assignment(
        &self,
        tenant_id: &TenantId,
        lead_id: &LeadId,
        user_id: &UserId,
    ) -> Result<Option<AssignmentResult>, RepositoryError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let rows = sqlx::query(
            "UPDATE lead SET assigned_to = ?, updated_at = ?
             WHERE tenant_id = ? AND id = ? AND is_archived = 0",
        )
        .bind(&user_id.0)
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

        let result = AssignmentResult {
            id: AssignmentResultId(Uuid::new_v4().to_string()),
            tenant_id: tenant_id.clone(),
            lead_id: lead_id.clone(),
            assigned_to: user_id.clone(),
            rule_id: None,
            strategy: None,
            assigned_at: now,
        };
        insert_result(&mut tx, &result).await?;

        tx.commit().await?;
        Ok(Some(result))
    }

    pub async fn results_for_lead(
        &self,
        tenant_id: &TenantId,
        lead_id: &LeadId,
    ) -> Result<Vec<AssignmentResult>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, tenant_id, lead_id, assigned_to, rule_id, strategy, assigned_at
             FROM assignment_result
             WHERE tenant_id = ? AND lead_id = ?
             ORDER BY assigned_at DESC, id DESC",
        )
        .bind(&tenant_id.0)
        .bind(&lead_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(result_from_row).collect()
    }
}

async fn insert_result(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    result: &AssignmentResult,
) -> Result<(), RepositoryError> {
    sqlx::query(
        "INSERT INTO assignment_result (
            id, tenant_id, lead_id, assigned_to, rule_id, strategy, assigned_at
         ) VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&result.id.0)
    .bind(&result.tenant_id.0)
    .bind(&result.lead_id.0)
    .bind(&result.assigned_to.0)
    .bind(result.rule_id.as_ref().map(|id| id.0.as_str()))
    .bind(result.strategy.map(|strategy| strategy.as_str()))
    .bind(result.assigned_at.to_rfc3339())
    .execute(&mut **tx)
    .await?;

    Ok(())
}

fn rule_from_row(row: SqliteRow) -> Result<AssignmentRule, RepositoryError> {
    let strategy_raw = row.try_get::<String, _>("strategy")?;
    let strategy = AssignmentStrategy::parse(&strategy_raw).ok_or_else(|| {
        RepositoryError::Decode(format!("unknown assignment strategy `{strategy_raw}`"))
    })?;

    let condition_raw = row.try_get::<String, _>("condition_set")?;
    let condition_set = ConditionSet::parse_json(&condition_raw)
        .map_err(|error| RepositoryError::Decode(error.to_string()))?;

    Ok(AssignmentRule {
        id: AssignmentRuleId(row.try_get("id")?),
        tenant_id: TenantId(row.try_get("tenant_id")?),
        name: row.try_get("name")?,
        strategy,
        priority: row.try_get("priority")?,
        condition_set,
        is_active: row.try_get::<i64, _>("is_active")? != 0,
        round_robin_cursor: row.try_get("round_robin_cursor")?,
        version: row.try_get("version")?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}

fn member_from_row(row: SqliteRow) -> Result<AssignmentMember, RepositoryError> {
    Ok(AssignmentMember {
        id: AssignmentMemberId(row.try_get("id")?),
        rule_id: AssignmentRuleId(row.try_get("rule_id")?),
        user_id: UserId(row.try_get("user_id")?),
        territory: row.try_get("territory")?,
        capacity: row.try_get("capacity")?,
        current_load: row.try_get("current_load")?,
        is_active: row.try_get::<i64, _>("is_active")? != 0,
        version: row.try_get("version")?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}

fn result_from_row(row: SqliteRow) -> Result<AssignmentResult, RepositoryError> {
    let strategy = row
        .try_get::<Option<String>, _>("strategy")?
        .map(|raw| {
            AssignmentStrategy::parse(&raw).ok_or_else(|| {
                RepositoryError::Decode(format!("unknown assignment strategy `{raw}`"))
            })
        })
        .transpose()?;

    Ok(AssignmentResult {
        id: AssignmentResultId(row.try_get("id")?),
        tenant_id: TenantId(row.try_get("tenant_id")?),
        lead_id: LeadId(row.try_get("lead_id")?),
        assigned_to: UserId(row.try_get("assigned_to")?),
        rule_id: row.try_get::<Option<String>, _>("rule_id")?.map(AssignmentRuleId),
        strategy,
        assigned_at: parse_timestamp("assigned_at", row.try_get("assigned_at")?)?,
    })
}
