use std::collections::BTreeMap;

use chrono::Utc;
use serde_json::json;
use sqlx::{sqlite::SqliteRow, Row};
use thiserror::Error;
use uuid::Uuid;

use leadflow_core::domain::duplicate::{
    DuplicatePair, DuplicatePairId, MatchedField, MergeHistoryId, MergeRecord, PairStatus,
};
use leadflow_core::domain::lead::{Lead, LeadId, TenantId, UserId};

use super::RepositoryError;
use crate::repositories::lead::{lead_from_row, parse_optional_timestamp, parse_timestamp};
use crate::DbPool;

/// Child tables re-parented by a merge. Every known child-entity type must be
/// listed here: a partially re-parented merge is the primary correctness
/// hazard of this module.
const CHILD_TABLES: &[&str] =
    &["activity", "communication", "opportunity", "score_history", "assignment_result"];

const OVERRIDABLE_FIELDS: &[&str] =
    &["email", "phone", "first_name", "last_name", "company", "city", "state", "country"];

#[derive(Debug, Error)]
pub enum MergeError {
    #[error("lead `{0}` was not found in this tenant")]
    LeadNotFound(String),
    #[error("lead `{0}` is archived")]
    LeadArchived(String),
    #[error("a lead cannot be merged into itself")]
    SelfMerge,
    #[error("unknown override field `{0}`")]
    UnknownOverrideField(String),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

impl From<sqlx::Error> for MergeError {
    fn from(error: sqlx::Error) -> Self {
        Self::Repository(RepositoryError::Database(error))
    }
}

pub struct SqlDuplicateRepository {
    pool: DbPool,
}

impl SqlDuplicateRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Persists a pending pair unless one already exists for this unordered
    /// lead pair (the partial unique index collapses races). Returns whether
    /// a new row was inserted.
    pub async fn insert_pending_pair(
        &self,
        pair: &DuplicatePair,
    ) -> Result<bool, RepositoryError> {
        let matched_json = matched_fields_json(&pair.matched_fields);

        let rows = sqlx::query(
            "INSERT OR IGNORE INTO duplicate_pair (
                id, tenant_id, lead_a_id, lead_b_id, confidence, matched_fields,
                status, created_at, resolved_at, resolved_by
             ) VALUES (?, ?, ?, ?, ?, ?, 'pending', ?, NULL, NULL)",
        )
        .bind(&pair.id.0)
        .bind(&pair.tenant_id.0)
        .bind(&pair.lead_a_id.0)
        .bind(&pair.lead_b_id.0)
        .bind(pair.confidence)
        .bind(&matched_json)
        .bind(pair.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(rows > 0)
    }

    pub async fn find_pair(
        &self,
        tenant_id: &TenantId,
        id: &DuplicatePairId,
    ) -> Result<Option<DuplicatePair>, RepositoryError> {
        let row = sqlx::query(
            "SELECT id, tenant_id, lead_a_id, lead_b_id, confidence, matched_fields,
                    status, created_at, resolved_at, resolved_by
             FROM duplicate_pair
             WHERE tenant_id = ? AND id = ?",
        )
        .bind(&tenant_id.0)
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(pair_from_row).transpose()
    }

    /// Pending pairs touching the given lead, strongest match first.
    pub async fn pending_pairs_for_lead(
        &self,
        tenant_id: &TenantId,
        lead_id: &LeadId,
    ) -> Result<Vec<DuplicatePair>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, tenant_id, lead_a_id, lead_b_id, confidence, matched_fields,
                    status, created_at, resolved_at, resolved_by
             FROM duplicate_pair
             WHERE tenant_id = ? AND status = 'pending'
               AND (lead_a_id = ? OR lead_b_id = ?)
             ORDER BY confidence DESC, id ASC",
        )
        .bind(&tenant_id.0)
        .bind(&lead_id.0)
        .bind(&lead_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(pair_from_row).collect()
    }

    /// Review-queue page: pending pairs by confidence descending, plus the
    /// total pending count for paging.
    pub async fn list_suggestions(
        &self,
        tenant_id: &TenantId,
        limit: u32,
        offset: u32,
    ) -> Result<(Vec<DuplicatePair>, i64), RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, tenant_id, lead_a_id, lead_b_id, confidence, matched_fields,
                    status, created_at, resolved_at, resolved_by
             FROM duplicate_pair
             WHERE tenant_id = ? AND status = 'pending'
             ORDER BY confidence DESC, id ASC
             LIMIT ? OFFSET ?",
        )
        .bind(&tenant_id.0)
        .bind(i64::from(limit))
        .bind(i64::from(offset))
        .fetch_all(&self.pool)
        .await?;

        let total = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM duplicate_pair WHERE tenant_id = ? AND status = 'pending'",
        )
        .bind(&tenant_id.0)
        .fetch_one(&self.pool)
        .await?;

        let pairs = rows.into_iter().map(pair_from_row).collect::<Result<Vec<_>, _>>()?;
        Ok((pairs, total))
    }

    /// `pending -> not_duplicate`. Returns false when the pair was not
    /// pending (already resolved, or missing).
    pub async fn resolve_not_duplicate(
        &self,
        tenant_id: &TenantId,
        id: &DuplicatePairId,
        resolved_by: &UserId,
    ) -> Result<bool, RepositoryError> {
        let rows = sqlx::query(
            "UPDATE duplicate_pair
             SET status = 'not_duplicate', resolved_at = ?, resolved_by = ?
             WHERE tenant_id = ? AND id = ? AND status = 'pending'",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(&resolved_by.0)
        .bind(&tenant_id.0)
        .bind(&id.0)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(rows > 0)
    }

    /// Merges `merged_id` into `survivor_id` in one transaction: field
    /// resolution, re-parenting of every child table, tombstoning the merged
    /// lead, the merge-history append, and resolution of any pending pair for
    /// the two leads. Any failure rolls the whole transaction back.
    pub async fn merge_leads(
        &self,
        tenant_id: &TenantId,
        survivor_id: &LeadId,
        merged_id: &LeadId,
        overrides: &BTreeMap<String, String>,
        performed_by: &UserId,
    ) -> Result<MergeRecord, MergeError> {
        if survivor_id == merged_id {
            return Err(MergeError::SelfMerge);
        }
        for field in overrides.keys() {
            if !OVERRIDABLE_FIELDS.contains(&field.as_str()) {
                return Err(MergeError::UnknownOverrideField(field.clone()));
            }
        }

        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        // Validation reads happen inside the transaction so a concurrent
        // merge or archive cannot slip between check and mutation.
        let survivor = load_lead_tx(&mut tx, tenant_id, survivor_id)
            .await?
            .ok_or_else(|| MergeError::LeadNotFound(survivor_id.0.clone()))?;
        let merged = load_lead_tx(&mut tx, tenant_id, merged_id)
            .await?
            .ok_or_else(|| MergeError::LeadNotFound(merged_id.0.clone()))?;

        if survivor.is_archived {
            return Err(MergeError::LeadArchived(survivor_id.0.clone()));
        }
        if merged.is_archived {
            return Err(MergeError::LeadArchived(merged_id.0.clone()));
        }

        // Snapshot before any mutation.
        let field_snapshot = json!({
            "survivor": lead_snapshot(&survivor),
            "merged": lead_snapshot(&merged),
            "overrides": overrides,
        });

        // Survivor's fields win by default; overrides apply explicitly.
        for (field, value) in overrides {
            let sql = format!("UPDATE lead SET {field} = ?, updated_at = ? WHERE tenant_id = ? AND id = ?");
            sqlx::query(&sql)
                .bind(value)
                .bind(now.to_rfc3339())
                .bind(&tenant_id.0)
                .bind(&survivor_id.0)
                .execute(&mut *tx)
                .await?;
        }

        for table in CHILD_TABLES {
            let sql = format!("UPDATE {table} SET lead_id = ? WHERE tenant_id = ? AND lead_id = ?");
            sqlx::query(&sql)
                .bind(&survivor_id.0)
                .bind(&tenant_id.0)
                .bind(&merged_id.0)
                .execute(&mut *tx)
                .await?;
        }

        // Tombstone, not a delete: referential history stays intact.
        sqlx::query(
            "UPDATE lead SET is_archived = 1, merged_into_id = ?, updated_at = ?
             WHERE tenant_id = ? AND id = ?",
        )
        .bind(&survivor_id.0)
        .bind(now.to_rfc3339())
        .bind(&tenant_id.0)
        .bind(&merged_id.0)
        .execute(&mut *tx)
        .await?;

        let (lead_a, lead_b) = if survivor_id <= merged_id {
            (survivor_id, merged_id)
        } else {
            (merged_id, survivor_id)
        };
        sqlx::query(
            "UPDATE duplicate_pair
             SET status = 'merged', resolved_at = ?, resolved_by = ?
             WHERE tenant_id = ? AND lead_a_id = ? AND lead_b_id = ? AND status = 'pending'",
        )
        .bind(now.to_rfc3339())
        .bind(&performed_by.0)
        .bind(&tenant_id.0)
        .bind(&lead_a.0)
        .bind(&lead_b.0)
        .execute(&mut *tx)
        .await?;

        let record = MergeRecord {
            id: MergeHistoryId(Uuid::new_v4().to_string()),
            tenant_id: tenant_id.clone(),
            survivor_lead_id: survivor_id.clone(),
            merged_lead_id: merged_id.clone(),
            field_snapshot,
            performed_by: performed_by.clone(),
            merged_at: now,
        };

        sqlx::query(
            "INSERT INTO merge_history (
                id, tenant_id, survivor_lead_id, merged_lead_id, field_snapshot,
                performed_by, merged_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.id.0)
        .bind(&record.tenant_id.0)
        .bind(&record.survivor_lead_id.0)
        .bind(&record.merged_lead_id.0)
        .bind(record.field_snapshot.to_string())
        .bind(&record.performed_by.0)
        .bind(record.merged_at.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(record)
    }

    pub async fn merge_history(
        &self,
        tenant_id: &TenantId,
        lead_id: Option<&LeadId>,
    ) -> Result<Vec<MergeRecord>, RepositoryError> {
        let rows = if let Some(lead) = lead_id {
            sqlx::query(
                "SELECT id, tenant_id, survivor_lead_id, merged_lead_id, field_snapshot,
                        performed_by, merged_at
                 FROM merge_history
                 WHERE tenant_id = ? AND (survivor_lead_id = ? OR merged_lead_id = ?)
                 ORDER BY merged_at DESC, id DESC",
            )
            .bind(&tenant_id.0)
            .bind(&lead.0)
            .bind(&lead.0)
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query(
                "SELECT id, tenant_id, survivor_lead_id, merged_lead_id, field_snapshot,
                        performed_by, merged_at
                 FROM merge_history
                 WHERE tenant_id = ?
                 ORDER BY merged_at DESC, id DESC",
            )
            .bind(&tenant_id.0)
            .fetch_all(&self.pool)
            .await?
        };

        rows.into_iter().map(merge_record_from_row).collect()
    }
}

async fn load_lead_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    tenant_id: &TenantId,
    id: &LeadId,
) -> Result<Option<Lead>, RepositoryError> {
    let row = sqlx::query(
        "SELECT id, tenant_id, email, phone, first_name, last_name, company,
                city, state, country, status, assigned_to, score, is_archived,
                merged_into_id, created_at, updated_at
         FROM lead
         WHERE tenant_id = ? AND id = ?",
    )
    .bind(&tenant_id.0)
    .bind(&id.0)
    .fetch_optional(&mut **tx)
    .await?;

    row.map(lead_from_row).transpose()
}

fn lead_snapshot(lead: &Lead) -> serde_json::Value {
    json!({
        "id": lead.id.0,
        "email": lead.email,
        "phone": lead.phone,
        "first_name": lead.first_name,
        "last_name": lead.last_name,
        "company": lead.company,
        "city": lead.city,
        "state": lead.state,
        "country": lead.country,
        "status": lead.status.as_str(),
        "assigned_to": lead.assigned_to.as_ref().map(|user| user.0.clone()),
        "score": lead.score,
    })
}

fn matched_fields_json(fields: &[MatchedField]) -> String {
    serde_json::to_string(&fields.iter().map(MatchedField::as_str).collect::<Vec<_>>())
        .unwrap_or_else(|_| "[]".to_string())
}

fn pair_from_row(row: SqliteRow) -> Result<DuplicatePair, RepositoryError> {
    let status_raw = row.try_get::<String, _>("status")?;
    let status = PairStatus::parse(&status_raw).ok_or_else(|| {
        RepositoryError::Decode(format!("unknown duplicate pair status `{status_raw}`"))
    })?;

    let matched_raw = row.try_get::<String, _>("matched_fields")?;
    let matched_names: Vec<String> = serde_json::from_str(&matched_raw)
        .map_err(|error| RepositoryError::Decode(error.to_string()))?;
    let matched_fields = matched_names
        .iter()
        .map(|name| {
            MatchedField::parse(name).ok_or_else(|| {
                RepositoryError::Decode(format!("unknown matched field `{name}`"))
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(DuplicatePair {
        id: DuplicatePairId(row.try_get("id")?),
        tenant_id: TenantId(row.try_get("tenant_id")?),
        lead_a_id: LeadId(row.try_get("lead_a_id")?),
        lead_b_id: LeadId(row.try_get("lead_b_id")?),
        confidence: row.try_get("confidence")?,
        matched_fields,
        status,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        resolved_at: parse_optional_timestamp("resolved_at", row.try_get("resolved_at")?)?,
        resolved_by: row.try_get::<Option<String>, _>("resolved_by")?.map(UserId),
    })
}

fn merge_record_from_row(row: SqliteRow) -> Result<MergeRecord, RepositoryError> {
    let snapshot_raw = row.try_get::<String, _>("field_snapshot")?;
    let field_snapshot: serde_json::Value = serde_json::from_str(&snapshot_raw)
        .map_err(|error| RepositoryError::Decode(error.to_string()))?;

    Ok(MergeRecord {
        id: MergeHistoryId(row.try_get("id")?),
        tenant_id: TenantId(row.try_get("tenant_id")?),
        survivor_lead_id: LeadId(row.try_get("survivor_lead_id")?),
        merged_lead_id: LeadId(row.try_get("merged_lead_id")?),
        field_snapshot,
        performed_by: UserId(row.try_get("performed_by")?),
        merged_at: parse_timestamp("merged_at", row.try_get("merged_at")?)?,
    })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::{DateTime, Utc};

    use leadflow_core::domain::duplicate::{
        ordered_pair, DuplicatePair, DuplicatePairId, MatchedField, PairStatus,
    };
    use leadflow_core::domain::lead::{Lead, LeadId, LeadStatus, TenantId, UserId};

    use super::{MergeError, SqlDuplicateRepository};
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

    async fn insert_lead(pool: &DbPool, id: &str, email: Option<&str>) -> Lead {
        let lead = Lead {
            id: LeadId(id.to_string()),
            tenant_id: TenantId("tenant-1".to_string()),
            email: email.map(str::to_string),
            phone: None,
            first_name: None,
            last_name: None,
            company: None,
            city: None,
            state: None,
            country: None,
            status: LeadStatus::New,
            assigned_to: None,
            score: 0,
            is_archived: false,
            merged_into_id: None,
            created_at: parse_ts("2026-07-01T09:00:00Z"),
            updated_at: parse_ts("2026-07-01T09:00:00Z"),
        };
        SqlLeadRepository::new(pool.clone()).insert(&lead).await.expect("insert lead");
        lead
    }

    fn pair_fixture(id: &str, lead_a: &str, lead_b: &str, confidence: f64) -> DuplicatePair {
        let (lead_a_id, lead_b_id) =
            ordered_pair(LeadId(lead_a.to_string()), LeadId(lead_b.to_string()));
        DuplicatePair {
            id: DuplicatePairId(id.to_string()),
            tenant_id: TenantId("tenant-1".to_string()),
            lead_a_id,
            lead_b_id,
            confidence,
            matched_fields: vec![MatchedField::Email],
            status: PairStatus::Pending,
            created_at: parse_ts("2026-07-01T09:00:00Z"),
            resolved_at: None,
            resolved_by: None,
        }
    }

    async fn insert_child_rows(pool: &DbPool, lead_id: &str) {
        sqlx::query(
            "INSERT INTO activity (id, tenant_id, lead_id, kind, is_completed, occurred_at)
             VALUES (?, 'tenant-1', ?, 'call', 1, '2026-07-01T10:00:00Z')",
        )
        .bind(format!("A-{lead_id}"))
        .bind(lead_id)
        .execute(pool)
        .await
        .expect("insert activity");

        sqlx::query(
            "INSERT INTO communication (id, tenant_id, lead_id, channel, subject, logged_at)
             VALUES (?, 'tenant-1', ?, 'email', 'intro', '2026-07-01T10:05:00Z')",
        )
        .bind(format!("C-{lead_id}"))
        .bind(lead_id)
        .execute(pool)
        .await
        .expect("insert communication");

        sqlx::query(
            "INSERT INTO opportunity (id, tenant_id, lead_id, name, stage, opened_at)
             VALUES (?, 'tenant-1', ?, 'renewal', 'open', '2026-07-01T10:10:00Z')",
        )
        .bind(format!("O-{lead_id}"))
        .bind(lead_id)
        .execute(pool)
        .await
        .expect("insert opportunity");
    }

    async fn count_children(pool: &DbPool, table: &str, lead_id: &str) -> i64 {
        sqlx::query_scalar::<_, i64>(&format!("SELECT COUNT(*) FROM {table} WHERE lead_id = ?"))
            .bind(lead_id)
            .fetch_one(pool)
            .await
            .expect("count child rows")
    }

    #[tokio::test]
    async fn pending_pair_is_unique_per_unordered_pair() {
        let pool = setup_pool().await;
        let repo = SqlDuplicateRepository::new(pool.clone());
        insert_lead(&pool, "L-DUP-A", None).await;
        insert_lead(&pool, "L-DUP-B", None).await;

        let first = pair_fixture("P-1", "L-DUP-A", "L-DUP-B", 0.97);
        assert!(repo.insert_pending_pair(&first).await.expect("insert"));

        // Same unordered pair, opposite orientation, different id.
        let second = pair_fixture("P-2", "L-DUP-B", "L-DUP-A", 0.95);
        assert!(!repo.insert_pending_pair(&second).await.expect("insert"));

        let (suggestions, total) =
            repo.list_suggestions(&TenantId("tenant-1".to_string()), 10, 0).await.expect("list");
        assert_eq!(total, 1);
        assert_eq!(suggestions.len(), 1);
        assert_eq!(suggestions[0].id.0, "P-1");

        pool.close().await;
    }

    #[tokio::test]
    async fn resolving_a_pair_permits_a_fresh_detection_later() {
        let pool = setup_pool().await;
        let repo = SqlDuplicateRepository::new(pool.clone());
        let tenant = TenantId("tenant-1".to_string());
        insert_lead(&pool, "L-RES-A", None).await;
        insert_lead(&pool, "L-RES-B", None).await;

        let pair = pair_fixture("P-RES-1", "L-RES-A", "L-RES-B", 0.8);
        repo.insert_pending_pair(&pair).await.expect("insert");

        let resolver = UserId("U-REVIEWER".to_string());
        assert!(repo.resolve_not_duplicate(&tenant, &pair.id, &resolver).await.expect("resolve"));
        // Terminal states reject re-resolution.
        assert!(!repo.resolve_not_duplicate(&tenant, &pair.id, &resolver).await.expect("resolve"));

        let resolved = repo.find_pair(&tenant, &pair.id).await.expect("find").expect("present");
        assert_eq!(resolved.status, PairStatus::NotDuplicate);
        assert_eq!(resolved.resolved_by, Some(resolver));

        // A new pair for the same leads is allowed once the old one is terminal.
        let fresh = pair_fixture("P-RES-2", "L-RES-A", "L-RES-B", 0.85);
        assert!(repo.insert_pending_pair(&fresh).await.expect("insert fresh"));

        pool.close().await;
    }

    #[tokio::test]
    async fn suggestions_are_sorted_by_confidence_and_paged() {
        let pool = setup_pool().await;
        let repo = SqlDuplicateRepository::new(pool.clone());
        let tenant = TenantId("tenant-1".to_string());
        for id in ["L-SUG-1", "L-SUG-2", "L-SUG-3", "L-SUG-4"] {
            insert_lead(&pool, id, None).await;
        }

        repo.insert_pending_pair(&pair_fixture("P-LOW", "L-SUG-1", "L-SUG-2", 0.76))
            .await
            .expect("insert");
        repo.insert_pending_pair(&pair_fixture("P-HIGH", "L-SUG-3", "L-SUG-4", 0.97))
            .await
            .expect("insert");
        repo.insert_pending_pair(&pair_fixture("P-MID", "L-SUG-1", "L-SUG-3", 0.85))
            .await
            .expect("insert");

        let (page, total) = repo.list_suggestions(&tenant, 2, 0).await.expect("page");
        assert_eq!(total, 3);
        let ids: Vec<&str> = page.iter().map(|pair| pair.id.0.as_str()).collect();
        assert_eq!(ids, vec!["P-HIGH", "P-MID"]);

        let (rest, _) = repo.list_suggestions(&tenant, 2, 2).await.expect("page");
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].id.0, "P-LOW");

        pool.close().await;
    }

    #[tokio::test]
    async fn merge_reparents_children_tombstones_and_records_history() {
        let pool = setup_pool().await;
        let repo = SqlDuplicateRepository::new(pool.clone());
        let tenant = TenantId("tenant-1".to_string());

        let survivor = insert_lead(&pool, "L-MERGE-A", Some("j@x.com")).await;
        let merged = insert_lead(&pool, "L-MERGE-B", Some("j@x.com")).await;
        insert_child_rows(&pool, "L-MERGE-B").await;

        let pair = pair_fixture("P-MERGE-1", "L-MERGE-A", "L-MERGE-B", 0.97);
        repo.insert_pending_pair(&pair).await.expect("insert pair");

        let mut overrides = BTreeMap::new();
        overrides.insert("phone".to_string(), "+1 555 0100".to_string());

        let record = repo
            .merge_leads(&tenant, &survivor.id, &merged.id, &overrides, &UserId("U-1".to_string()))
            .await
            .expect("merge");
        assert_eq!(record.survivor_lead_id, survivor.id);
        assert_eq!(record.merged_lead_id, merged.id);

        // No child row may still reference the merged lead.
        for table in ["activity", "communication", "opportunity"] {
            assert_eq!(count_children(&pool, table, "L-MERGE-B").await, 0);
            assert_eq!(count_children(&pool, table, "L-MERGE-A").await, 1);
        }

        let lead_repo = SqlLeadRepository::new(pool.clone());
        let tombstone =
            lead_repo.find_by_id(&tenant, &merged.id).await.expect("find").expect("present");
        assert!(tombstone.is_archived);
        assert_eq!(tombstone.merged_into_id, Some(survivor.id.clone()));

        let updated_survivor =
            lead_repo.find_by_id(&tenant, &survivor.id).await.expect("find").expect("present");
        assert_eq!(updated_survivor.phone.as_deref(), Some("+1 555 0100"));
        assert!(!updated_survivor.is_archived);

        let resolved_pair =
            repo.find_pair(&tenant, &pair.id).await.expect("find").expect("present");
        assert_eq!(resolved_pair.status, PairStatus::Merged);

        let history = repo.merge_history(&tenant, None).await.expect("history");
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].id, record.id);
        assert_eq!(history[0].field_snapshot["merged"]["email"], "j@x.com");

        pool.close().await;
    }

    #[tokio::test]
    async fn self_merge_and_archived_targets_are_rejected() {
        let pool = setup_pool().await;
        let repo = SqlDuplicateRepository::new(pool.clone());
        let tenant = TenantId("tenant-1".to_string());
        let user = UserId("U-1".to_string());

        let lead = insert_lead(&pool, "L-SELF-A", None).await;
        let error = repo
            .merge_leads(&tenant, &lead.id, &lead.id, &BTreeMap::new(), &user)
            .await
            .expect_err("self merge");
        assert!(matches!(error, MergeError::SelfMerge));

        let gone = insert_lead(&pool, "L-SELF-B", None).await;
        sqlx::query("UPDATE lead SET is_archived = 1 WHERE id = 'L-SELF-B'")
            .execute(&pool)
            .await
            .expect("archive");
        let error = repo
            .merge_leads(&tenant, &lead.id, &gone.id, &BTreeMap::new(), &user)
            .await
            .expect_err("merge into archived");
        assert!(matches!(error, MergeError::LeadArchived(_)));

        let error = repo
            .merge_leads(&tenant, &lead.id, &LeadId("L-NOPE".to_string()), &BTreeMap::new(), &user)
            .await
            .expect_err("merge missing lead");
        assert!(matches!(error, MergeError::LeadNotFound(_)));

        pool.close().await;
    }

    #[tokio::test]
    async fn unknown_override_field_is_rejected_before_any_mutation() {
        let pool = setup_pool().await;
        let repo = SqlDuplicateRepository::new(pool.clone());
        let tenant = TenantId("tenant-1".to_string());

        let survivor = insert_lead(&pool, "L-OVR-A", None).await;
        let merged = insert_lead(&pool, "L-OVR-B", None).await;

        let mut overrides = BTreeMap::new();
        overrides.insert("score".to_string(), "999".to_string());

        let error = repo
            .merge_leads(&tenant, &survivor.id, &merged.id, &overrides, &UserId("U-1".to_string()))
            .await
            .expect_err("unknown override");
        assert!(matches!(error, MergeError::UnknownOverrideField(_)));

        let lead_repo = SqlLeadRepository::new(pool.clone());
        let untouched =
            lead_repo.find_by_id(&tenant, &merged.id).await.expect("find").expect("present");
        assert!(!untouched.is_archived, "rejected merge must leave both leads untouched");

        pool.close().await;
    }
}
