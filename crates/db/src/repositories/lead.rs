use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row};

use leadflow_core::domain::lead::{Lead, LeadId, LeadSignals, LeadStatus, TenantId, UserId};

use super::{LeadStore, RepositoryError};
use crate::DbPool;

const LEAD_COLUMNS: &str = "id, tenant_id, email, phone, first_name, last_name, company, \
     city, state, country, status, assigned_to, score, is_archived, merged_into_id, \
     created_at, updated_at";

pub struct SqlLeadRepository {
    pool: DbPool,
}

impl SqlLeadRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Activity-derived signals observed by condition sets.
    pub async fn load_signals(
        &self,
        tenant_id: &TenantId,
        id: &LeadId,
    ) -> Result<LeadSignals, RepositoryError> {
        let row = sqlx::query(
            "SELECT
                SUM(CASE WHEN is_completed = 1 THEN 1 ELSE 0 END) AS activity_count,
                SUM(CASE WHEN kind = 'email_open' THEN 1 ELSE 0 END) AS email_open_count
             FROM activity
             WHERE tenant_id = ? AND lead_id = ?",
        )
        .bind(&tenant_id.0)
        .bind(&id.0)
        .fetch_one(&self.pool)
        .await?;

        Ok(LeadSignals {
            activity_count: row.try_get::<Option<i64>, _>("activity_count")?.unwrap_or(0),
            email_open_count: row.try_get::<Option<i64>, _>("email_open_count")?.unwrap_or(0),
        })
    }
}

#[async_trait::async_trait]
impl LeadStore for SqlLeadRepository {
    async fn find_by_id(
        &self,
        tenant_id: &TenantId,
        id: &LeadId,
    ) -> Result<Option<Lead>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {LEAD_COLUMNS} FROM lead WHERE tenant_id = ? AND id = ?"))
            .bind(&tenant_id.0)
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.map(lead_from_row).transpose()
    }

    async fn list_active_page(
        &self,
        tenant_id: &TenantId,
        after_id: Option<&LeadId>,
        limit: u32,
    ) -> Result<Vec<Lead>, RepositoryError> {
        let rows = if let Some(after) = after_id {
            sqlx::query(&format!(
                "SELECT {LEAD_COLUMNS} FROM lead
                 WHERE tenant_id = ? AND is_archived = 0 AND id > ?
                 ORDER BY id ASC
                 LIMIT ?"
            ))
            .bind(&tenant_id.0)
            .bind(&after.0)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query(&format!(
                "SELECT {LEAD_COLUMNS} FROM lead
                 WHERE tenant_id = ? AND is_archived = 0
                 ORDER BY id ASC
                 LIMIT ?"
            ))
            .bind(&tenant_id.0)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?
        };

        rows.into_iter().map(lead_from_row).collect()
    }

    async fn insert(&self, lead: &Lead) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO lead (
                id, tenant_id, email, phone, first_name, last_name, company,
                city, state, country, status, assigned_to, score, is_archived,
                merged_into_id, created_at, updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&lead.id.0)
        .bind(&lead.tenant_id.0)
        .bind(lead.email.as_deref())
        .bind(lead.phone.as_deref())
        .bind(lead.first_name.as_deref())
        .bind(lead.last_name.as_deref())
        .bind(lead.company.as_deref())
        .bind(lead.city.as_deref())
        .bind(lead.state.as_deref())
        .bind(lead.country.as_deref())
        .bind(lead.status.as_str())
        .bind(lead.assigned_to.as_ref().map(|user| user.0.as_str()))
        .bind(lead.score)
        .bind(i64::from(lead.is_archived))
        .bind(lead.merged_into_id.as_ref().map(|id| id.0.as_str()))
        .bind(lead.created_at.to_rfc3339())
        .bind(lead.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

pub(crate) fn lead_from_row(row: SqliteRow) -> Result<Lead, RepositoryError> {
    let status_raw = row.try_get::<String, _>("status")?;
    let status = LeadStatus::parse(&status_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown lead status `{status_raw}`")))?;

    Ok(Lead {
        id: LeadId(row.try_get("id")?),
        tenant_id: TenantId(row.try_get("tenant_id")?),
        email: row.try_get("email")?,
        phone: row.try_get("phone")?,
        first_name: row.try_get("first_name")?,
        last_name: row.try_get("last_name")?,
        company: row.try_get("company")?,
        city: row.try_get("city")?,
        state: row.try_get("state")?,
        country: row.try_get("country")?,
        status,
        assigned_to: row.try_get::<Option<String>, _>("assigned_to")?.map(UserId),
        score: row.try_get("score")?,
        is_archived: row.try_get::<i64, _>("is_archived")? != 0,
        merged_into_id: row.try_get::<Option<String>, _>("merged_into_id")?.map(LeadId),
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}

pub(crate) fn parse_timestamp(
    column: &str,
    value: String,
) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(&value).map(|timestamp| timestamp.with_timezone(&Utc)).map_err(
        |error| {
            RepositoryError::Decode(format!("invalid timestamp in `{column}`: `{value}` ({error})"))
        },
    )
}

pub(crate) fn parse_optional_timestamp(
    column: &str,
    value: Option<String>,
) -> Result<Option<DateTime<Utc>>, RepositoryError> {
    value.map(|timestamp| parse_timestamp(column, timestamp)).transpose()
}
