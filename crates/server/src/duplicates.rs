//! Duplicate management endpoints: the per-lead check, the review queue,
//! pair resolution, the merge operation, and the scheduled-sweep entry point.

use axum::extract::{Path, Query, State};
use axum::response::Json;
use axum::routing::get;
use axum::Router;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use leadflow_core::config::DuplicateConfig;
use leadflow_core::domain::duplicate::{
    ordered_pair, DuplicatePair, DuplicatePairId, MergeRecord, PairStatus,
};
use leadflow_core::domain::lead::{LeadId, TenantId, UserId};
use leadflow_core::errors::DomainError;
use leadflow_core::matching::SimilarityMatcher;
use leadflow_db::repositories::{
    LeadStore, MergeError, SqlCheckpointRepository, SqlDuplicateRepository, SqlLeadRepository,
};
use leadflow_db::DbPool;

use crate::api::{bad_request, not_found, CurrentUser, ErrorResponse, ServiceError, Tenant};
use crate::batch::{BatchReport, CancelFlag};

/// Page size for the candidate scan; distinct from the review-queue paging.
const SCAN_PAGE_SIZE: u32 = 500;

#[derive(Clone)]
pub struct DuplicateState {
    pool: DbPool,
    threshold: f64,
    suggestion_page_size: u32,
    sweep_batch_size: u32,
}

pub fn router(pool: DbPool, config: &DuplicateConfig) -> Router {
    let state = DuplicateState {
        pool,
        threshold: config.threshold,
        suggestion_page_size: config.suggestion_page_size,
        sweep_batch_size: config.sweep_batch_size,
    };

    Router::new()
        .route("/api/v1/leads/{lead_id}/duplicates", get(check_lead))
        .route("/api/v1/duplicates/suggestions", get(suggestions))
        .route("/api/v1/duplicates/{pair_id}/resolve", axum::routing::patch(resolve))
        .route("/api/v1/duplicates/merge", axum::routing::post(merge))
        .route("/api/v1/duplicates/sweep", axum::routing::post(sweep))
        .route("/api/v1/duplicates/merge-history", get(merge_history))
        .with_state(state)
}

/// Compares the lead against every other non-archived lead in the tenant and
/// persists pending pairs for candidates at or above the threshold. Returns
/// the pending pairs touching this lead, strongest first. The insert is a
/// no-op for a pair that is already pending, so repeated checks never stack
/// duplicates of a suggestion.
pub async fn run_find_duplicates(
    pool: &DbPool,
    tenant_id: &TenantId,
    lead_id: &LeadId,
    threshold: f64,
) -> Result<Vec<DuplicatePair>, ServiceError> {
    let leads = SqlLeadRepository::new(pool.clone());
    let pairs = SqlDuplicateRepository::new(pool.clone());
    let matcher = SimilarityMatcher::new();

    let lead = leads
        .find_by_id(tenant_id, lead_id)
        .await?
        .ok_or_else(|| DomainError::not_found("lead", lead_id.0.clone()))?;
    if lead.is_archived {
        return Err(DomainError::LeadArchived(lead_id.0.clone()).into());
    }

    let mut after: Option<LeadId> = None;
    loop {
        let page = leads.list_active_page(tenant_id, after.as_ref(), SCAN_PAGE_SIZE).await?;
        if page.is_empty() {
            break;
        }
        after = page.last().map(|candidate| candidate.id.clone());

        for candidate in &page {
            if candidate.id == lead.id {
                continue;
            }

            let outcome = matcher.compare(&lead, candidate);
            if outcome.confidence < threshold {
                continue;
            }

            let (lead_a_id, lead_b_id) = ordered_pair(lead.id.clone(), candidate.id.clone());
            let pair = DuplicatePair {
                id: DuplicatePairId(Uuid::new_v4().to_string()),
                tenant_id: tenant_id.clone(),
                lead_a_id,
                lead_b_id,
                confidence: outcome.confidence,
                matched_fields: outcome.matched_fields,
                status: PairStatus::Pending,
                created_at: Utc::now(),
                resolved_at: None,
                resolved_by: None,
            };

            if pairs.insert_pending_pair(&pair).await? {
                info!(
                    event_name = "duplicates.pair.detected",
                    lead_a = %pair.lead_a_id.0,
                    lead_b = %pair.lead_b_id.0,
                    confidence = pair.confidence,
                    "duplicate candidate recorded"
                );
            }
        }
    }

    Ok(pairs.pending_pairs_for_lead(tenant_id, lead_id).await?)
}

/// Full-tenant duplicate scan in checkpointed batches; each lead's check is
/// its own unit of work, and the cancellation flag is honored between leads.
pub async fn run_sweep(
    pool: &DbPool,
    tenant_id: &TenantId,
    threshold: f64,
    batch_size: u32,
    cancel: &CancelFlag,
) -> Result<BatchReport, ServiceError> {
    let leads = SqlLeadRepository::new(pool.clone());
    let checkpoints = SqlCheckpointRepository::new(pool.clone());
    let job = format!("duplicate_sweep:{}", tenant_id.0);

    let mut report = BatchReport::default();
    let mut after = checkpoints.load(&job).await?.map(LeadId);

    loop {
        let page = leads.list_active_page(tenant_id, after.as_ref(), batch_size).await?;
        if page.is_empty() {
            checkpoints.clear(&job).await?;
            break;
        }

        for lead in &page {
            if cancel.is_cancelled() {
                report.cancelled = true;
                info!(
                    event_name = "duplicates.sweep.cancelled",
                    tenant_id = %tenant_id.0,
                    processed = report.processed,
                    "duplicate sweep stopped at the cancellation flag"
                );
                return Ok(report);
            }

            match run_find_duplicates(pool, tenant_id, &lead.id, threshold).await {
                Ok(_) => report.record_success(),
                Err(error) => report.record_failure(&lead.id.0, error),
            }
            checkpoints.save(&job, &lead.id.0).await?;
        }

        after = page.last().map(|lead| lead.id.clone());
    }

    info!(
        event_name = "duplicates.sweep.finished",
        tenant_id = %tenant_id.0,
        processed = report.processed,
        failed = report.failed,
        "duplicate sweep finished"
    );

    Ok(report)
}

/// Merge orchestration: the repository transaction does the heavy lifting;
/// its failures map onto the domain taxonomy here, with storage failures
/// surfacing as `MergeFailed` (the transaction has already rolled back).
pub async fn run_merge(
    pool: &DbPool,
    tenant_id: &TenantId,
    survivor_id: &LeadId,
    merged_id: &LeadId,
    overrides: &std::collections::BTreeMap<String, String>,
    performed_by: &UserId,
) -> Result<MergeRecord, ServiceError> {
    let record = SqlDuplicateRepository::new(pool.clone())
        .merge_leads(tenant_id, survivor_id, merged_id, overrides, performed_by)
        .await
        .map_err(|error| match error {
            MergeError::LeadNotFound(id) => DomainError::not_found("lead", id),
            MergeError::LeadArchived(id) => DomainError::LeadArchived(id),
            MergeError::SelfMerge => DomainError::SelfMerge,
            MergeError::UnknownOverrideField(field) => {
                DomainError::validation(format!("unknown override field `{field}`"))
            }
            MergeError::Repository(error) => DomainError::MergeFailed(error.to_string()),
        })?;

    info!(
        event_name = "duplicates.merge.applied",
        survivor = %record.survivor_lead_id.0,
        merged = %record.merged_lead_id.0,
        performed_by = %record.performed_by.0,
        "leads merged"
    );

    Ok(record)
}

async fn check_lead(
    Path(lead_id): Path<String>,
    Tenant(tenant_id): Tenant,
    State(state): State<DuplicateState>,
) -> Result<Json<Vec<DuplicatePair>>, ErrorResponse> {
    let pairs = run_find_duplicates(&state.pool, &tenant_id, &LeadId(lead_id), state.threshold)
        .await
        .map_err(ServiceError::into_response)?;
    Ok(Json(pairs))
}

#[derive(Debug, Deserialize)]
struct PageParams {
    limit: Option<u32>,
    offset: Option<u32>,
}

#[derive(Debug, Serialize)]
struct SuggestionPage {
    items: Vec<DuplicatePair>,
    total: i64,
    limit: u32,
    offset: u32,
}

async fn suggestions(
    Query(params): Query<PageParams>,
    Tenant(tenant_id): Tenant,
    State(state): State<DuplicateState>,
) -> Result<Json<SuggestionPage>, ErrorResponse> {
    let limit = params.limit.unwrap_or(state.suggestion_page_size).clamp(1, 500);
    let offset = params.offset.unwrap_or(0);

    let (items, total) = SqlDuplicateRepository::new(state.pool.clone())
        .list_suggestions(&tenant_id, limit, offset)
        .await
        .map_err(|error| ServiceError::from(error).into_response())?;

    Ok(Json(SuggestionPage { items, total, limit, offset }))
}

#[derive(Debug, Deserialize)]
struct ResolveRequest {
    decision: String,
    /// Required when the decision is `merge`: which side of the pair survives.
    #[serde(default)]
    survivor_id: Option<String>,
}

async fn resolve(
    Path(pair_id): Path<String>,
    Tenant(tenant_id): Tenant,
    CurrentUser(user_id): CurrentUser,
    State(state): State<DuplicateState>,
    Json(payload): Json<ResolveRequest>,
) -> Result<Json<DuplicatePair>, ErrorResponse> {
    let repo = SqlDuplicateRepository::new(state.pool.clone());
    let pair_id = DuplicatePairId(pair_id);

    let pair = repo
        .find_pair(&tenant_id, &pair_id)
        .await
        .map_err(|error| ServiceError::from(error).into_response())?
        .ok_or_else(|| not_found(format!("duplicate pair `{}` was not found", pair_id.0)))?;

    if pair.status != PairStatus::Pending {
        return Err(ServiceError::from(DomainError::PairAlreadyResolved {
            status: pair.status.as_str().to_string(),
        })
        .into_response());
    }

    match payload.decision.as_str() {
        "not_duplicate" => {
            let resolved = repo
                .resolve_not_duplicate(&tenant_id, &pair_id, &user_id)
                .await
                .map_err(|error| ServiceError::from(error).into_response())?;
            if !resolved {
                // Lost a race against a concurrent resolution.
                return Err(ServiceError::from(DomainError::PairAlreadyResolved {
                    status: "resolved".to_string(),
                })
                .into_response());
            }
            info!(
                event_name = "duplicates.pair.dismissed",
                pair_id = %pair_id.0,
                resolved_by = %user_id.0,
                "duplicate pair dismissed as not a duplicate"
            );
        }
        "merge" => {
            let survivor_id = payload
                .survivor_id
                .map(LeadId)
                .ok_or_else(|| bad_request("survivor_id is required for a merge decision"))?;
            let merged_id = if survivor_id == pair.lead_a_id {
                pair.lead_b_id.clone()
            } else if survivor_id == pair.lead_b_id {
                pair.lead_a_id.clone()
            } else {
                return Err(bad_request(format!(
                    "survivor `{}` is not part of this pair",
                    survivor_id.0
                )));
            };

            run_merge(
                &state.pool,
                &tenant_id,
                &survivor_id,
                &merged_id,
                &std::collections::BTreeMap::new(),
                &user_id,
            )
            .await
            .map_err(ServiceError::into_response)?;
        }
        other => {
            return Err(bad_request(format!(
                "unknown decision `{other}` (expected not_duplicate|merge)"
            )))
        }
    }

    let reloaded = repo
        .find_pair(&tenant_id, &pair_id)
        .await
        .map_err(|error| ServiceError::from(error).into_response())?
        .ok_or_else(|| not_found(format!("duplicate pair `{}` was not found", pair_id.0)))?;
    Ok(Json(reloaded))
}

#[derive(Debug, Deserialize)]
struct MergeRequest {
    survivor_id: String,
    merged_id: String,
    #[serde(default)]
    overrides: std::collections::BTreeMap<String, String>,
}

async fn merge(
    Tenant(tenant_id): Tenant,
    CurrentUser(user_id): CurrentUser,
    State(state): State<DuplicateState>,
    Json(payload): Json<MergeRequest>,
) -> Result<Json<MergeRecord>, ErrorResponse> {
    let record = run_merge(
        &state.pool,
        &tenant_id,
        &LeadId(payload.survivor_id),
        &LeadId(payload.merged_id),
        &payload.overrides,
        &user_id,
    )
    .await
    .map_err(ServiceError::into_response)?;
    Ok(Json(record))
}

async fn sweep(
    Tenant(tenant_id): Tenant,
    State(state): State<DuplicateState>,
) -> Result<Json<BatchReport>, ErrorResponse> {
    let report = run_sweep(
        &state.pool,
        &tenant_id,
        state.threshold,
        state.sweep_batch_size,
        &CancelFlag::new(),
    )
    .await
    .map_err(ServiceError::into_response)?;
    Ok(Json(report))
}

#[derive(Debug, Deserialize)]
struct MergeHistoryParams {
    lead_id: Option<String>,
}

async fn merge_history(
    Query(params): Query<MergeHistoryParams>,
    Tenant(tenant_id): Tenant,
    State(state): State<DuplicateState>,
) -> Result<Json<Vec<MergeRecord>>, ErrorResponse> {
    let lead_id = params.lead_id.map(LeadId);
    let records = SqlDuplicateRepository::new(state.pool.clone())
        .merge_history(&tenant_id, lead_id.as_ref())
        .await
        .map_err(|error| ServiceError::from(error).into_response())?;
    Ok(Json(records))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::Utc;

    use leadflow_core::domain::duplicate::MatchedField;
    use leadflow_core::domain::lead::{Lead, LeadId, LeadStatus, TenantId, UserId};
    use leadflow_db::repositories::{
        LeadStore, SqlCheckpointRepository, SqlDuplicateRepository, SqlLeadRepository,
    };
    use leadflow_db::{connect_with_settings, migrations, DbPool};

    use crate::batch::CancelFlag;

    use super::{run_find_duplicates, run_merge, run_sweep};

    async fn setup_pool() -> DbPool {
        let pool =
            connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect test pool");
        migrations::run_pending(&pool).await.expect("run migrations");
        pool
    }

    fn tenant() -> TenantId {
        TenantId("tenant-1".to_string())
    }

    fn lead_fixture(id: &str) -> Lead {
        Lead {
            id: LeadId(id.to_string()),
            tenant_id: tenant(),
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
            score: 0,
            is_archived: false,
            merged_into_id: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    async fn insert_lead(pool: &DbPool, id: &str, email: Option<&str>, score: i64) -> Lead {
        let mut lead = lead_fixture(id);
        lead.email = email.map(str::to_string);
        lead.score = score;
        SqlLeadRepository::new(pool.clone()).insert(&lead).await.expect("insert lead");
        lead
    }

    #[tokio::test]
    async fn exact_email_match_is_detected_and_merges_cleanly() {
        let pool = setup_pool().await;

        let lead_a = insert_lead(&pool, "L-A", Some("j@x.com"), 50).await;
        let lead_b = insert_lead(&pool, "L-B", Some("j@x.com"), 30).await;
        sqlx::query(
            "INSERT INTO activity (id, tenant_id, lead_id, kind, is_completed, occurred_at)
             VALUES ('A-B-1', 'tenant-1', 'L-B', 'call', 1, '2026-07-01T10:00:00Z')",
        )
        .execute(&pool)
        .await
        .expect("insert activity");

        let pairs = run_find_duplicates(&pool, &tenant(), &lead_a.id, 0.75)
            .await
            .expect("find duplicates");
        assert_eq!(pairs.len(), 1);
        assert!(pairs[0].confidence >= 0.9, "exact email match is high confidence");
        assert!(pairs[0].matched_fields.contains(&MatchedField::Email));

        let record = run_merge(
            &pool,
            &tenant(),
            &lead_a.id,
            &lead_b.id,
            &BTreeMap::new(),
            &UserId("U-1".to_string()),
        )
        .await
        .expect("merge");
        assert_eq!(record.survivor_lead_id, lead_a.id);

        let leads = SqlLeadRepository::new(pool.clone());
        let tombstone =
            leads.find_by_id(&tenant(), &lead_b.id).await.expect("find").expect("present");
        assert!(tombstone.is_archived);
        assert_eq!(tombstone.merged_into_id, Some(lead_a.id.clone()));

        let moved = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM activity WHERE lead_id = 'L-A'",
        )
        .fetch_one(&pool)
        .await
        .expect("count activities");
        assert_eq!(moved, 1, "the merged lead's activities follow the survivor");

        let history = SqlDuplicateRepository::new(pool.clone())
            .merge_history(&tenant(), None)
            .await
            .expect("history");
        assert_eq!(history.len(), 1);

        pool.close().await;
    }

    #[tokio::test]
    async fn repeated_checks_never_stack_pending_pairs() {
        let pool = setup_pool().await;

        let lead_a = insert_lead(&pool, "L-REP-A", Some("same@x.com"), 0).await;
        insert_lead(&pool, "L-REP-B", Some("same@x.com"), 0).await;

        run_find_duplicates(&pool, &tenant(), &lead_a.id, 0.75).await.expect("first check");
        let pairs =
            run_find_duplicates(&pool, &tenant(), &lead_a.id, 0.75).await.expect("second check");
        assert_eq!(pairs.len(), 1, "one pending pair per unordered lead pair");

        pool.close().await;
    }

    #[tokio::test]
    async fn weak_matches_below_the_threshold_create_nothing() {
        let pool = setup_pool().await;

        let mut lead_a = lead_fixture("L-WEAK-A");
        lead_a.first_name = Some("Amir".to_string());
        lead_a.company = Some("Northwind".to_string());
        SqlLeadRepository::new(pool.clone()).insert(&lead_a).await.expect("insert");
        let mut lead_b = lead_fixture("L-WEAK-B");
        lead_b.first_name = Some("Sofia".to_string());
        lead_b.company = Some("Contoso".to_string());
        SqlLeadRepository::new(pool.clone()).insert(&lead_b).await.expect("insert");

        let pairs =
            run_find_duplicates(&pool, &tenant(), &lead_a.id, 0.75).await.expect("check");
        assert!(pairs.is_empty());

        pool.close().await;
    }

    #[tokio::test]
    async fn archived_leads_are_not_checked() {
        let pool = setup_pool().await;

        let lead = insert_lead(&pool, "L-ARC-A", Some("x@y.com"), 0).await;
        sqlx::query("UPDATE lead SET is_archived = 1 WHERE id = 'L-ARC-A'")
            .execute(&pool)
            .await
            .expect("archive");

        let error = run_find_duplicates(&pool, &tenant(), &lead.id, 0.75)
            .await
            .expect_err("archived lead");
        assert!(error.to_string().contains("is archived"));

        pool.close().await;
    }

    #[tokio::test]
    async fn sweep_covers_every_lead_and_clears_its_checkpoint() {
        let pool = setup_pool().await;

        insert_lead(&pool, "L-SW-1", Some("dup@x.com"), 0).await;
        insert_lead(&pool, "L-SW-2", Some("dup@x.com"), 0).await;
        insert_lead(&pool, "L-SW-3", Some("solo@x.com"), 0).await;

        let report =
            run_sweep(&pool, &tenant(), 0.75, 2, &CancelFlag::new()).await.expect("sweep");
        assert_eq!(report.processed, 3);
        assert_eq!(report.failed, 0);
        assert!(!report.cancelled);

        let (suggestions, total) = SqlDuplicateRepository::new(pool.clone())
            .list_suggestions(&tenant(), 10, 0)
            .await
            .expect("suggestions");
        assert_eq!(total, 1, "the symmetric detection collapses into one pair");
        assert_eq!(suggestions[0].lead_a_id.0, "L-SW-1");
        assert_eq!(suggestions[0].lead_b_id.0, "L-SW-2");

        let checkpoint = SqlCheckpointRepository::new(pool.clone())
            .load("duplicate_sweep:tenant-1")
            .await
            .expect("load checkpoint");
        assert_eq!(checkpoint, None);

        pool.close().await;
    }

    #[tokio::test]
    async fn self_merge_is_rejected() {
        let pool = setup_pool().await;
        let lead = insert_lead(&pool, "L-SELF", None, 0).await;

        let error = run_merge(
            &pool,
            &tenant(),
            &lead.id,
            &lead.id,
            &BTreeMap::new(),
            &UserId("U-1".to_string()),
        )
        .await
        .expect_err("self merge");
        assert!(error.to_string().contains("cannot be merged into itself"));

        pool.close().await;
    }
}
