//! Scoring endpoints: on-demand recalculation, the audit-trail reads, the
//! tenant-wide batch recomputation, and scoring-rule administration.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use leadflow_core::conditions::ConditionSet;
use leadflow_core::config::ScoringConfig;
use leadflow_core::domain::lead::{LeadId, TenantId};
use leadflow_core::domain::scoring::{
    RuleBreakdown, ScoreHistoryEntry, ScoringRule, ScoringRuleId,
};
use leadflow_core::errors::DomainError;
use leadflow_core::scoring::ScoringEngine;
use leadflow_db::repositories::{
    LeadStore, SqlCheckpointRepository, SqlLeadRepository, SqlScoringRepository,
};
use leadflow_db::DbPool;

use crate::api::{bad_request, not_found, ErrorResponse, ServiceError, Tenant};
use crate::batch::{BatchReport, CancelFlag};
use crate::routing::log_rule_issues;

#[derive(Clone)]
pub struct ScoringState {
    pool: DbPool,
    floor: Option<i64>,
    batch_size: u32,
}

pub fn router(pool: DbPool, config: &ScoringConfig) -> Router {
    let state = ScoringState { pool, floor: config.floor, batch_size: config.batch_size };

    Router::new()
        .route("/api/v1/leads/{lead_id}/rescore", axum::routing::post(rescore))
        .route("/api/v1/leads/{lead_id}/score-history", get(score_history))
        .route("/api/v1/leads/{lead_id}/score-breakdown", get(score_breakdown))
        .route("/api/v1/scores/recalculate-all", axum::routing::post(recalculate_all))
        .route("/api/v1/scoring-rules", get(list_rules).post(create_rule))
        .route(
            "/api/v1/scoring-rules/{rule_id}",
            get(get_rule).put(update_rule).delete(delete_rule),
        )
        .with_state(state)
}

/// One recalculation pass for one lead. Returns `None` when no rule fired or
/// the firing deltas left the cached score unchanged; nothing is appended in
/// that case, keeping the trail proportional to score-changing events.
pub async fn run_rescore(
    pool: &DbPool,
    tenant_id: &TenantId,
    lead_id: &LeadId,
    floor: Option<i64>,
) -> Result<Option<ScoreHistoryEntry>, ServiceError> {
    let leads = SqlLeadRepository::new(pool.clone());
    let rules_repo = SqlScoringRepository::new(pool.clone());

    let lead = leads
        .find_by_id(tenant_id, lead_id)
        .await?
        .ok_or_else(|| DomainError::not_found("lead", lead_id.0.clone()))?;
    if lead.is_archived {
        return Err(DomainError::LeadArchived(lead_id.0.clone()).into());
    }

    let signals = leads.load_signals(tenant_id, lead_id).await?;
    let rules = rules_repo.list_active_rules(tenant_id).await?;

    let engine = ScoringEngine::new(floor);
    let (computation, issues) = engine.evaluate(&lead, &signals, &rules);
    log_rule_issues("scoring", &issues);

    let Some(computation) = computation else {
        return Ok(None);
    };

    let entry = rules_repo
        .append_history(tenant_id, lead_id, &computation)
        .await?
        // The lead was archived between the read and the write; the
        // transaction refused rather than scoring a tombstone.
        .ok_or_else(|| DomainError::LeadArchived(lead_id.0.clone()))?;

    info!(
        event_name = "scoring.recalculated",
        lead_id = %lead_id.0,
        delta = entry.delta,
        resulting_score = entry.resulting_score,
        fired_rules = entry.contributions.len(),
        "lead rescored"
    );

    Ok(Some(entry))
}

/// Tenant-wide recomputation in id-ordered batches. Every lead is its own
/// transaction; per-lead failures land in the report instead of aborting the
/// run. The checkpoint row makes an interrupted run resume strictly after the
/// last processed lead.
pub async fn run_recalculate_all(
    pool: &DbPool,
    tenant_id: &TenantId,
    floor: Option<i64>,
    batch_size: u32,
    cancel: &CancelFlag,
) -> Result<BatchReport, ServiceError> {
    let leads = SqlLeadRepository::new(pool.clone());
    let checkpoints = SqlCheckpointRepository::new(pool.clone());
    let job = format!("score_recalc:{}", tenant_id.0);

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
                    event_name = "scoring.recalculate_all.cancelled",
                    tenant_id = %tenant_id.0,
                    processed = report.processed,
                    "batch recalculation stopped at the cancellation flag"
                );
                return Ok(report);
            }

            match run_rescore(pool, tenant_id, &lead.id, floor).await {
                Ok(_) => report.record_success(),
                Err(error) => report.record_failure(&lead.id.0, error),
            }
            checkpoints.save(&job, &lead.id.0).await?;
        }

        after = page.last().map(|lead| lead.id.clone());
    }

    info!(
        event_name = "scoring.recalculate_all.finished",
        tenant_id = %tenant_id.0,
        processed = report.processed,
        failed = report.failed,
        "batch recalculation finished"
    );

    Ok(report)
}

async fn rescore(
    Path(lead_id): Path<String>,
    Tenant(tenant_id): Tenant,
    State(state): State<ScoringState>,
) -> Result<Response, ErrorResponse> {
    let entry = run_rescore(&state.pool, &tenant_id, &LeadId(lead_id), state.floor)
        .await
        .map_err(ServiceError::into_response)?;

    match entry {
        Some(entry) => Ok(Json(entry).into_response()),
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

async fn score_history(
    Path(lead_id): Path<String>,
    Tenant(tenant_id): Tenant,
    State(state): State<ScoringState>,
) -> Result<Json<Vec<ScoreHistoryEntry>>, ErrorResponse> {
    let lead_id = require_lead(&state.pool, &tenant_id, lead_id).await?;
    let history = SqlScoringRepository::new(state.pool.clone())
        .history_for_lead(&tenant_id, &lead_id)
        .await
        .map_err(|error| ServiceError::from(error).into_response())?;
    Ok(Json(history))
}

async fn score_breakdown(
    Path(lead_id): Path<String>,
    Tenant(tenant_id): Tenant,
    State(state): State<ScoringState>,
) -> Result<Json<Vec<RuleBreakdown>>, ErrorResponse> {
    let lead_id = require_lead(&state.pool, &tenant_id, lead_id).await?;
    let breakdown = SqlScoringRepository::new(state.pool.clone())
        .breakdown_for_lead(&tenant_id, &lead_id)
        .await
        .map_err(|error| ServiceError::from(error).into_response())?;
    Ok(Json(breakdown))
}

async fn recalculate_all(
    Tenant(tenant_id): Tenant,
    State(state): State<ScoringState>,
) -> Result<Json<BatchReport>, ErrorResponse> {
    let report = run_recalculate_all(
        &state.pool,
        &tenant_id,
        state.floor,
        state.batch_size,
        &CancelFlag::new(),
    )
    .await
    .map_err(ServiceError::into_response)?;
    Ok(Json(report))
}

/// History reads 404 on unknown leads instead of returning an empty trail for
/// an id that never existed (or belongs to another tenant).
async fn require_lead(
    pool: &DbPool,
    tenant_id: &TenantId,
    lead_id: String,
) -> Result<LeadId, ErrorResponse> {
    let lead_id = LeadId(lead_id);
    SqlLeadRepository::new(pool.clone())
        .find_by_id(tenant_id, &lead_id)
        .await
        .map_err(|error| ServiceError::from(error).into_response())?
        .ok_or_else(|| not_found(format!("lead `{}` was not found", lead_id.0)))?;
    Ok(lead_id)
}

fn default_conditions() -> serde_json::Value {
    json!([])
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct ScoringRuleRequest {
    name: String,
    #[serde(default = "default_conditions")]
    conditions: serde_json::Value,
    point_delta: i64,
    #[serde(default = "default_true")]
    is_active: bool,
}

fn parse_scoring_rule_request(
    payload: &ScoringRuleRequest,
) -> Result<ConditionSet, ErrorResponse> {
    if payload.name.trim().is_empty() {
        return Err(bad_request("rule name must not be empty"));
    }
    ConditionSet::parse_json(&payload.conditions.to_string())
        .map_err(|error| bad_request(error.to_string()))
}

async fn create_rule(
    Tenant(tenant_id): Tenant,
    State(state): State<ScoringState>,
    Json(payload): Json<ScoringRuleRequest>,
) -> Result<(StatusCode, Json<ScoringRule>), ErrorResponse> {
    let condition_set = parse_scoring_rule_request(&payload)?;

    let now = Utc::now();
    let rule = ScoringRule {
        id: ScoringRuleId(Uuid::new_v4().to_string()),
        tenant_id,
        name: payload.name.trim().to_string(),
        condition_set,
        point_delta: payload.point_delta,
        is_active: payload.is_active,
        created_at: now,
        updated_at: now,
    };

    SqlScoringRepository::new(state.pool.clone())
        .create_rule(&rule)
        .await
        .map_err(|error| ServiceError::from(error).into_response())?;

    Ok((StatusCode::CREATED, Json(rule)))
}

async fn list_rules(
    Tenant(tenant_id): Tenant,
    State(state): State<ScoringState>,
) -> Result<Json<Vec<ScoringRule>>, ErrorResponse> {
    let rules = SqlScoringRepository::new(state.pool.clone())
        .list_rules(&tenant_id)
        .await
        .map_err(|error| ServiceError::from(error).into_response())?;
    Ok(Json(rules))
}

async fn get_rule(
    Path(rule_id): Path<String>,
    Tenant(tenant_id): Tenant,
    State(state): State<ScoringState>,
) -> Result<Json<ScoringRule>, ErrorResponse> {
    let rule = SqlScoringRepository::new(state.pool.clone())
        .find_rule(&tenant_id, &ScoringRuleId(rule_id.clone()))
        .await
        .map_err(|error| ServiceError::from(error).into_response())?
        .ok_or_else(|| not_found(format!("scoring rule `{rule_id}` was not found")))?;
    Ok(Json(rule))
}

async fn update_rule(
    Path(rule_id): Path<String>,
    Tenant(tenant_id): Tenant,
    State(state): State<ScoringState>,
    Json(payload): Json<ScoringRuleRequest>,
) -> Result<Json<ScoringRule>, ErrorResponse> {
    let condition_set = parse_scoring_rule_request(&payload)?;
    let repo = SqlScoringRepository::new(state.pool.clone());
    let rule_id = ScoringRuleId(rule_id);

    let mut rule = repo
        .find_rule(&tenant_id, &rule_id)
        .await
        .map_err(|error| ServiceError::from(error).into_response())?
        .ok_or_else(|| not_found(format!("scoring rule `{}` was not found", rule_id.0)))?;

    rule.name = payload.name.trim().to_string();
    rule.condition_set = condition_set;
    rule.point_delta = payload.point_delta;
    rule.is_active = payload.is_active;

    repo.update_rule(&rule).await.map_err(|error| ServiceError::from(error).into_response())?;

    let reloaded = repo
        .find_rule(&tenant_id, &rule_id)
        .await
        .map_err(|error| ServiceError::from(error).into_response())?
        .ok_or_else(|| not_found(format!("scoring rule `{}` was not found", rule_id.0)))?;
    Ok(Json(reloaded))
}

async fn delete_rule(
    Path(rule_id): Path<String>,
    Tenant(tenant_id): Tenant,
    State(state): State<ScoringState>,
) -> Result<StatusCode, ErrorResponse> {
    let deleted = SqlScoringRepository::new(state.pool.clone())
        .delete_rule(&tenant_id, &ScoringRuleId(rule_id.clone()))
        .await
        .map_err(|error| ServiceError::from(error).into_response())?;

    if deleted {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(not_found(format!("scoring rule `{rule_id}` was not found")))
    }
}
