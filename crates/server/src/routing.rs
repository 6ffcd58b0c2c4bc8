//! Assignment endpoints: automatic routing, manual overrides, and the
//! rule/member administration surface.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use leadflow_core::conditions::{ConditionSet, RuleEvaluationIssue};
use leadflow_core::domain::assignment::{
    AssignmentMember, AssignmentMemberId, AssignmentResult, AssignmentRule, AssignmentRuleId,
    AssignmentStrategy,
};
use leadflow_core::domain::lead::{LeadId, TenantId, UserId};
use leadflow_core::errors::DomainError;
use leadflow_core::routing::{AssignmentEngine, RoutingOutcome};
use leadflow_db::repositories::{
    AssignmentCommit, LeadStore, SqlAssignmentRepository, SqlLeadRepository,
};
use leadflow_db::DbPool;

use crate::api::{bad_request, not_found, ErrorResponse, ServiceError, Tenant};

#[derive(Clone)]
pub struct RoutingState {
    pool: DbPool,
    max_assign_attempts: u32,
}

pub fn router(pool: DbPool, max_assign_attempts: u32) -> Router {
    let state = RoutingState { pool, max_assign_attempts };

    Router::new()
        .route("/api/v1/leads/{lead_id}/assign", axum::routing::post(auto_assign))
        .route("/api/v1/assignments/manual", axum::routing::post(manual_assign))
        .route("/api/v1/assignment-rules", get(list_rules).post(create_rule))
        .route(
            "/api/v1/assignment-rules/{rule_id}",
            get(get_rule).put(update_rule).delete(delete_rule),
        )
        .route(
            "/api/v1/assignment-rules/{rule_id}/members",
            get(list_members).post(create_member),
        )
        .route(
            "/api/v1/assignment-rules/{rule_id}/members/{member_id}",
            axum::routing::put(update_member).delete(delete_member),
        )
        .with_state(state)
}

/// Outcome of one auto-assignment request.
#[derive(Clone, Debug, PartialEq)]
pub enum AutoAssignOutcome {
    Assigned(AssignmentResult),
    /// No active rule matched; the caller decides the fallback.
    NoRuleMatched,
}

/// Evaluate-and-commit loop with a bounded optimistic retry budget. Every
/// attempt re-reads the lead and rule state, so a conflict caused by a
/// concurrent assignment, member edit, or archive is decided against fresh
/// data rather than replayed blindly.
pub async fn run_auto_assign(
    pool: &DbPool,
    tenant_id: &TenantId,
    lead_id: &LeadId,
    max_attempts: u32,
) -> Result<AutoAssignOutcome, ServiceError> {
    let leads = SqlLeadRepository::new(pool.clone());
    let rules_repo = SqlAssignmentRepository::new(pool.clone());
    let engine = AssignmentEngine::new();

    for attempt in 1..=max_attempts {
        let lead = leads
            .find_by_id(tenant_id, lead_id)
            .await?
            .ok_or_else(|| DomainError::not_found("lead", lead_id.0.clone()))?;
        if lead.is_archived {
            return Err(DomainError::LeadArchived(lead_id.0.clone()).into());
        }

        let signals = leads.load_signals(tenant_id, lead_id).await?;
        let rules = rules_repo.list_active_rules_with_members(tenant_id).await?;

        let (outcome, issues) = engine.decide(&lead, &signals, &rules);
        log_rule_issues("assignment", &issues);

        let decision = match outcome {
            RoutingOutcome::NoRuleMatched => return Ok(AutoAssignOutcome::NoRuleMatched),
            RoutingOutcome::Assigned(decision) => decision,
        };

        match rules_repo.commit_auto_assignment(tenant_id, lead_id, &decision).await? {
            AssignmentCommit::Applied(result) => {
                info!(
                    event_name = "routing.assignment.applied",
                    lead_id = %lead_id.0,
                    rule_id = %decision.rule_id.0,
                    assignee = %result.assigned_to.0,
                    strategy = decision.strategy.as_str(),
                    attempt,
                    "lead assigned"
                );
                return Ok(AutoAssignOutcome::Assigned(result));
            }
            AssignmentCommit::Conflict => {
                warn!(
                    event_name = "routing.assignment.conflict",
                    lead_id = %lead_id.0,
                    rule_id = %decision.rule_id.0,
                    attempt,
                    "assignment commit lost the version race; retrying"
                );
            }
        }
    }

    Err(DomainError::ConcurrencyConflict {
        resource: format!("assignment routing state for lead `{}`", lead_id.0),
        attempts: max_attempts,
    }
    .into())
}

pub(crate) fn log_rule_issues(engine: &str, issues: &[RuleEvaluationIssue]) {
    for issue in issues {
        warn!(
            event_name = "rules.evaluation.skipped",
            engine,
            rule_id = %issue.rule_id,
            rule_name = %issue.rule_name,
            error = %issue.error,
            "rule condition failed to evaluate; treated as non-matching"
        );
    }
}

async fn auto_assign(
    Path(lead_id): Path<String>,
    Tenant(tenant_id): Tenant,
    State(state): State<RoutingState>,
) -> Result<Response, ErrorResponse> {
    let lead_id = LeadId(lead_id);
    let outcome =
        run_auto_assign(&state.pool, &tenant_id, &lead_id, state.max_assign_attempts)
            .await
            .map_err(ServiceError::into_response)?;

    match outcome {
        AutoAssignOutcome::Assigned(result) => Ok(Json(result).into_response()),
        AutoAssignOutcome::NoRuleMatched => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

#[derive(Debug, Deserialize)]
struct ManualAssignRequest {
    lead_id: String,
    user_id: String,
}

async fn manual_assign(
    Tenant(tenant_id): Tenant,
    State(state): State<RoutingState>,
    Json(payload): Json<ManualAssignRequest>,
) -> Result<Json<AssignmentResult>, ErrorResponse> {
    if payload.user_id.trim().is_empty() {
        return Err(bad_request("user_id must not be empty"));
    }
    let lead_id = LeadId(payload.lead_id);
    let user_id = UserId(payload.user_id);

    let repo = SqlAssignmentRepository::new(state.pool.clone());
    let result = repo
        .record_manual_assignment(&tenant_id, &lead_id, &user_id)
        .await
        .map_err(|error| ServiceError::from(error).into_response())?;

    match result {
        Some(result) => {
            info!(
                event_name = "routing.assignment.manual",
                lead_id = %lead_id.0,
                assignee = %result.assigned_to.0,
                "lead assigned manually"
            );
            Ok(Json(result))
        }
        None => {
            // Distinguish a missing lead from an archived one for the caller.
            let leads = SqlLeadRepository::new(state.pool.clone());
            let lead = leads
                .find_by_id(&tenant_id, &lead_id)
                .await
                .map_err(|error| ServiceError::from(error).into_response())?;
            match lead {
                Some(_) => Err(bad_request(format!("lead `{}` is archived", lead_id.0))),
                None => Err(not_found(format!("lead `{}` was not found", lead_id.0))),
            }
        }
    }
}

fn default_conditions() -> serde_json::Value {
    json!([])
}

fn default_true() -> bool {
    true
}

fn default_priority() -> i64 {
    100
}

#[derive(Debug, Deserialize)]
struct RuleRequest {
    name: String,
    strategy: String,
    #[serde(default = "default_priority")]
    priority: i64,
    #[serde(default = "default_conditions")]
    conditions: serde_json::Value,
    #[serde(default = "default_true")]
    is_active: bool,
}

fn parse_rule_request(payload: &RuleRequest) -> Result<(AssignmentStrategy, ConditionSet), ErrorResponse> {
    if payload.name.trim().is_empty() {
        return Err(bad_request("rule name must not be empty"));
    }
    let strategy = AssignmentStrategy::parse(&payload.strategy).ok_or_else(|| {
        bad_request(format!(
            "unknown strategy `{}` (expected round_robin|territory|load_balanced)",
            payload.strategy
        ))
    })?;
    let condition_set = ConditionSet::parse_json(&payload.conditions.to_string())
        .map_err(|error| bad_request(error.to_string()))?;
    Ok((strategy, condition_set))
}

async fn create_rule(
    Tenant(tenant_id): Tenant,
    State(state): State<RoutingState>,
    Json(payload): Json<RuleRequest>,
) -> Result<(StatusCode, Json<AssignmentRule>), ErrorResponse> {
    let (strategy, condition_set) = parse_rule_request(&payload)?;

    let now = Utc::now();
    let rule = AssignmentRule {
        id: AssignmentRuleId(Uuid::new_v4().to_string()),
        tenant_id,
        name: payload.name.trim().to_string(),
        strategy,
        priority: payload.priority,
        condition_set,
        is_active: payload.is_active,
        round_robin_cursor: 0,
        version: 1,
        created_at: now,
        updated_at: now,
    };

    SqlAssignmentRepository::new(state.pool.clone())
        .create_rule(&rule)
        .await
        .map_err(|error| ServiceError::from(error).into_response())?;

    Ok((StatusCode::CREATED, Json(rule)))
}

async fn list_rules(
    Tenant(tenant_id): Tenant,
    State(state): State<RoutingState>,
) -> Result<Json<Vec<AssignmentRule>>, ErrorResponse> {
    let rules = SqlAssignmentRepository::new(state.pool.clone())
        .list_rules(&tenant_id)
        .await
        .map_err(|error| ServiceError::from(error).into_response())?;
    Ok(Json(rules))
}

async fn get_rule(
    Path(rule_id): Path<String>,
    Tenant(tenant_id): Tenant,
    State(state): State<RoutingState>,
) -> Result<Json<AssignmentRule>, ErrorResponse> {
    let rule = SqlAssignmentRepository::new(state.pool.clone())
        .find_rule(&tenant_id, &AssignmentRuleId(rule_id.clone()))
        .await
        .map_err(|error| ServiceError::from(error).into_response())?
        .ok_or_else(|| not_found(format!("assignment rule `{rule_id}` was not found")))?;
    Ok(Json(rule))
}

async fn update_rule(
    Path(rule_id): Path<String>,
    Tenant(tenant_id): Tenant,
    State(state): State<RoutingState>,
    Json(payload): Json<RuleRequest>,
) -> Result<Json<AssignmentRule>, ErrorResponse> {
    let (strategy, condition_set) = parse_rule_request(&payload)?;
    let repo = SqlAssignmentRepository::new(state.pool.clone());
    let rule_id = AssignmentRuleId(rule_id);

    let mut rule = repo
        .find_rule(&tenant_id, &rule_id)
        .await
        .map_err(|error| ServiceError::from(error).into_response())?
        .ok_or_else(|| not_found(format!("assignment rule `{}` was not found", rule_id.0)))?;

    rule.name = payload.name.trim().to_string();
    rule.strategy = strategy;
    rule.priority = payload.priority;
    rule.condition_set = condition_set;
    rule.is_active = payload.is_active;

    repo.update_rule(&rule).await.map_err(|error| ServiceError::from(error).into_response())?;

    let reloaded = repo
        .find_rule(&tenant_id, &rule_id)
        .await
        .map_err(|error| ServiceError::from(error).into_response())?
        .ok_or_else(|| not_found(format!("assignment rule `{}` was not found", rule_id.0)))?;
    Ok(Json(reloaded))
}

async fn delete_rule(
    Path(rule_id): Path<String>,
    Tenant(tenant_id): Tenant,
    State(state): State<RoutingState>,
) -> Result<StatusCode, ErrorResponse> {
    let deleted = SqlAssignmentRepository::new(state.pool.clone())
        .delete_rule(&tenant_id, &AssignmentRuleId(rule_id.clone()))
        .await
        .map_err(|error| ServiceError::from(error).into_response())?;

    if deleted {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(not_found(format!("assignment rule `{rule_id}` was not found")))
    }
}

#[derive(Debug, Deserialize)]
struct MemberRequest {
    user_id: String,
    #[serde(default)]
    territory: Option<String>,
    #[serde(default)]
    capacity: i64,
    #[serde(default = "default_true")]
    is_active: bool,
}

/// Members are addressed through their rule, so every member operation
/// verifies the rule belongs to the caller's tenant first; a cross-tenant
/// rule id is indistinguishable from a missing one.
async fn require_rule(
    repo: &SqlAssignmentRepository,
    tenant_id: &TenantId,
    rule_id: &AssignmentRuleId,
) -> Result<AssignmentRule, ErrorResponse> {
    repo.find_rule(tenant_id, rule_id)
        .await
        .map_err(|error| ServiceError::from(error).into_response())?
        .ok_or_else(|| not_found(format!("assignment rule `{}` was not found", rule_id.0)))
}

async fn create_member(
    Path(rule_id): Path<String>,
    Tenant(tenant_id): Tenant,
    State(state): State<RoutingState>,
    Json(payload): Json<MemberRequest>,
) -> Result<(StatusCode, Json<AssignmentMember>), ErrorResponse> {
    if payload.user_id.trim().is_empty() {
        return Err(bad_request("user_id must not be empty"));
    }
    if payload.capacity < 0 {
        return Err(bad_request("capacity must not be negative"));
    }

    let repo = SqlAssignmentRepository::new(state.pool.clone());
    let rule_id = AssignmentRuleId(rule_id);
    require_rule(&repo, &tenant_id, &rule_id).await?;

    let now = Utc::now();
    let member = AssignmentMember {
        id: AssignmentMemberId(Uuid::new_v4().to_string()),
        rule_id,
        user_id: UserId(payload.user_id.trim().to_string()),
        territory: payload.territory.filter(|value| !value.trim().is_empty()),
        capacity: payload.capacity,
        current_load: 0,
        is_active: payload.is_active,
        version: 1,
        created_at: now,
        updated_at: now,
    };

    repo.create_member(&member)
        .await
        .map_err(|error| ServiceError::from(error).into_response())?;

    Ok((StatusCode::CREATED, Json(member)))
}

async fn list_members(
    Path(rule_id): Path<String>,
    Tenant(tenant_id): Tenant,
    State(state): State<RoutingState>,
) -> Result<Json<Vec<AssignmentMember>>, ErrorResponse> {
    let repo = SqlAssignmentRepository::new(state.pool.clone());
    let rule_id = AssignmentRuleId(rule_id);
    require_rule(&repo, &tenant_id, &rule_id).await?;

    let members = repo
        .list_members(&rule_id)
        .await
        .map_err(|error| ServiceError::from(error).into_response())?;
    Ok(Json(members))
}

async fn update_member(
    Path((rule_id, member_id)): Path<(String, String)>,
    Tenant(tenant_id): Tenant,
    State(state): State<RoutingState>,
    Json(payload): Json<MemberRequest>,
) -> Result<Json<AssignmentMember>, ErrorResponse> {
    if payload.user_id.trim().is_empty() {
        return Err(bad_request("user_id must not be empty"));
    }
    if payload.capacity < 0 {
        return Err(bad_request("capacity must not be negative"));
    }

    let repo = SqlAssignmentRepository::new(state.pool.clone());
    let rule_id = AssignmentRuleId(rule_id);
    let member_id = AssignmentMemberId(member_id);
    require_rule(&repo, &tenant_id, &rule_id).await?;

    let mut member = repo
        .find_member(&rule_id, &member_id)
        .await
        .map_err(|error| ServiceError::from(error).into_response())?
        .ok_or_else(|| not_found(format!("assignment member `{}` was not found", member_id.0)))?;

    member.user_id = UserId(payload.user_id.trim().to_string());
    member.territory = payload.territory.filter(|value| !value.trim().is_empty());
    member.capacity = payload.capacity;
    member.is_active = payload.is_active;

    repo.update_member(&member)
        .await
        .map_err(|error| ServiceError::from(error).into_response())?;

    let reloaded = repo
        .find_member(&rule_id, &member_id)
        .await
        .map_err(|error| ServiceError::from(error).into_response())?
        .ok_or_else(|| not_found(format!("assignment member `{}` was not found", member_id.0)))?;
    Ok(Json(reloaded))
}

async fn delete_member(
    Path((rule_id, member_id)): Path<(String, String)>,
    Tenant(tenant_id): Tenant,
    State(state): State<RoutingState>,
) -> Result<StatusCode, ErrorResponse> {
    let repo = SqlAssignmentRepository::new(state.pool.clone());
    let rule_id = AssignmentRuleId(rule_id);
    require_rule(&repo, &tenant_id, &rule_id).await?;

    let deleted = repo
        .delete_member(&rule_id, &AssignmentMemberId(member_id.clone()))
        .await
        .map_err(|error| ServiceError::from(error).into_response())?;

    if deleted {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(not_found(format!("assignment member `{member_id}` was not found")))
    }
}
