use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::conditions::ConditionSet;
use crate::domain::lead::{LeadId, TenantId};

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ScoringRuleId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScoreHistoryId(pub String);

impl std::fmt::Display for ScoringRuleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScoringRule {
    pub id: ScoringRuleId,
    pub tenant_id: TenantId,
    pub name: String,
    pub condition_set: ConditionSet,
    pub point_delta: i64,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Which rule contributed how much to one recalculation pass. Carries the
/// rule name as a snapshot so a later rule deletion cannot orphan the
/// breakdown rendering.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleContribution {
    pub rule_id: ScoringRuleId,
    pub rule_name: String,
    pub delta: i64,
}

/// Append-only audit entry. The lead's cached score is always the
/// `resulting_score` of its newest entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScoreHistoryEntry {
    pub id: ScoreHistoryId,
    pub tenant_id: TenantId,
    pub lead_id: LeadId,
    pub delta: i64,
    pub resulting_score: i64,
    pub contributions: Vec<RuleContribution>,
    pub recorded_at: DateTime<Utc>,
}

/// Cumulative per-rule contribution derived by replaying the history log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleBreakdown {
    pub rule_id: ScoringRuleId,
    pub rule_name: String,
    pub total_delta: i64,
    pub times_fired: u32,
}
