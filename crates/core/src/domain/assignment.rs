use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::conditions::ConditionSet;
use crate::domain::lead::{LeadId, TenantId, UserId};

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AssignmentRuleId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AssignmentMemberId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AssignmentResultId(pub String);

impl std::fmt::Display for AssignmentRuleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How a rule picks an assignee among its members.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStrategy {
    RoundRobin,
    Territory,
    LoadBalanced,
}

impl AssignmentStrategy {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "round_robin" => Some(Self::RoundRobin),
            "territory" => Some(Self::Territory),
            "load_balanced" => Some(Self::LoadBalanced),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RoundRobin => "round_robin",
            Self::Territory => "territory",
            Self::LoadBalanced => "load_balanced",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AssignmentRule {
    pub id: AssignmentRuleId,
    pub tenant_id: TenantId,
    pub name: String,
    pub strategy: AssignmentStrategy,
    /// Lower priority is evaluated first; ties break by id.
    pub priority: i64,
    pub condition_set: ConditionSet,
    pub is_active: bool,
    pub round_robin_cursor: i64,
    /// Optimistic-concurrency token guarding cursor mutation.
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AssignmentMember {
    pub id: AssignmentMemberId,
    pub rule_id: AssignmentRuleId,
    pub user_id: UserId,
    /// Normalized geographic value matched against the lead's city, state, or
    /// country by the territory strategy.
    pub territory: Option<String>,
    pub capacity: i64,
    pub current_load: i64,
    pub is_active: bool,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One assignment decision, append-only.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AssignmentResult {
    pub id: AssignmentResultId,
    pub tenant_id: TenantId,
    pub lead_id: LeadId,
    pub assigned_to: UserId,
    /// None when the assignment was made manually, bypassing rule evaluation.
    pub rule_id: Option<AssignmentRuleId>,
    pub strategy: Option<AssignmentStrategy>,
    pub assigned_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::AssignmentStrategy;

    #[test]
    fn strategy_round_trips_through_strings() {
        for strategy in [
            AssignmentStrategy::RoundRobin,
            AssignmentStrategy::Territory,
            AssignmentStrategy::LoadBalanced,
        ] {
            assert_eq!(AssignmentStrategy::parse(strategy.as_str()), Some(strategy));
        }
        assert_eq!(AssignmentStrategy::parse("random"), None);
    }
}
