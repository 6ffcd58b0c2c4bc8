//! Rule evaluation and assignee selection.
//!
//! The engine is pure: it observes a lead, the tenant's active rules, and
//! each rule's members, and produces either an [`AssignmentDecision`] or
//! [`RoutingOutcome::NoRuleMatched`]. Persisting the decision, including the
//! version-guarded cursor or load mutation, belongs to the repository layer,
//! which reports a conflict when the captured versions went stale so the
//! caller can re-read state and decide again.

use crate::conditions::RuleEvaluationIssue;
use crate::domain::assignment::{
    AssignmentMember, AssignmentMemberId, AssignmentRule, AssignmentRuleId, AssignmentStrategy,
};
use crate::domain::lead::{Lead, LeadSignals, UserId};

/// Everything the repository needs to commit one assignment atomically.
#[derive(Clone, Debug, PartialEq)]
pub struct AssignmentDecision {
    pub rule_id: AssignmentRuleId,
    /// Rule version captured at decision time; the cursor CAS is guarded on it.
    pub rule_version: i64,
    pub strategy: AssignmentStrategy,
    pub member_id: AssignmentMemberId,
    /// Member version captured at decision time; guards the load increment.
    pub member_version: i64,
    pub assignee: UserId,
    /// New cursor value to persist (round-robin and territory strategies).
    pub new_cursor: Option<i64>,
    /// Whether the chosen member's current load must be incremented.
    pub increment_load: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub enum RoutingOutcome {
    Assigned(AssignmentDecision),
    /// A normal outcome, not an error: the caller decides the fallback.
    NoRuleMatched,
}

#[derive(Clone, Debug, Default)]
pub struct AssignmentEngine;

impl AssignmentEngine {
    pub fn new() -> Self {
        Self
    }

    /// Evaluates rules in the order given (priority ascending, id ascending)
    /// and selects an assignee within the first matching rule. Rules whose
    /// condition set fails to evaluate are skipped and reported as issues;
    /// rules without an eligible member are treated as non-matching.
    pub fn decide(
        &self,
        lead: &Lead,
        signals: &LeadSignals,
        rules: &[(AssignmentRule, Vec<AssignmentMember>)],
    ) -> (RoutingOutcome, Vec<RuleEvaluationIssue>) {
        let mut issues = Vec::new();

        for (rule, members) in rules {
            if !rule.is_active {
                continue;
            }

            match rule.condition_set.matches(lead, signals) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(error) => {
                    issues.push(RuleEvaluationIssue {
                        rule_id: rule.id.0.clone(),
                        rule_name: rule.name.clone(),
                        error,
                    });
                    continue;
                }
            }

            if let Some(decision) = select_assignee(rule, members, lead) {
                return (RoutingOutcome::Assigned(decision), issues);
            }
            // Matching rule with no eligible member: fall through to the next
            // rule rather than failing the whole evaluation.
        }

        (RoutingOutcome::NoRuleMatched, issues)
    }
}

fn select_assignee(
    rule: &AssignmentRule,
    members: &[AssignmentMember],
    lead: &Lead,
) -> Option<AssignmentDecision> {
    let mut active: Vec<&AssignmentMember> =
        members.iter().filter(|member| member.is_active).collect();
    if active.is_empty() {
        return None;
    }
    active.sort_by(|a, b| a.id.0.cmp(&b.id.0));

    match rule.strategy {
        AssignmentStrategy::RoundRobin => rotate(rule, &active),
        AssignmentStrategy::Territory => {
            let territories = lead_territories(lead);
            let matching: Vec<&AssignmentMember> = active
                .into_iter()
                .filter(|member| {
                    member
                        .territory
                        .as_deref()
                        .map(|territory| territories.contains(&normalize_territory(territory)))
                        .unwrap_or(false)
                })
                .collect();
            if matching.is_empty() {
                return None;
            }
            rotate(rule, &matching)
        }
        AssignmentStrategy::LoadBalanced => {
            let candidates: Vec<&AssignmentMember> = {
                let with_headroom: Vec<&AssignmentMember> = active
                    .iter()
                    .copied()
                    .filter(|member| member.current_load < member.capacity)
                    .collect();
                // Capacity is a soft constraint: when everyone is saturated,
                // the least-loaded member still gets the lead.
                if with_headroom.is_empty() {
                    active
                } else {
                    with_headroom
                }
            };

            let chosen = candidates.into_iter().min_by(|a, b| {
                load_ratio(a)
                    .partial_cmp(&load_ratio(b))
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.id.0.cmp(&b.id.0))
            })?;

            Some(AssignmentDecision {
                rule_id: rule.id.clone(),
                rule_version: rule.version,
                strategy: rule.strategy,
                member_id: chosen.id.clone(),
                member_version: chosen.version,
                assignee: chosen.user_id.clone(),
                new_cursor: None,
                increment_load: true,
            })
        }
    }
}

/// Round-robin among `candidates` using the rule's persisted cursor. The
/// cursor is clamped into range by modulo so member churn can never leave it
/// pointing past the end.
fn rotate(rule: &AssignmentRule, candidates: &[&AssignmentMember]) -> Option<AssignmentDecision> {
    let count = candidates.len() as i64;
    let index = rule.round_robin_cursor.rem_euclid(count);
    let chosen = candidates[index as usize];

    Some(AssignmentDecision {
        rule_id: rule.id.clone(),
        rule_version: rule.version,
        strategy: rule.strategy,
        member_id: chosen.id.clone(),
        member_version: chosen.version,
        assignee: chosen.user_id.clone(),
        new_cursor: Some((index + 1) % count),
        increment_load: false,
    })
}

fn load_ratio(member: &AssignmentMember) -> f64 {
    member.current_load as f64 / member.capacity.max(1) as f64
}

fn lead_territories(lead: &Lead) -> Vec<String> {
    [&lead.city, &lead.state, &lead.country]
        .into_iter()
        .flatten()
        .map(|value| normalize_territory(value))
        .collect()
}

fn normalize_territory(value: &str) -> String {
    value.trim().to_lowercase()
}
