//! Rule-weighted score computation.
//!
//! Every active rule is evaluated independently against the lead (no early
//! exit, deterministic order by rule id); the fired deltas collapse into one
//! recalculation delta so the audit trail grows with score-changing events,
//! not with rule count.

use crate::conditions::RuleEvaluationIssue;
use crate::domain::lead::{Lead, LeadSignals};
use crate::domain::scoring::{RuleContribution, ScoringRule};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScoreComputation {
    pub delta: i64,
    pub resulting_score: i64,
    pub contributions: Vec<RuleContribution>,
}

#[derive(Clone, Debug, Default)]
pub struct ScoringEngine {
    /// Scores are clamped to this floor when configured.
    floor: Option<i64>,
}

impl ScoringEngine {
    pub fn new(floor: Option<i64>) -> Self {
        Self { floor }
    }

    /// Returns `None` when the pass would not change the cached score:
    /// nothing fired, the deltas cancelled out, or the floor absorbed the
    /// whole change. Rules that fail to evaluate are skipped and reported.
    pub fn evaluate(
        &self,
        lead: &Lead,
        signals: &LeadSignals,
        rules: &[ScoringRule],
    ) -> (Option<ScoreComputation>, Vec<RuleEvaluationIssue>) {
        let mut ordered: Vec<&ScoringRule> =
            rules.iter().filter(|rule| rule.is_active).collect();
        ordered.sort_by(|a, b| a.id.cmp(&b.id));

        let mut issues = Vec::new();
        let mut contributions = Vec::new();

        for rule in ordered {
            match rule.condition_set.matches(lead, signals) {
                Ok(true) => contributions.push(RuleContribution {
                    rule_id: rule.id.clone(),
                    rule_name: rule.name.clone(),
                    delta: rule.point_delta,
                }),
                Ok(false) => {}
                Err(error) => issues.push(RuleEvaluationIssue {
                    rule_id: rule.id.0.clone(),
                    rule_name: rule.name.clone(),
                    error,
                }),
            }
        }

        if contributions.is_empty() {
            return (None, issues);
        }

        let delta: i64 = contributions.iter().map(|contribution| contribution.delta).sum();
        let mut resulting = lead.score.saturating_add(delta);
        if let Some(floor) = self.floor {
            resulting = resulting.max(floor);
        }

        if resulting == lead.score {
            return (None, issues);
        }

        (Some(ScoreComputation { delta, resulting_score: resulting, contributions }), issues)
    }
}
