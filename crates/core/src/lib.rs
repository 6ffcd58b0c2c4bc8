pub mod conditions;
pub mod config;
pub mod domain;
pub mod errors;
pub mod matching;
pub mod routing;
pub mod scoring;

pub use conditions::{
    Condition, ConditionError, ConditionOperator, ConditionSet, LeadField, RuleEvaluationIssue,
};
pub use domain::assignment::{
    AssignmentMember, AssignmentMemberId, AssignmentResult, AssignmentResultId, AssignmentRule,
    AssignmentRuleId, AssignmentStrategy,
};
pub use domain::duplicate::{
    ordered_pair, DuplicatePair, DuplicatePairId, MatchedField, MergeHistoryId, MergeRecord,
    PairStatus,
};
pub use domain::lead::{Lead, LeadId, LeadSignals, LeadStatus, TenantId, UserId};
pub use domain::scoring::{
    RuleBreakdown, RuleContribution, ScoreHistoryEntry, ScoreHistoryId, ScoringRule, ScoringRuleId,
};
pub use errors::DomainError;
pub use matching::{MatchOutcome, SimilarityMatcher, DEFAULT_PAIR_THRESHOLD};
pub use routing::{AssignmentDecision, AssignmentEngine, RoutingOutcome};
pub use scoring::{ScoreComputation, ScoringEngine};
