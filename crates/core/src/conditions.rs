//! Constrained condition grammar shared by assignment and scoring rules.
//!
//! A condition set is a JSON array of `{field, operator, value}` objects
//! AND-ed together; the empty array is a catch-all. This is deliberately not
//! a general expression language: the operator and field vocabularies are
//! closed.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::lead::{Lead, LeadSignals};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeadField {
    Email,
    Phone,
    FirstName,
    LastName,
    Company,
    City,
    State,
    Country,
    Status,
    Score,
    ActivityCount,
    EmailOpenCount,
}

impl LeadField {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Phone => "phone",
            Self::FirstName => "first_name",
            Self::LastName => "last_name",
            Self::Company => "company",
            Self::City => "city",
            Self::State => "state",
            Self::Country => "country",
            Self::Status => "status",
            Self::Score => "score",
            Self::ActivityCount => "activity_count",
            Self::EmailOpenCount => "email_open_count",
        }
    }

    fn is_numeric(&self) -> bool {
        matches!(self, Self::Score | Self::ActivityCount | Self::EmailOpenCount)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Eq,
    Ne,
    Contains,
    IsSet,
    NotSet,
    Gte,
    Lte,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    pub field: LeadField,
    pub operator: ConditionOperator,
    #[serde(default)]
    pub value: String,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ConditionError {
    #[error("could not parse condition set: {0}")]
    Malformed(String),
    #[error("condition on `{field}` expects a numeric value, got `{value}`")]
    NonNumericValue { field: &'static str, value: String },
    #[error("operator is not applicable to text field `{field}`")]
    OperatorNotApplicable { field: &'static str },
}

/// A single rule evaluation failure, reported by the engines instead of
/// aborting evaluation; one bad rule must never block routing or scoring.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuleEvaluationIssue {
    pub rule_id: String,
    pub rule_name: String,
    pub error: ConditionError,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConditionSet(pub Vec<Condition>);

impl ConditionSet {
    pub fn parse_json(raw: &str) -> Result<Self, ConditionError> {
        serde_json::from_str(raw).map_err(|error| ConditionError::Malformed(error.to_string()))
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(&self.0).unwrap_or_else(|_| "[]".to_string())
    }

    /// An empty condition set matches every lead.
    pub fn is_catch_all(&self) -> bool {
        self.0.is_empty()
    }

    /// Evaluates all conditions conjunctively against the lead's attributes
    /// and activity signals.
    pub fn matches(&self, lead: &Lead, signals: &LeadSignals) -> Result<bool, ConditionError> {
        for condition in &self.0 {
            if !evaluate(condition, lead, signals)? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

fn evaluate(
    condition: &Condition,
    lead: &Lead,
    signals: &LeadSignals,
) -> Result<bool, ConditionError> {
    if condition.field.is_numeric() {
        return evaluate_numeric(condition, numeric_value(condition.field, lead, signals));
    }
    evaluate_text(condition, text_value(condition.field, lead))
}

fn numeric_value(field: LeadField, lead: &Lead, signals: &LeadSignals) -> i64 {
    match field {
        LeadField::Score => lead.score,
        LeadField::ActivityCount => signals.activity_count,
        LeadField::EmailOpenCount => signals.email_open_count,
        _ => unreachable!("text field routed to numeric evaluation"),
    }
}

fn text_value(field: LeadField, lead: &Lead) -> Option<String> {
    let raw = match field {
        LeadField::Email => lead.email.clone(),
        LeadField::Phone => lead.phone.clone(),
        LeadField::FirstName => lead.first_name.clone(),
        LeadField::LastName => lead.last_name.clone(),
        LeadField::Company => lead.company.clone(),
        LeadField::City => lead.city.clone(),
        LeadField::State => lead.state.clone(),
        LeadField::Country => lead.country.clone(),
        LeadField::Status => Some(lead.status.as_str().to_string()),
        _ => unreachable!("numeric field routed to text evaluation"),
    };
    raw.map(|value| value.trim().to_lowercase()).filter(|value| !value.is_empty())
}

fn evaluate_numeric(condition: &Condition, actual: i64) -> Result<bool, ConditionError> {
    let expected = condition.value.trim().parse::<i64>().map_err(|_| {
        ConditionError::NonNumericValue {
            field: condition.field.as_str(),
            value: condition.value.clone(),
        }
    });

    match condition.operator {
        ConditionOperator::Eq => Ok(actual == expected?),
        ConditionOperator::Ne => Ok(actual != expected?),
        ConditionOperator::Gte => Ok(actual >= expected?),
        ConditionOperator::Lte => Ok(actual <= expected?),
        ConditionOperator::IsSet => Ok(true),
        ConditionOperator::NotSet => Ok(false),
        ConditionOperator::Contains => {
            Err(ConditionError::OperatorNotApplicable { field: condition.field.as_str() })
        }
    }
}

fn evaluate_text(condition: &Condition, actual: Option<String>) -> Result<bool, ConditionError> {
    let expected = condition.value.trim().to_lowercase();

    let result = match condition.operator {
        ConditionOperator::Eq => actual.as_deref() == Some(expected.as_str()),
        ConditionOperator::Ne => actual.as_deref() != Some(expected.as_str()),
        ConditionOperator::Contains => {
            actual.as_deref().map(|value| value.contains(expected.as_str())).unwrap_or(false)
        }
        ConditionOperator::IsSet => actual.is_some(),
        ConditionOperator::NotSet => actual.is_none(),
        ConditionOperator::Gte | ConditionOperator::Lte => {
            return Err(ConditionError::OperatorNotApplicable { field: condition.field.as_str() })
        }
    };

    Ok(result)
}
