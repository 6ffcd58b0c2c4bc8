use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::lead::{LeadId, TenantId, UserId};

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DuplicatePairId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MergeHistoryId(pub String);

/// Lifecycle of a suspected duplicate pair. Pending is the only non-terminal
/// state; resolved pairs never reopen, a materially new detection creates a
/// fresh pair instead.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PairStatus {
    Pending,
    NotDuplicate,
    Merged,
}

impl PairStatus {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(Self::Pending),
            "not_duplicate" => Some(Self::NotDuplicate),
            "merged" => Some(Self::Merged),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::NotDuplicate => "not_duplicate",
            Self::Merged => "merged",
        }
    }
}

/// Lead field that contributed to a match.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchedField {
    Email,
    Phone,
    Name,
    Company,
}

impl MatchedField {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "email" => Some(Self::Email),
            "phone" => Some(Self::Phone),
            "name" => Some(Self::Name),
            "company" => Some(Self::Company),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Phone => "phone",
            Self::Name => "name",
            Self::Company => "company",
        }
    }
}

/// Orders two lead ids so the smaller one is always `lead_a`, collapsing the
/// symmetric (A, B) / (B, A) encodings of the same pair.
pub fn ordered_pair(left: LeadId, right: LeadId) -> (LeadId, LeadId) {
    if left <= right {
        (left, right)
    } else {
        (right, left)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DuplicatePair {
    pub id: DuplicatePairId,
    pub tenant_id: TenantId,
    pub lead_a_id: LeadId,
    pub lead_b_id: LeadId,
    pub confidence: f64,
    pub matched_fields: Vec<MatchedField>,
    pub status: PairStatus,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<UserId>,
}

/// Append-only record of one merge, created atomically with it. The field
/// snapshot preserves both leads' full pre-merge values for audit and manual
/// rollback.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MergeRecord {
    pub id: MergeHistoryId,
    pub tenant_id: TenantId,
    pub survivor_lead_id: LeadId,
    pub merged_lead_id: LeadId,
    pub field_snapshot: serde_json::Value,
    pub performed_by: UserId,
    pub merged_at: DateTime<Utc>,
}
