//! Field-level similarity between two leads.
//!
//! Exact identity signals (normalized email, digits-only phone) dominate;
//! when neither matches, a token-set Jaccard blend over name and company
//! provides the fuzzy tier. Confidence is the strongest signal observed.

use std::collections::HashSet;

use crate::domain::duplicate::MatchedField;
use crate::domain::lead::Lead;

pub const EMAIL_MATCH_CONFIDENCE: f64 = 0.97;
pub const PHONE_MATCH_CONFIDENCE: f64 = 0.90;
pub const DEFAULT_PAIR_THRESHOLD: f64 = 0.75;

const NAME_WEIGHT: f64 = 0.6;
const COMPANY_WEIGHT: f64 = 0.4;
/// A fuzzy component below this contributes no matched-field label even when
/// the blended confidence clears the pair threshold.
const COMPONENT_FLOOR: f64 = 0.5;
const MIN_PHONE_DIGITS: usize = 7;

#[derive(Clone, Debug, PartialEq)]
pub struct MatchOutcome {
    pub confidence: f64,
    pub matched_fields: Vec<MatchedField>,
}

impl MatchOutcome {
    fn none() -> Self {
        Self { confidence: 0.0, matched_fields: Vec::new() }
    }
}

#[derive(Clone, Debug, Default)]
pub struct SimilarityMatcher;

impl SimilarityMatcher {
    pub fn new() -> Self {
        Self
    }

    /// Symmetric comparison: `compare(a, b) == compare(b, a)`.
    pub fn compare(&self, left: &Lead, right: &Lead) -> MatchOutcome {
        let mut outcome = MatchOutcome::none();

        let email_match = match (
            left.email.as_deref().and_then(normalize_email),
            right.email.as_deref().and_then(normalize_email),
        ) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        };
        if email_match {
            outcome.confidence = outcome.confidence.max(EMAIL_MATCH_CONFIDENCE);
            outcome.matched_fields.push(MatchedField::Email);
        }

        let phone_match = match (
            left.phone.as_deref().and_then(normalize_phone),
            right.phone.as_deref().and_then(normalize_phone),
        ) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        };
        if phone_match {
            outcome.confidence = outcome.confidence.max(PHONE_MATCH_CONFIDENCE);
            outcome.matched_fields.push(MatchedField::Phone);
        }

        let name_similarity = jaccard(&tokens(&left.full_name()), &tokens(&right.full_name()));
        let company_similarity = jaccard(
            &tokens(left.company.as_deref().unwrap_or("")),
            &tokens(right.company.as_deref().unwrap_or("")),
        );
        let blended = name_similarity * NAME_WEIGHT + company_similarity * COMPANY_WEIGHT;

        if blended > outcome.confidence {
            outcome.confidence = blended;
        }
        if name_similarity >= COMPONENT_FLOOR {
            outcome.matched_fields.push(MatchedField::Name);
        }
        if company_similarity >= COMPONENT_FLOOR {
            outcome.matched_fields.push(MatchedField::Company);
        }

        outcome
    }
}

/// Trimmed, lowercased; anything without an `@` is treated as absent.
pub fn normalize_email(raw: &str) -> Option<String> {
    let normalized = raw.trim().to_lowercase();
    (normalized.contains('@')).then_some(normalized)
}

/// Digits only; short fragments carry too little identity to compare.
pub fn normalize_phone(raw: &str) -> Option<String> {
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    (digits.len() >= MIN_PHONE_DIGITS).then_some(digits)
}

fn tokens(value: &str) -> HashSet<String> {
    value
        .split(|c: char| !c.is_alphanumeric())
        .filter(|token| token.len() > 1)
        .map(str::to_lowercase)
        .collect()
}

fn jaccard(left: &HashSet<String>, right: &HashSet<String>) -> f64 {
    if left.is_empty() || right.is_empty() {
        return 0.0;
    }
    let intersection = left.intersection(right).count();
    let union = left.len() + right.len() - intersection;
    intersection as f64 / union as f64
}
