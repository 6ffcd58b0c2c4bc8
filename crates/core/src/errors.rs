use thiserror::Error;

/// Domain-level failure taxonomy shared by the three engines. `NoRuleMatched`
/// is deliberately absent: it is a normal routing outcome, not an error.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("{entity} `{id}` was not found")]
    NotFound { entity: &'static str, id: String },
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("lead `{0}` is archived")]
    LeadArchived(String),
    #[error("a lead cannot be merged into itself")]
    SelfMerge,
    #[error("duplicate pair is already resolved as {status}")]
    PairAlreadyResolved { status: String },
    #[error("{resource} was concurrently modified; gave up after {attempts} attempts")]
    ConcurrencyConflict { resource: String, attempts: u32 },
    #[error("merge failed and was rolled back: {0}")]
    MergeFailed(String),
}

impl DomainError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound { entity, id: id.into() }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }
}
