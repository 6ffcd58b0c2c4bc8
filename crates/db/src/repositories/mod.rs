use async_trait::async_trait;
use thiserror::Error;

use leadflow_core::domain::lead::{Lead, LeadId, TenantId};

pub mod assignment;
pub mod checkpoint;
pub mod duplicate;
pub mod lead;
pub mod scoring;

pub use assignment::{AssignmentCommit, SqlAssignmentRepository};
pub use checkpoint::SqlCheckpointRepository;
pub use duplicate::{MergeError, SqlDuplicateRepository};
pub use lead::SqlLeadRepository;
pub use scoring::SqlScoringRepository;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
}

/// The lead-store operations this system consumes from the surrounding CRM
/// layer: lookups, field-scoped updates, and id-cursored listing.
#[async_trait]
pub trait LeadStore: Send + Sync {
    async fn find_by_id(
        &self,
        tenant_id: &TenantId,
        id: &LeadId,
    ) -> Result<Option<Lead>, RepositoryError>;

    /// Non-archived leads ordered by id, strictly after `after_id` when given.
    async fn list_active_page(
        &self,
        tenant_id: &TenantId,
        after_id: Option<&LeadId>,
        limit: u32,
    ) -> Result<Vec<Lead>, RepositoryError>;

    async fn insert(&self, lead: &Lead) -> Result<(), RepositoryError>;
}
