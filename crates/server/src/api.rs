//! Shared HTTP plumbing: tenant extraction, the error payload shape, and the
//! mapping from domain/repository failures to status codes.

use axum::extract::FromRequestParts;
use axum::http::{request::Parts, StatusCode};
use axum::Json;
use serde::Serialize;
use tracing::error;

use leadflow_core::domain::lead::{TenantId, UserId};
use leadflow_core::errors::DomainError;
use leadflow_db::repositories::RepositoryError;

pub const TENANT_HEADER: &str = "x-tenant-id";
pub const USER_HEADER: &str = "x-user-id";

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
}

pub type ErrorResponse = (StatusCode, Json<ApiError>);

pub fn error_response(status: StatusCode, message: impl Into<String>) -> ErrorResponse {
    (status, Json(ApiError { error: message.into() }))
}

pub fn bad_request(message: impl Into<String>) -> ErrorResponse {
    error_response(StatusCode::BAD_REQUEST, message)
}

pub fn not_found(message: impl Into<String>) -> ErrorResponse {
    error_response(StatusCode::NOT_FOUND, message)
}

pub fn repository_error(error: RepositoryError) -> ErrorResponse {
    error!(error = %error, "repository failure");
    error_response(StatusCode::INTERNAL_SERVER_ERROR, "an internal storage error occurred")
}

pub fn domain_error(error: DomainError) -> ErrorResponse {
    let status = match &error {
        DomainError::NotFound { .. } => StatusCode::NOT_FOUND,
        DomainError::Validation(_)
        | DomainError::LeadArchived(_)
        | DomainError::SelfMerge
        | DomainError::PairAlreadyResolved { .. } => StatusCode::BAD_REQUEST,
        DomainError::ConcurrencyConflict { .. } => StatusCode::CONFLICT,
        DomainError::MergeFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(status, error.to_string())
}

/// Failure of an engine orchestration: either a domain outcome the caller
/// must surface or a storage failure.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

impl ServiceError {
    pub fn into_response(self) -> ErrorResponse {
        match self {
            Self::Domain(error) => domain_error(error),
            Self::Repository(error) => repository_error(error),
        }
    }
}

/// The tenant every request operates in, taken from the `x-tenant-id` header
/// supplied by the hosting application's auth layer.
#[derive(Clone, Debug)]
pub struct Tenant(pub TenantId);

impl<S> FromRequestParts<S> for Tenant
where
    S: Send + Sync,
{
    type Rejection = ErrorResponse;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let value = parts
            .headers
            .get(TENANT_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty());

        match value {
            Some(tenant) => Ok(Tenant(TenantId(tenant.to_string()))),
            None => Err(bad_request(format!("missing `{TENANT_HEADER}` header"))),
        }
    }
}

/// The acting user, taken from the `x-user-id` header. Required only by the
/// endpoints that write attribution (pair resolution, merges).
#[derive(Clone, Debug)]
pub struct CurrentUser(pub UserId);

impl<S> FromRequestParts<S> for CurrentUser
where
    S: Send + Sync,
{
    type Rejection = ErrorResponse;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let value = parts
            .headers
            .get(USER_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty());

        match value {
            Some(user) => Ok(CurrentUser(UserId(user.to_string()))),
            None => Err(bad_request(format!("missing `{USER_HEADER}` header"))),
        }
    }
}
