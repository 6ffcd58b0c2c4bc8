pub mod api;
pub mod batch;
pub mod bootstrap;
pub mod duplicates;
pub mod health;
pub mod routing;
pub mod scoring;

use axum::Router;

use leadflow_core::config::AppConfig;
use leadflow_db::DbPool;

/// The full HTTP surface: assignment, scoring, duplicate management, and the
/// health endpoint, assembled from the per-module routers.
pub fn app_router(pool: DbPool, config: &AppConfig) -> Router {
    Router::new()
        .merge(routing::router(pool.clone(), config.routing.max_assign_attempts))
        .merge(scoring::router(pool.clone(), &config.scoring))
        .merge(duplicates::router(pool.clone(), &config.duplicates))
        .merge(health::router(pool))
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::util::ServiceExt;

    use leadflow_core::config::AppConfig;
    use leadflow_db::{connect_with_settings, migrations, DbPool};

    use super::app_router;

    async fn setup_pool() -> DbPool {
        let pool =
            connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect test pool");
        migrations::run_pending(&pool).await.expect("run migrations");
        pool
    }

    #[tokio::test]
    async fn health_is_served_without_tenant_context() {
        let pool = setup_pool().await;
        let app = app_router(pool.clone(), &AppConfig::default());

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);

        pool.close().await;
    }

    #[tokio::test]
    async fn tenant_scoped_routes_reject_requests_without_the_header() {
        let pool = setup_pool().await;
        let app = app_router(pool.clone(), &AppConfig::default());

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/v1/assignment-rules")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        pool.close().await;
    }

    #[tokio::test]
    async fn unassigned_lead_with_no_rules_yields_no_content() {
        let pool = setup_pool().await;
        let app = app_router(pool.clone(), &AppConfig::default());

        sqlx::query(
            "INSERT INTO lead (id, tenant_id, status, score, is_archived, created_at, updated_at)
             VALUES ('L-HTTP-1', 'tenant-1', 'new', 0, 0,
                     '2026-07-01T09:00:00Z', '2026-07-01T09:00:00Z')",
        )
        .execute(&pool)
        .await
        .expect("insert lead");

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/v1/leads/L-HTTP-1/assign")
                    .header("x-tenant-id", "tenant-1")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        pool.close().await;
    }
}
