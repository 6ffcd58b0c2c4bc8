use chrono::Utc;
use sqlx::Row;

use super::RepositoryError;
use crate::DbPool;

/// Resume cursor for the long-running batch jobs (full score recalculation,
/// duplicate sweep). One row per job key; a restart picks up strictly after
/// the last processed lead instead of starting over.
pub struct SqlCheckpointRepository {
    pool: DbPool,
}

impl SqlCheckpointRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn load(&self, job: &str) -> Result<Option<String>, RepositoryError> {
        let row = sqlx::query("SELECT last_processed_id FROM batch_checkpoint WHERE job = ?")
            .bind(job)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|row| row.get::<String, _>("last_processed_id")))
    }

    pub async fn save(&self, job: &str, last_processed_id: &str) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO batch_checkpoint (job, last_processed_id, updated_at)
             VALUES (?, ?, ?)
             ON CONFLICT(job) DO UPDATE SET
                last_processed_id = excluded.last_processed_id,
                updated_at = excluded.updated_at",
        )
        .bind(job)
        .bind(last_processed_id)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn clear(&self, job: &str) -> Result<(), RepositoryError> {
        sqlx::query("DELETE FROM batch_checkpoint WHERE job = ?")
            .bind(job)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::SqlCheckpointRepository;
    use crate::{connect_with_settings, migrations};

    #[tokio::test]
    async fn checkpoints_round_trip_and_clear() {
        let pool =
            connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect test pool");
        migrations::run_pending(&pool).await.expect("run migrations");
        let repo = SqlCheckpointRepository::new(pool.clone());

        assert_eq!(repo.load("score_recalc:tenant-1").await.expect("load"), None);

        repo.save("score_recalc:tenant-1", "L-250").await.expect("save");
        repo.save("score_recalc:tenant-1", "L-500").await.expect("overwrite");
        assert_eq!(
            repo.load("score_recalc:tenant-1").await.expect("load"),
            Some("L-500".to_string())
        );

        // Job keys are independent.
        repo.save("duplicate_sweep:tenant-1", "L-100").await.expect("save");
        assert_eq!(
            repo.load("duplicate_sweep:tenant-1").await.expect("load"),
            Some("L-100".to_string())
        );

        repo.clear("score_recalc:tenant-1").await.expect("clear");
        assert_eq!(repo.load("score_recalc:tenant-1").await.expect("load"), None);

        pool.close().await;
    }
}
