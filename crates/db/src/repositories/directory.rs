use async_trait::async_trait;

use procura_core::directory::{DirectoryAdapter, DirectoryError};
use procura_core::domain::actor::{DesignationId, UserId};

use super::RepositoryError;
use crate::DbPool;

/// Directory backed by the local `directory_user` read model.
#[derive(Clone)]
pub struct SqlDirectory {
    pool: DbPool,
}

impl SqlDirectory {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Inserts or replaces a user's designation, as done by the directory sync
    /// and the seed command.
    pub async fn upsert_user(
        &self,
        user: UserId,
        designation: Option<DesignationId>,
        display_name: &str,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO directory_user (user_id, designation_id, display_name)
             VALUES (?, ?, ?)
             ON CONFLICT(user_id) DO UPDATE SET
                 designation_id = excluded.designation_id,
                 display_name = excluded.display_name",
        )
        .bind(user.0)
        .bind(designation.map(|designation| designation.0))
        .bind(display_name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn user_count(&self) -> Result<i64, RepositoryError> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM directory_user").fetch_one(&self.pool).await?)
    }
}

fn unavailable(error: sqlx::Error) -> DirectoryError {
    DirectoryError::Unavailable(error.to_string())
}

#[async_trait]
impl DirectoryAdapter for SqlDirectory {
    async fn designation_of(&self, user: UserId) -> Result<Option<DesignationId>, DirectoryError> {
        let designation: Option<Option<i64>> =
            sqlx::query_scalar("SELECT designation_id FROM directory_user WHERE user_id = ?")
                .bind(user.0)
                .fetch_optional(&self.pool)
                .await
                .map_err(unavailable)?;
        Ok(designation.flatten().map(DesignationId))
    }

    async fn holders_of(&self, designation: DesignationId) -> Result<Vec<UserId>, DirectoryError> {
        let users: Vec<i64> = sqlx::query_scalar(
            "SELECT user_id FROM directory_user WHERE designation_id = ? ORDER BY user_id ASC",
        )
        .bind(designation.0)
        .fetch_all(&self.pool)
        .await
        .map_err(unavailable)?;
        Ok(users.into_iter().map(UserId).collect())
    }
}
