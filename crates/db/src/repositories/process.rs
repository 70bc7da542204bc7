use chrono::{DateTime, Utc};
use sqlx::Row;

use procura_core::domain::process::{
    NewProcess, Process, ProcessId, ProcessPage, ProcessPageRequest, ProcessStatus,
};
use procura_core::errors::ResourceKind;

use super::{parse_optional_timestamp, parse_timestamp, ProcessRepository, RepositoryError};
use crate::DbPool;

const PROCESS_COLUMNS: &str =
    "id, title, status, is_active, archived_at, created_at, updated_at";

pub struct SqlProcessRepository {
    pool: DbPool,
}

impl SqlProcessRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

pub(crate) fn row_to_process(row: &sqlx::sqlite::SqliteRow) -> Result<Process, RepositoryError> {
    let status: String = row.try_get("status")?;
    let status = ProcessStatus::parse(&status)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown process status `{status}`")))?;

    Ok(Process {
        id: ProcessId(row.try_get("id")?),
        title: row.try_get("title")?,
        status,
        is_active: row.try_get("is_active")?,
        archived_at: parse_optional_timestamp("archived_at", row.try_get("archived_at")?)?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}

#[async_trait::async_trait]
impl ProcessRepository for SqlProcessRepository {
    async fn insert(
        &self,
        process: NewProcess,
        now: DateTime<Utc>,
    ) -> Result<Process, RepositoryError> {
        let title = process.title.trim().to_string();
        let result = sqlx::query(
            "INSERT INTO process (title, status, is_active, archived_at, created_at, updated_at)
             VALUES (?, ?, ?, NULL, ?, ?)",
        )
        .bind(&title)
        .bind(process.status.as_str())
        .bind(process.is_active)
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(Process {
            id: ProcessId(result.last_insert_rowid()),
            title,
            status: process.status,
            is_active: process.is_active,
            archived_at: None,
            created_at: now,
            updated_at: now,
        })
    }

    async fn find_by_id(&self, id: ProcessId) -> Result<Option<Process>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {PROCESS_COLUMNS} FROM process WHERE id = ?"))
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_process).transpose()
    }

    async fn save(&self, process: &Process) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            "UPDATE process
             SET title = ?, status = ?, is_active = ?, archived_at = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(&process.title)
        .bind(process.status.as_str())
        .bind(process.is_active)
        .bind(process.archived_at.map(|timestamp| timestamp.to_rfc3339()))
        .bind(process.updated_at.to_rfc3339())
        .bind(process.id.0)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound {
                resource: ResourceKind::Process,
                id: process.id.0,
            });
        }
        Ok(())
    }

    async fn list_page(&self, request: ProcessPageRequest) -> Result<ProcessPage, RepositoryError> {
        let after = request.after.map(|id| id.0).unwrap_or(0);
        let fetch = i64::from(request.limit) + 1;
        let archived_filter = if request.include_archived { "" } else { "AND archived_at IS NULL" };

        let rows = sqlx::query(&format!(
            "SELECT {PROCESS_COLUMNS} FROM process
             WHERE id > ? {archived_filter}
             ORDER BY id ASC
             LIMIT ?"
        ))
        .bind(after)
        .bind(fetch)
        .fetch_all(&self.pool)
        .await?;

        let items = rows.iter().map(row_to_process).collect::<Result<Vec<_>, _>>()?;
        Ok(ProcessPage::from_overfetch(items, request.limit))
    }
}
