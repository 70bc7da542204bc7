use chrono::{DateTime, Utc};
use sqlx::{Row, Sqlite, Transaction};

use procura_core::domain::process::ProcessId;
use procura_core::domain::step::{Approver, NewStep, ProcessStep, StepId};
use procura_core::errors::{ResourceKind, WorkflowError};
use procura_core::workflow::ordering;

use super::{parse_timestamp, parse_u32, RepositoryError, StepRepository};
use crate::DbPool;

const STEP_COLUMNS: &str = "id, process_id, position, approver_user_id, approver_designation_id, \
                            description, timeout_days, created_at, updated_at";

pub struct SqlStepRepository {
    pool: DbPool,
}

impl SqlStepRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

pub(crate) fn row_to_step(row: &sqlx::sqlite::SqliteRow) -> Result<ProcessStep, RepositoryError> {
    let id: i64 = row.try_get("id")?;
    let approver =
        Approver::from_columns(row.try_get("approver_user_id")?, row.try_get("approver_designation_id")?)
            .ok_or_else(|| {
                RepositoryError::Decode(format!("step `{id}` must carry exactly one approver"))
            })?;
    let timeout_days: Option<i64> = row.try_get("timeout_days")?;

    Ok(ProcessStep {
        id: StepId(id),
        process_id: ProcessId(row.try_get("process_id")?),
        order: parse_u32("position", row.try_get("position")?)?,
        approver,
        description: row.try_get("description")?,
        timeout_days: timeout_days.map(|days| parse_u32("timeout_days", days)).transpose()?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}

/// Bumps the process row so the transaction holds SQLite's write lock before
/// it reads any steps. Returns whether the process is archived.
async fn lock_process(
    tx: &mut Transaction<'_, Sqlite>,
    process_id: ProcessId,
    now: DateTime<Utc>,
) -> Result<bool, RepositoryError> {
    let result = sqlx::query("UPDATE process SET updated_at = ? WHERE id = ?")
        .bind(now.to_rfc3339())
        .bind(process_id.0)
        .execute(&mut **tx)
        .await?;
    if result.rows_affected() == 0 {
        return Err(RepositoryError::NotFound { resource: ResourceKind::Process, id: process_id.0 });
    }

    let archived: Option<String> =
        sqlx::query_scalar("SELECT archived_at FROM process WHERE id = ?")
            .bind(process_id.0)
            .fetch_one(&mut **tx)
            .await?;
    Ok(archived.is_some())
}

async fn live_steps(
    tx: &mut Transaction<'_, Sqlite>,
    process_id: ProcessId,
) -> Result<Vec<ProcessStep>, RepositoryError> {
    let rows = sqlx::query(&format!(
        "SELECT {STEP_COLUMNS} FROM process_step
         WHERE process_id = ? AND removed_at IS NULL
         ORDER BY position ASC"
    ))
    .bind(process_id.0)
    .fetch_all(&mut **tx)
    .await?;

    rows.iter().map(row_to_step).collect()
}

/// Writes new positions for `steps`, where `previous` holds each step's
/// position before the change. Rows that move are first parked at a
/// negative position so the live-position unique index never sees a clash.
async fn write_positions(
    tx: &mut Transaction<'_, Sqlite>,
    previous: &[(StepId, u32)],
    steps: &[ProcessStep],
    now: DateTime<Utc>,
) -> Result<(), RepositoryError> {
    let moved: Vec<&ProcessStep> = steps
        .iter()
        .filter(|step| {
            previous.iter().find(|(id, _)| *id == step.id).map(|(_, order)| *order)
                != Some(step.order)
        })
        .collect();

    for step in &moved {
        sqlx::query("UPDATE process_step SET position = ? WHERE id = ?")
            .bind(-step.id.0)
            .bind(step.id.0)
            .execute(&mut **tx)
            .await?;
    }

    for step in &moved {
        sqlx::query("UPDATE process_step SET position = ?, updated_at = ? WHERE id = ?")
            .bind(i64::from(step.order))
            .bind(now.to_rfc3339())
            .bind(step.id.0)
            .execute(&mut **tx)
            .await?;
    }

    Ok(())
}

#[async_trait::async_trait]
impl StepRepository for SqlStepRepository {
    async fn list_for_process(
        &self,
        process_id: ProcessId,
    ) -> Result<Vec<ProcessStep>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {STEP_COLUMNS} FROM process_step
             WHERE process_id = ? AND removed_at IS NULL
             ORDER BY position ASC"
        ))
        .bind(process_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_step).collect()
    }

    async fn find_by_id(&self, id: StepId) -> Result<Option<ProcessStep>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {STEP_COLUMNS} FROM process_step WHERE id = ? AND removed_at IS NULL"
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_step).transpose()
    }

    async fn append(
        &self,
        process_id: ProcessId,
        step: NewStep,
        max_steps: u32,
        now: DateTime<Utc>,
    ) -> Result<ProcessStep, RepositoryError> {
        let mut tx = self.pool.begin().await?;

        if lock_process(&mut tx, process_id, now).await? {
            return Err(WorkflowError::validation(
                "process_id",
                format!("process `{process_id}` is archived"),
            )
            .into());
        }

        let live: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM process_step WHERE process_id = ? AND removed_at IS NULL",
        )
        .bind(process_id.0)
        .fetch_one(&mut *tx)
        .await?;
        if live >= i64::from(max_steps) {
            return Err(WorkflowError::validation(
                "steps",
                format!("process `{process_id}` already has the maximum of {max_steps} steps"),
            )
            .into());
        }

        let description = step.description.trim().to_string();
        let result = sqlx::query(
            "INSERT INTO process_step (process_id, position, approver_user_id,
                                       approver_designation_id, description, timeout_days,
                                       removed_at, created_at, updated_at)
             SELECT ?, COALESCE(MAX(position), 0) + 1, ?, ?, ?, ?, NULL, ?, ?
             FROM process_step
             WHERE process_id = ? AND removed_at IS NULL",
        )
        .bind(process_id.0)
        .bind(step.approver.user_column())
        .bind(step.approver.designation_column())
        .bind(&description)
        .bind(step.timeout_days.map(i64::from))
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .bind(process_id.0)
        .execute(&mut *tx)
        .await?;

        let row = sqlx::query(&format!("SELECT {STEP_COLUMNS} FROM process_step WHERE id = ?"))
            .bind(result.last_insert_rowid())
            .fetch_one(&mut *tx)
            .await?;
        let created = row_to_step(&row)?;

        tx.commit().await?;
        Ok(created)
    }

    async fn save(&self, step: &ProcessStep) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            "UPDATE process_step
             SET approver_user_id = ?, approver_designation_id = ?, description = ?,
                 timeout_days = ?, updated_at = ?
             WHERE id = ? AND removed_at IS NULL",
        )
        .bind(step.approver.user_column())
        .bind(step.approver.designation_column())
        .bind(&step.description)
        .bind(step.timeout_days.map(i64::from))
        .bind(step.updated_at.to_rfc3339())
        .bind(step.id.0)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound { resource: ResourceKind::Step, id: step.id.0 });
        }
        Ok(())
    }

    async fn reorder(
        &self,
        process_id: ProcessId,
        proposed: &[StepId],
        now: DateTime<Utc>,
    ) -> Result<Vec<ProcessStep>, RepositoryError> {
        let mut tx = self.pool.begin().await?;
        lock_process(&mut tx, process_id, now).await?;

        let current = live_steps(&mut tx, process_id).await?;
        let previous: Vec<(StepId, u32)> = current.iter().map(|step| (step.id, step.order)).collect();
        let mut reordered = ordering::renumber(process_id, current, proposed)?;

        write_positions(&mut tx, &previous, &reordered, now).await?;
        tx.commit().await?;

        for step in &mut reordered {
            if previous.iter().any(|(id, order)| *id == step.id && *order != step.order) {
                step.updated_at = now;
            }
        }
        Ok(reordered)
    }

    async fn remove(
        &self,
        id: StepId,
        now: DateTime<Utc>,
    ) -> Result<Vec<ProcessStep>, RepositoryError> {
        let mut tx = self.pool.begin().await?;

        // Write first so the transaction holds the database lock before it reads.
        let touched = sqlx::query(
            "UPDATE process SET updated_at = ?
             WHERE id = (SELECT process_id FROM process_step WHERE id = ? AND removed_at IS NULL)",
        )
        .bind(now.to_rfc3339())
        .bind(id.0)
        .execute(&mut *tx)
        .await?;
        if touched.rows_affected() == 0 {
            return Err(RepositoryError::NotFound { resource: ResourceKind::Step, id: id.0 });
        }
        let process_id = ProcessId(
            sqlx::query_scalar("SELECT process_id FROM process_step WHERE id = ?")
                .bind(id.0)
                .fetch_one(&mut *tx)
                .await?,
        );

        let result = sqlx::query(
            "UPDATE process_step SET removed_at = ?, updated_at = ?
             WHERE id = ? AND removed_at IS NULL",
        )
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .bind(id.0)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound { resource: ResourceKind::Step, id: id.0 });
        }

        let remaining = live_steps(&mut tx, process_id).await?;
        let previous: Vec<(StepId, u32)> =
            remaining.iter().map(|step| (step.id, step.order)).collect();
        let mut compacted = ordering::compact(remaining);

        write_positions(&mut tx, &previous, &compacted, now).await?;
        tx.commit().await?;

        for step in &mut compacted {
            if previous.iter().any(|(id, order)| *id == step.id && *order != step.order) {
                step.updated_at = now;
            }
        }
        Ok(compacted)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use procura_core::domain::actor::{DesignationId, UserId};
    use procura_core::domain::process::{NewProcess, ProcessId, ProcessStatus};
    use procura_core::domain::step::{Approver, NewStep, ProcessStep, StepId};
    use procura_core::errors::WorkflowError;
    use procura_core::workflow::ordering::{is_gap_free, sequence_of};

    use super::SqlStepRepository;
    use crate::repositories::{
        ProcessRepository, RepositoryError, SqlProcessRepository, StepRepository,
    };
    use crate::{connect_with_settings, migrations, DbPool};

    async fn setup() -> (DbPool, ProcessId) {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        let process = SqlProcessRepository::new(pool.clone())
            .insert(
                NewProcess {
                    title: "Material Request".to_string(),
                    status: ProcessStatus::Active,
                    is_active: true,
                },
                Utc::now(),
            )
            .await
            .expect("process");
        (pool, process.id)
    }

    fn new_step(approver: Approver, description: &str) -> NewStep {
        NewStep { approver, description: description.to_string(), timeout_days: Some(2) }
    }

    async fn seed_chain(repo: &SqlStepRepository, process: ProcessId) -> Vec<ProcessStep> {
        let mut steps = Vec::new();
        for (approver, description) in [
            (Approver::User(UserId(7)), "Store keeper"),
            (Approver::Designation(DesignationId(2)), "Department head"),
            (Approver::User(UserId(9)), "Finance"),
        ] {
            steps.push(
                repo.append(process, new_step(approver, description), 64, Utc::now())
                    .await
                    .expect("append"),
            );
        }
        steps
    }

    #[tokio::test]
    async fn append_assigns_next_order() {
        let (pool, process) = setup().await;
        let repo = SqlStepRepository::new(pool);
        let steps = seed_chain(&repo, process).await;

        assert_eq!(steps.iter().map(|s| s.order).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(steps[1].approver, Approver::Designation(DesignationId(2)));

        let listed = repo.list_for_process(process).await.expect("list");
        assert_eq!(listed, steps);
    }

    #[tokio::test]
    async fn append_stops_at_step_cap() {
        let (pool, process) = setup().await;
        let repo = SqlStepRepository::new(pool);
        repo.append(process, new_step(Approver::User(UserId(1)), "one"), 1, Utc::now())
            .await
            .expect("first");

        let second =
            repo.append(process, new_step(Approver::User(UserId(2)), "two"), 1, Utc::now()).await;
        assert!(matches!(
            second,
            Err(RepositoryError::Workflow(WorkflowError::Validation { field: "steps", .. }))
        ));
    }

    #[tokio::test]
    async fn append_to_missing_process_is_not_found() {
        let (pool, _) = setup().await;
        let repo = SqlStepRepository::new(pool);
        let result = repo
            .append(ProcessId(404), new_step(Approver::User(UserId(1)), "x"), 64, Utc::now())
            .await;
        assert!(matches!(result, Err(RepositoryError::NotFound { id: 404, .. })));
    }

    #[tokio::test]
    async fn reorder_rewrites_orders_and_keeps_ids() {
        let (pool, process) = setup().await;
        let repo = SqlStepRepository::new(pool);
        let steps = seed_chain(&repo, process).await;
        let (a, b, c) = (steps[0].id, steps[1].id, steps[2].id);

        let reordered = repo.reorder(process, &[c, a, b], Utc::now()).await.expect("reorder");
        assert_eq!(sequence_of(&reordered), vec![c, a, b]);

        let listed = repo.list_for_process(process).await.expect("list");
        assert_eq!(sequence_of(&listed), vec![c, a, b]);
        assert!(is_gap_free(&listed));
        assert_eq!(listed[0].description, "Finance");

        let again = repo.reorder(process, &[c, a, b], Utc::now()).await.expect("same order");
        assert_eq!(sequence_of(&again), vec![c, a, b]);
    }

    #[tokio::test]
    async fn invalid_reorder_leaves_store_untouched() {
        let (pool, process) = setup().await;
        let repo = SqlStepRepository::new(pool);
        let steps = seed_chain(&repo, process).await;
        let (a, b) = (steps[0].id, steps[1].id);

        let result = repo.reorder(process, &[b, a], Utc::now()).await;
        assert!(matches!(
            result,
            Err(RepositoryError::Workflow(WorkflowError::InvalidReorder { .. }))
        ));

        let listed = repo.list_for_process(process).await.expect("list");
        assert_eq!(sequence_of(&listed), sequence_of(&steps));
    }

    #[tokio::test]
    async fn remove_closes_the_gap() {
        let (pool, process) = setup().await;
        let repo = SqlStepRepository::new(pool);
        let steps = seed_chain(&repo, process).await;

        let remaining = repo.remove(steps[1].id, Utc::now()).await.expect("remove");
        assert_eq!(sequence_of(&remaining), vec![steps[0].id, steps[2].id]);
        assert_eq!(remaining.iter().map(|s| s.order).collect::<Vec<_>>(), vec![1, 2]);

        assert!(repo.find_by_id(steps[1].id).await.expect("find").is_none());
        let listed = repo.list_for_process(process).await.expect("list");
        assert!(is_gap_free(&listed));

        let appended = repo
            .append(process, new_step(Approver::User(UserId(3)), "Audit"), 64, Utc::now())
            .await
            .expect("append after remove");
        assert_eq!(appended.order, 3);
    }

    #[tokio::test]
    async fn removing_a_removed_step_is_not_found() {
        let (pool, process) = setup().await;
        let repo = SqlStepRepository::new(pool);
        let steps = seed_chain(&repo, process).await;
        repo.remove(steps[0].id, Utc::now()).await.expect("remove");

        let again = repo.remove(steps[0].id, Utc::now()).await;
        assert!(matches!(again, Err(RepositoryError::NotFound { .. })));
        let unknown = repo.remove(StepId(999), Utc::now()).await;
        assert!(matches!(unknown, Err(RepositoryError::NotFound { .. })));
    }

    #[tokio::test]
    async fn save_updates_approver_but_not_order() {
        let (pool, process) = setup().await;
        let repo = SqlStepRepository::new(pool);
        let mut step = seed_chain(&repo, process).await.remove(1);
        step.approver = Approver::User(UserId(11));
        step.description = "Plant manager".to_string();
        step.timeout_days = None;
        repo.save(&step).await.expect("save");

        let found = repo.find_by_id(step.id).await.expect("find").expect("live");
        assert_eq!(found.approver, Approver::User(UserId(11)));
        assert_eq!(found.order, 2);
        assert_eq!(found.timeout_days, None);
    }
}
