use chrono::{DateTime, Utc};
use sqlx::Row;

use procura_core::domain::actor::UserId;
use procura_core::domain::approval::{
    ApprovableEntity, ApprovalStatus, Decision, DecisionOutcome, EntityId, NewSubmission,
    SubjectRef,
};
use procura_core::domain::process::ProcessId;
use procura_core::domain::step::StepId;
use procura_core::errors::ResourceKind;
use procura_core::workflow::Transition;

use super::{parse_timestamp, parse_u32, ApprovalRepository, RepositoryError};
use crate::DbPool;

const ENTITY_COLUMNS: &str = "id, process_id, subject_kind, subject_id, submitted_by, \
                              current_step_order, status, version, submitted_at, updated_at";

pub struct SqlApprovalRepository {
    pool: DbPool,
}

impl SqlApprovalRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn decisions_for(&self, entity: EntityId) -> Result<Vec<Decision>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT step_id, step_order, actor_id, outcome, note, decided_at
             FROM approval_decision
             WHERE entity_id = ?
             ORDER BY step_order ASC",
        )
        .bind(entity.0)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_decision).collect()
    }

    async fn hydrate(
        &self,
        rows: Vec<sqlx::sqlite::SqliteRow>,
    ) -> Result<Vec<ApprovableEntity>, RepositoryError> {
        let mut entities = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut entity = row_to_entity(row)?;
            entity.decisions = self.decisions_for(entity.id).await?;
            entities.push(entity);
        }
        Ok(entities)
    }
}

fn row_to_entity(row: &sqlx::sqlite::SqliteRow) -> Result<ApprovableEntity, RepositoryError> {
    let status: String = row.try_get("status")?;
    let status = ApprovalStatus::parse(&status)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown approval status `{status}`")))?;

    Ok(ApprovableEntity {
        id: EntityId(row.try_get("id")?),
        process_id: ProcessId(row.try_get("process_id")?),
        subject: SubjectRef { kind: row.try_get("subject_kind")?, id: row.try_get("subject_id")? },
        submitted_by: UserId(row.try_get("submitted_by")?),
        current_step_order: parse_u32("current_step_order", row.try_get("current_step_order")?)?,
        status,
        decisions: Vec::new(),
        version: parse_u32("version", row.try_get("version")?)?,
        submitted_at: parse_timestamp("submitted_at", row.try_get("submitted_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}

fn row_to_decision(row: &sqlx::sqlite::SqliteRow) -> Result<Decision, RepositoryError> {
    let outcome: String = row.try_get("outcome")?;
    let outcome = DecisionOutcome::parse(&outcome)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown decision outcome `{outcome}`")))?;

    Ok(Decision {
        step_id: StepId(row.try_get("step_id")?),
        step_order: parse_u32("step_order", row.try_get("step_order")?)?,
        actor_id: UserId(row.try_get("actor_id")?),
        outcome,
        note: row.try_get("note")?,
        decided_at: parse_timestamp("decided_at", row.try_get("decided_at")?)?,
    })
}

fn is_unique_violation(error: &sqlx::Error) -> bool {
    error.as_database_error().is_some_and(|database| database.is_unique_violation())
}

#[async_trait::async_trait]
impl ApprovalRepository for SqlApprovalRepository {
    async fn insert(
        &self,
        submission: NewSubmission,
        now: DateTime<Utc>,
    ) -> Result<ApprovableEntity, RepositoryError> {
        let result = sqlx::query(
            "INSERT INTO approvable_entity (process_id, subject_kind, subject_id, submitted_by,
                                            current_step_order, status, version,
                                            submitted_at, updated_at)
             VALUES (?, ?, ?, ?, 1, ?, 0, ?, ?)",
        )
        .bind(submission.process_id.0)
        .bind(&submission.subject.kind)
        .bind(&submission.subject.id)
        .bind(submission.submitted_by.0)
        .bind(ApprovalStatus::Pending.as_str())
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(ApprovableEntity {
            id: EntityId(result.last_insert_rowid()),
            process_id: submission.process_id,
            subject: submission.subject,
            submitted_by: submission.submitted_by,
            current_step_order: 1,
            status: ApprovalStatus::Pending,
            decisions: Vec::new(),
            version: 0,
            submitted_at: now,
            updated_at: now,
        })
    }

    async fn find_by_id(&self, id: EntityId) -> Result<Option<ApprovableEntity>, RepositoryError> {
        let row =
            sqlx::query(&format!("SELECT {ENTITY_COLUMNS} FROM approvable_entity WHERE id = ?"))
                .bind(id.0)
                .fetch_optional(&self.pool)
                .await?;

        match row {
            Some(row) => Ok(self.hydrate(vec![row]).await?.pop()),
            None => Ok(None),
        }
    }

    async fn record_decision(&self, transition: &Transition) -> Result<(), RepositoryError> {
        let entity = &transition.entity;
        let decision = &transition.decision;
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            "UPDATE approvable_entity
             SET current_step_order = ?, status = ?, version = ?, updated_at = ?
             WHERE id = ? AND version = ?",
        )
        .bind(i64::from(entity.current_step_order))
        .bind(entity.status.as_str())
        .bind(i64::from(entity.version))
        .bind(entity.updated_at.to_rfc3339())
        .bind(entity.id.0)
        .bind(i64::from(transition.expected_version))
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            let exists: Option<i64> =
                sqlx::query_scalar("SELECT id FROM approvable_entity WHERE id = ?")
                    .bind(entity.id.0)
                    .fetch_optional(&mut *tx)
                    .await?;
            return Err(match exists {
                Some(_) => RepositoryError::Conflict(format!(
                    "entity `{}` no longer holds version {}",
                    entity.id, transition.expected_version
                )),
                None => RepositoryError::NotFound { resource: ResourceKind::Entity, id: entity.id.0 },
            });
        }

        let step_in_place: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM process_step
             WHERE id = ? AND process_id = ? AND position = ? AND removed_at IS NULL",
        )
        .bind(decision.step_id.0)
        .bind(entity.process_id.0)
        .bind(i64::from(decision.step_order))
        .fetch_one(&mut *tx)
        .await?;
        if step_in_place == 0 {
            return Err(RepositoryError::Conflict(format!(
                "step `{}` is no longer at order {} of process `{}`",
                decision.step_id, decision.step_order, entity.process_id
            )));
        }

        let displaced: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM approval_decision d
             LEFT JOIN process_step s
                    ON s.id = d.step_id AND s.process_id = ? AND s.position = d.step_order
                   AND s.removed_at IS NULL
             WHERE d.entity_id = ? AND s.id IS NULL",
        )
        .bind(entity.process_id.0)
        .bind(entity.id.0)
        .fetch_one(&mut *tx)
        .await?;
        if displaced > 0 {
            return Err(RepositoryError::Conflict(format!(
                "{displaced} decided step(s) of entity `{}` were moved or removed",
                entity.id
            )));
        }

        let inserted = sqlx::query(
            "INSERT INTO approval_decision (entity_id, step_id, step_order, actor_id, outcome,
                                            note, decided_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(entity.id.0)
        .bind(decision.step_id.0)
        .bind(i64::from(decision.step_order))
        .bind(decision.actor_id.0)
        .bind(decision.outcome.as_str())
        .bind(&decision.note)
        .bind(decision.decided_at.to_rfc3339())
        .execute(&mut *tx)
        .await;

        match inserted {
            Ok(_) => {}
            Err(error) if is_unique_violation(&error) => {
                return Err(RepositoryError::Conflict(format!(
                    "step {} of entity `{}` is already decided",
                    decision.step_order, entity.id
                )));
            }
            Err(error) => return Err(error.into()),
        }

        tx.commit().await?;
        Ok(())
    }

    async fn list_pending(
        &self,
        process_id: Option<ProcessId>,
    ) -> Result<Vec<ApprovableEntity>, RepositoryError> {
        let rows = match process_id {
            Some(process_id) => {
                sqlx::query(&format!(
                    "SELECT {ENTITY_COLUMNS} FROM approvable_entity
                     WHERE status = 'pending' AND process_id = ?
                     ORDER BY id ASC"
                ))
                .bind(process_id.0)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {ENTITY_COLUMNS} FROM approvable_entity
                     WHERE status = 'pending'
                     ORDER BY id ASC"
                ))
                .fetch_all(&self.pool)
                .await?
            }
        };

        self.hydrate(rows).await
    }
}
