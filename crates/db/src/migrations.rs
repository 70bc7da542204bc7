use sqlx::migrate::{MigrateError, Migrator};

use crate::DbPool;

pub static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

pub async fn run_pending(pool: &DbPool) -> Result<(), MigrateError> {
    MIGRATOR.run(pool).await
}

/// Tables and indexes the workflow engine expects after migrations.
pub const MANAGED_SCHEMA_OBJECTS: &[&str] = &[
    "process",
    "process_step",
    "approvable_entity",
    "approval_decision",
    "directory_user",
    "idx_process_step_live_position",
    "idx_process_step_process_id",
    "idx_approvable_entity_status",
    "idx_approvable_entity_process_id",
    "idx_approvable_entity_subject",
    "idx_approval_decision_entity_id",
    "idx_directory_user_designation_id",
];

/// Names from [`MANAGED_SCHEMA_OBJECTS`] that are absent from the database.
pub async fn missing_schema_objects(pool: &DbPool) -> Result<Vec<&'static str>, sqlx::Error> {
    let present: Vec<String> = sqlx::query_scalar(
        "SELECT name FROM sqlite_master WHERE type IN ('table', 'index') AND name NOT LIKE 'sqlite_%'",
    )
    .fetch_all(pool)
    .await?;

    Ok(MANAGED_SCHEMA_OBJECTS
        .iter()
        .copied()
        .filter(|name| !present.iter().any(|existing| existing == name))
        .collect())
}
