use std::sync::Arc;

use procura_core::audit::TracingAuditSink;
use procura_core::config::{AppConfig, ConfigError, LoadOptions};
use procura_db::repositories::SqlDirectory;
use procura_db::{connect_with_settings, migrations, DbPool, EngineSettings, WorkflowEngine};
use thiserror::Error;
use tracing::info;

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub engine: Arc<WorkflowEngine>,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
}

#[cfg(test)]
pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        api_token_required = config.api_token_required(),
        "starting application bootstrap"
    );

    let db_pool = connect_with_settings(
        &config.database.url,
        config.database.max_connections,
        config.database.timeout_secs,
    )
    .await
    .map_err(BootstrapError::DatabaseConnect)?;
    info!(
        event_name = "system.bootstrap.database_connected",
        correlation_id = "bootstrap",
        max_connections = config.database.max_connections,
        "database connection established"
    );

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(
        event_name = "system.bootstrap.migrations_applied",
        correlation_id = "bootstrap",
        "database migrations applied"
    );

    let engine = WorkflowEngine::sql(
        db_pool.clone(),
        Arc::new(SqlDirectory::new(db_pool.clone())),
        Arc::new(TracingAuditSink),
        EngineSettings::from(&config.workflow),
    );

    Ok(Application { config, db_pool, engine: Arc::new(engine) })
}

#[cfg(test)]
mod tests {
    use procura_core::audit::AuditContext;
    use procura_core::config::{ConfigOverrides, LoadOptions};
    use procura_core::domain::process::{NewProcess, ProcessStatus};
    use procura_core::domain::step::{Approver, NewStep};
    use procura_core::domain::actor::UserId;

    use crate::bootstrap::bootstrap;

    fn overrides(database_url: &str) -> LoadOptions {
        LoadOptions {
            overrides: ConfigOverrides {
                database_url: Some(database_url.to_string()),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        }
    }

    #[tokio::test]
    async fn bootstrap_fails_fast_on_short_api_token() {
        let mut options = overrides("sqlite::memory:");
        options.overrides.api_token = Some("short".to_string());

        let result = bootstrap(options).await;

        let message = result.err().expect("error").to_string();
        assert!(message.contains("server.api_token"));
    }

    #[tokio::test]
    async fn bootstrap_migrates_and_wires_the_sql_engine() {
        let app = bootstrap(overrides("sqlite::memory:")).await.expect("bootstrap should succeed");

        let (table_count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master \
             WHERE type = 'table' AND name IN ('process', 'process_step', 'approvable_entity', 'approval_decision')",
        )
        .fetch_one(&app.db_pool)
        .await
        .expect("workflow tables should exist after bootstrap");
        assert_eq!(table_count, 4);

        let ctx = AuditContext::new("bootstrap-test", "user:1");
        let process = app
            .engine
            .create_process(
                &ctx,
                NewProcess { title: "Leave".to_string(), status: ProcessStatus::Active, is_active: true },
            )
            .await
            .expect("create process");
        let step = app
            .engine
            .add_step(
                &ctx,
                process.id,
                NewStep { approver: Approver::User(UserId(7)), description: String::new(), timeout_days: None },
            )
            .await
            .expect("add step");
        assert_eq!(step.order, 1);

        app.db_pool.close().await;
    }
}
