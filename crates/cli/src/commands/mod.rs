pub mod config;
pub mod doctor;
pub mod migrate;
pub mod processes;
pub mod seed;
pub mod steps;

use std::future::Future;
use std::sync::Arc;

use procura_core::audit::{AuditContext, TracingAuditSink};
use procura_core::config::{AppConfig, LoadOptions};
use procura_db::repositories::SqlDirectory;
use procura_db::{connect_with_settings, migrations, DbPool, EngineSettings, WorkflowEngine};
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone)]
pub struct CommandResult {
    pub exit_code: u8,
    pub output: String,
}

#[derive(Debug, Serialize)]
struct CommandOutcome {
    command: String,
    status: String,
    error_class: Option<String>,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
}

/// `(error_class, message, exit_code)` raised inside a database-backed command.
pub(crate) type Failure = (&'static str, String, u8);

impl CommandResult {
    pub fn success(command: &str, message: impl Into<String>) -> Self {
        Self::success_with_data(command, message, None)
    }

    pub fn success_with_data(command: &str, message: impl Into<String>, data: Option<Value>) -> Self {
        let payload = CommandOutcome {
            command: command.to_string(),
            status: "ok".to_string(),
            error_class: None,
            message: message.into(),
            data,
        };
        Self { exit_code: 0, output: serialize_payload(payload) }
    }

    pub fn failure(
        command: &str,
        error_class: &str,
        message: impl Into<String>,
        exit_code: u8,
    ) -> Self {
        let payload = CommandOutcome {
            command: command.to_string(),
            status: "error".to_string(),
            error_class: Some(error_class.to_string()),
            message: message.into(),
            data: None,
        };
        Self { exit_code, output: serialize_payload(payload) }
    }
}

fn serialize_payload(payload: CommandOutcome) -> String {
    serde_json::to_string(&payload).unwrap_or_else(|error| {
        format!(
            "{{\"command\":\"unknown\",\"status\":\"error\",\"error_class\":\"serialization\",\"message\":\"{}\"}}",
            error.to_string().replace('\\', "\\\\").replace('"', "\\\"")
        )
    })
}

/// Loads config, connects, applies pending migrations and hands the pool to
/// `work`. Exit codes: 2 config, 3 runtime, 4 connectivity, 5 migration; `work`
/// picks its own from 6 upwards.
pub(crate) fn run_with_database<T, F, Fut>(command: &'static str, work: F) -> Result<T, CommandResult>
where
    F: FnOnce(AppConfig, DbPool) -> Fut,
    Fut: Future<Output = Result<T, Failure>>,
{
    let config = AppConfig::load(LoadOptions::default()).map_err(|error| {
        CommandResult::failure(command, "config_validation", format!("configuration issue: {error}"), 2)
    })?;

    let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().map_err(|error| {
        CommandResult::failure(
            command,
            "runtime_init",
            format!("failed to initialize async runtime: {error}"),
            3,
        )
    })?;

    runtime.block_on(async move {
        let pool = connect_with_settings(
            &config.database.url,
            config.database.max_connections,
            config.database.timeout_secs,
        )
        .await
        .map_err(|error| CommandResult::failure(command, "db_connectivity", error.to_string(), 4))?;

        if let Err(error) = migrations::run_pending(&pool).await {
            pool.close().await;
            return Err(CommandResult::failure(command, "migration", error.to_string(), 5));
        }

        let outcome = work(config, pool.clone()).await;
        pool.close().await;
        outcome.map_err(|(error_class, message, exit_code)| {
            CommandResult::failure(command, error_class, message, exit_code)
        })
    })
}

pub(crate) fn engine_for(config: &AppConfig, pool: DbPool) -> WorkflowEngine {
    WorkflowEngine::sql(
        pool.clone(),
        Arc::new(SqlDirectory::new(pool)),
        Arc::new(TracingAuditSink),
        EngineSettings::from(&config.workflow),
    )
}

pub(crate) fn operator_context(command: &str) -> AuditContext {
    AuditContext::new(format!("cli-{command}"), "operator:cli")
}
