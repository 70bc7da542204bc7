use procura_core::domain::process::ProcessId;
use procura_core::errors::WorkflowError;

use crate::commands::{engine_for, run_with_database, CommandResult};

pub fn run(process_id: i64) -> CommandResult {
    let result = run_with_database("steps", |config, pool| async move {
        engine_for(&config, pool).ordered_steps(ProcessId(process_id)).await.map_err(|error| {
            let class = match error {
                WorkflowError::NotFound { .. } => "not_found",
                _ => "query",
            };
            (class, error.to_string(), 6u8)
        })
    });

    match result {
        Ok(steps) => {
            let message = format!("process {process_id} has {} steps", steps.len());
            match serde_json::to_value(&steps) {
                Ok(data) => CommandResult::success_with_data("steps", message, Some(data)),
                Err(error) => CommandResult::failure("steps", "serialization", error.to_string(), 7),
            }
        }
        Err(failure) => failure,
    }
}
