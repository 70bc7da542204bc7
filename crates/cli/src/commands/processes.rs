use crate::commands::{engine_for, run_with_database, CommandResult};

pub fn run(include_archived: bool) -> CommandResult {
    let result = run_with_database("processes", |config, pool| async move {
        engine_for(&config, pool)
            .process_pages(include_archived)
            .collect_all()
            .await
            .map_err(|error| ("query", error.to_string(), 6u8))
    });

    match result {
        Ok(processes) => {
            let message = format!("{} processes", processes.len());
            match serde_json::to_value(&processes) {
                Ok(data) => CommandResult::success_with_data("processes", message, Some(data)),
                Err(error) => CommandResult::failure("processes", "serialization", error.to_string(), 7),
            }
        }
        Err(failure) => failure,
    }
}
