use crate::commands::{run_with_database, CommandResult};
use procura_db::migrations;

pub fn run() -> CommandResult {
    let result = run_with_database("migrate", |_config, pool| async move {
        migrations::missing_schema_objects(&pool)
            .await
            .map_err(|error| ("schema_inspection", error.to_string(), 6u8))
    });

    match result {
        Ok(missing) if missing.is_empty() => {
            CommandResult::success("migrate", "applied pending migrations")
        }
        Ok(missing) => CommandResult::failure(
            "migrate",
            "schema_incomplete",
            format!("migrations ran but schema objects are missing: {}", missing.join(", ")),
            6,
        ),
        Err(failure) => failure,
    }
}
