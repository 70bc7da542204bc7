use procura_core::domain::actor::{DesignationId, UserId};
use procura_core::domain::process::{NewProcess, ProcessStatus};
use procura_core::domain::step::{Approver, NewStep};
use procura_db::repositories::SqlDirectory;

use crate::commands::{engine_for, operator_context, run_with_database, CommandResult, Failure};

pub const SEED_PROCESS_TITLE: &str = "Material Request";

/// `(user_id, designation_id, display_name)`
const DIRECTORY_USERS: &[(i64, Option<i64>, &str)] = &[
    (3, None, "Requester"),
    (4, Some(2), "Department Head A"),
    (5, Some(2), "Department Head B"),
    (7, Some(1), "Store Keeper"),
    (9, Some(3), "Finance Controller"),
];

fn seed_steps() -> Vec<NewStep> {
    vec![
        NewStep {
            approver: Approver::User(UserId(7)),
            description: "Store keeper checks stock".to_string(),
            timeout_days: Some(2),
        },
        NewStep {
            approver: Approver::Designation(DesignationId(2)),
            description: "Department head approval".to_string(),
            timeout_days: Some(3),
        },
        NewStep {
            approver: Approver::User(UserId(9)),
            description: "Finance sign-off".to_string(),
            timeout_days: None,
        },
    ]
}

pub fn run() -> CommandResult {
    let result = run_with_database("seed", |config, pool| async move {
        let directory = SqlDirectory::new(pool.clone());
        for (user, designation, name) in DIRECTORY_USERS {
            directory
                .upsert_user(UserId(*user), designation.map(DesignationId), name)
                .await
                .map_err(|error| ("seed_execution", error.to_string(), 6u8))?;
        }

        let engine = engine_for(&config, pool);
        let ctx = operator_context("seed");
        let existing = engine
            .process_pages(false)
            .collect_all()
            .await
            .map_err(seed_failure)?
            .into_iter()
            .find(|process| process.title == SEED_PROCESS_TITLE);

        let process = match existing {
            Some(process) => process,
            None => engine
                .create_process(
                    &ctx,
                    NewProcess {
                        title: SEED_PROCESS_TITLE.to_string(),
                        status: ProcessStatus::Active,
                        is_active: true,
                    },
                )
                .await
                .map_err(seed_failure)?,
        };

        // Only an empty chain is populated; an operator-edited chain is kept.
        if engine.ordered_steps(process.id).await.map_err(seed_failure)?.is_empty() {
            for step in seed_steps() {
                engine.add_step(&ctx, process.id, step).await.map_err(seed_failure)?;
            }
        }

        let steps = engine.ordered_steps(process.id).await.map_err(seed_failure)?;
        let users = directory
            .user_count()
            .await
            .map_err(|error| ("seed_verification", error.to_string(), 7u8))?;
        Ok::<_, Failure>((process.id, steps.len(), users))
    });

    match result {
        Ok((process_id, steps, users)) => CommandResult::success(
            "seed",
            format!(
                "process `{SEED_PROCESS_TITLE}` (id {process_id}) has {steps} steps; {users} directory users"
            ),
        ),
        Err(failure) => failure,
    }
}

fn seed_failure(error: procura_core::errors::WorkflowError) -> Failure {
    ("seed_execution", error.to_string(), 6)
}
