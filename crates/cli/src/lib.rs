pub mod commands;

use clap::{Parser, Subcommand};
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "procura",
    about = "Procura operator CLI",
    long_about = "Operate the Procura approval workflow store: migrations, demo data, config inspection, readiness checks and catalog listings.",
    after_help = "Examples:\n  procura doctor --json\n  procura seed\n  procura steps 1"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(about = "Load the idempotent Material Request demo process and directory users")]
    Seed,
    #[command(
        about = "Inspect effective configuration values with source attribution and redaction"
    )]
    Config,
    #[command(about = "Validate config, database connectivity and the workflow schema")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    #[command(about = "List approval processes as JSON")]
    Processes {
        #[arg(long, help = "Include archived processes")]
        include_archived: bool,
    },
    #[command(about = "List a process's steps in approval order as JSON")]
    Steps {
        #[arg(help = "Process id")]
        process_id: i64,
    },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(),
        Command::Seed => commands::seed::run(),
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run() }
        }
        Command::Doctor { json } => {
            commands::CommandResult { exit_code: 0, output: commands::doctor::run(json) }
        }
        Command::Processes { include_archived } => commands::processes::run(include_archived),
        Command::Steps { process_id } => commands::steps::run(process_id),
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
