pub mod commands;
pub mod logging;

use std::process::ExitCode;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "opsflow",
    about = "Opsflow approval engine operator CLI",
    long_about = "Operate the Opsflow approval engine: migrations, demo workflows, config inspection, SLA escalation and history verification.",
    after_help = "Examples:\n  opsflow doctor --json\n  opsflow escalate --limit 50\n  opsflow verify-history REQ-0b7e..."
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(about = "Load the demo workflow definitions (idempotent)")]
    Seed,
    #[command(about = "Inspect effective configuration values with source attribution and redaction")]
    Config,
    #[command(about = "Validate config, DB connectivity and schema version")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    #[command(about = "Flag in-flight requests whose current level exceeded its SLA")]
    Escalate {
        #[arg(long, help = "Maximum requests to examine (defaults to engine.escalation_batch_limit)")]
        limit: Option<u32>,
        #[arg(long, help = "Evaluate SLAs as of this RFC 3339 instant instead of now")]
        as_of: Option<DateTime<Utc>>,
    },
    #[command(about = "Verify the hash chain and signatures of a request's history")]
    VerifyHistory {
        #[arg(help = "Approval request id")]
        request_id: String,
    },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(),
        Command::Seed => commands::seed::run(),
        Command::Config => commands::config::run(),
        Command::Doctor { json } => commands::doctor::run(json),
        Command::Escalate { limit, as_of } => commands::escalate::run(limit, as_of),
        Command::VerifyHistory { request_id } => commands::verify_history::run(&request_id),
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
