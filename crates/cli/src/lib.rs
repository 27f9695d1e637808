pub mod commands;

use clap::{Parser, Subcommand};
use kuria_core::domain::action::ActionId;
use kuria_core::domain::company::CompanyId;
use std::process::ExitCode;

use commands::Target;

#[derive(Debug, Parser)]
#[command(
    name = "kuria",
    about = "Kuria operator CLI",
    long_about = "Operate the Kuria store: migrations, readiness checks, config inspection, \
                  tenant recomputes and the approval queue.",
    after_help = "Examples:\n  kuria doctor --json\n  kuria recompute --company acme\n  kuria pending acme"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(about = "Check config, dispatcher endpoint, DB connectivity and schema version")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    #[command(
        about = "Inspect effective configuration values with source attribution and redaction"
    )]
    Config,
    #[command(about = "Recompute snapshots, reminders and win/loss rows for one or every tenant")]
    Recompute {
        #[arg(long, help = "Only this company; every tenant when omitted")]
        company: Option<String>,
    },
    #[command(about = "Run one event routing batch for one or every tenant")]
    Route {
        #[arg(long, help = "Only this company; every tenant when omitted")]
        company: Option<String>,
    },
    #[command(about = "List actions awaiting approval for a company")]
    Pending { company: String },
    #[command(about = "Reject a pending action")]
    Reject {
        company: String,
        action: String,
        #[arg(long = "by", help = "Who decided")]
        decided_by: String,
    },
    #[command(about = "Expire a pending action")]
    Expire { company: String, action: String },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(),
        Command::Doctor { json } => {
            let (exit_code, output) = commands::doctor::run(json);
            commands::CommandResult { exit_code, output }
        }
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run() }
        }
        Command::Recompute { company } => commands::tenants::recompute(Target::from_args(company)),
        Command::Route { company } => commands::tenants::route(Target::from_args(company)),
        Command::Pending { company } => commands::actions::pending(CompanyId(company)),
        Command::Reject { company, action, decided_by } => {
            commands::actions::reject(CompanyId(company), ActionId(action), decided_by)
        }
        Command::Expire { company, action } => {
            commands::actions::expire(CompanyId(company), ActionId(action))
        }
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
