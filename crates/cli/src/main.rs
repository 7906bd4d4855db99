//! # Gauntlet
//!
//! Command line front end of the test-campaign executor: start or resume
//! runs, inspect their progress, and clean up run directories. The exit
//! code reports the most severe outcome of the run.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use gauntlet_engine::{CleanTarget, ResumeTarget, RunRequest, perform_run};
use gauntlet_types::{EXIT_ERROR, EXIT_OK, Step};

#[derive(Parser)]
#[command(name = "gauntlet", version, about = "Resumable test-campaign executor")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a campaign run, or resume an existing one.
    Run(RunArgs),
    /// Show step progress and totals of a run.
    Status(StatusArgs),
    /// Remove run directories.
    Clean(CleanArgs),
}

#[derive(Args)]
struct RunArgs {
    /// Plan file to start a new run from.
    #[arg(
        long,
        value_name = "FILE",
        conflicts_with_all = ["id", "last", "again", "force", "rerun"]
    )]
    plan: Option<PathBuf>,
    /// Resume the run with this id.
    #[arg(long, value_name = "ID", conflicts_with = "last")]
    id: Option<String>,
    /// Resume the most recent run.
    #[arg(long)]
    last: bool,
    /// Wipe the resumed run's results and execute everything again.
    #[arg(long, conflicts_with = "force")]
    again: bool,
    /// Redo every step of the resumed run.
    #[arg(long)]
    force: bool,
    /// Re-execute only the tests that have not passed yet.
    #[arg(long, conflicts_with_all = ["again", "force"])]
    rerun: bool,
    /// Stop once this step has run.
    #[arg(long, value_name = "STEP", value_parser = parse_step)]
    until: Option<Step>,
    /// Attach tests to the terminal instead of capturing their output.
    #[arg(long)]
    interactive: bool,
}

#[derive(Args)]
struct StatusArgs {
    /// Run id to inspect.
    #[arg(long, value_name = "ID", conflicts_with = "last")]
    id: Option<String>,
    /// Inspect the most recent run (the default).
    #[arg(long)]
    last: bool,
}

#[derive(Args)]
struct CleanArgs {
    /// Run id to remove.
    #[arg(long, value_name = "ID", conflicts_with_all = ["last", "all"])]
    id: Option<String>,
    /// Remove the most recent run (the default).
    #[arg(long, conflicts_with = "all")]
    last: bool,
    /// Remove every run directory.
    #[arg(long)]
    all: bool,
}

fn parse_step(value: &str) -> Result<Step, String> {
    let step: Step = value.parse()?;
    if step.is_terminal() {
        return Err(format!("'{step}' is not part of the run pipeline"));
    }
    Ok(step)
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();
    let code = match dispatch(cli).await {
        Ok(code) => code,
        Err(error) => {
            error!("{error:#}");
            EXIT_ERROR
        }
    };
    std::process::exit(code);
}

fn init_tracing() {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into());
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

async fn dispatch(cli: Cli) -> Result<i32> {
    match cli.command {
        Commands::Run(args) => run(args).await,
        Commands::Status(args) => status(args),
        Commands::Clean(args) => clean(args),
    }
}

async fn run(args: RunArgs) -> Result<i32> {
    let resume = match (args.id, args.last) {
        (Some(id), _) => Some(ResumeTarget::Id(id)),
        (None, true) => Some(ResumeTarget::Last),
        (None, false) => None,
    };
    let request = RunRequest {
        plan_path: args.plan,
        resume,
        again: args.again,
        force: args.force,
        rerun: args.rerun,
        until: args.until,
        interactive: args.interactive,
    };

    let cancel = CancellationToken::new();
    let handler = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping the run");
            handler.cancel();
        }
    });

    let report = perform_run(request, cancel).await?;
    Ok(report.exit_code())
}

fn status(args: StatusArgs) -> Result<i32> {
    let target = match (args.id, args.last) {
        (Some(id), _) => ResumeTarget::Id(id),
        _ => ResumeTarget::Last,
    };
    let overview = gauntlet_engine::overview(&target)?;

    println!(
        "{} (created {})",
        overview.id,
        overview.created.format("%Y-%m-%d %H:%M:%S UTC")
    );
    for plan in &overview.plans {
        let steps = if plan.done.is_empty() {
            "nothing done".to_string()
        } else {
            plan.done
                .iter()
                .map(|step| step.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        };
        println!("  {}: {steps}", plan.name);
        if let Some(totals) = &plan.totals {
            println!("    {}", totals.executed_phrase());
            println!("    {}", totals.phrase());
        }
    }
    Ok(EXIT_OK)
}

fn clean(args: CleanArgs) -> Result<i32> {
    let target = if args.all {
        CleanTarget::All
    } else {
        match (args.id, args.last) {
            (Some(id), _) => CleanTarget::Id(id),
            _ => CleanTarget::Last,
        }
    };
    let removed = gauntlet_engine::clean(&target)?;
    if removed.is_empty() {
        println!("nothing to clean");
    } else {
        for id in removed {
            println!("removed {id}");
        }
    }
    Ok(EXIT_OK)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn the_command_line_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn a_new_run_takes_a_plan_file() {
        let cli = Cli::try_parse_from(["gauntlet", "run", "--plan", "campaign.yaml"]).unwrap();
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.plan, Some(PathBuf::from("campaign.yaml")));
                assert!(args.id.is_none());
                assert!(!args.last);
            }
            _ => panic!("expected the run command"),
        }
    }

    #[test]
    fn resume_flags_conflict_with_a_plan_file() {
        for flag in ["--last", "--again", "--force", "--rerun"] {
            let result = Cli::try_parse_from(["gauntlet", "run", "--plan", "campaign.yaml", flag]);
            assert!(result.is_err(), "{flag} should conflict with --plan");
        }
        let result = Cli::try_parse_from(["gauntlet", "run", "--id", "7", "--last"]);
        assert!(result.is_err(), "--id should conflict with --last");
    }

    #[test]
    fn until_accepts_pipeline_step_names() {
        let cli =
            Cli::try_parse_from(["gauntlet", "run", "--last", "--until", "provision"]).unwrap();
        match cli.command {
            Commands::Run(args) => assert_eq!(args.until, Some(Step::Provision)),
            _ => panic!("expected the run command"),
        }
        assert!(Cli::try_parse_from(["gauntlet", "run", "--until", "nonsense"]).is_err());
        assert!(
            Cli::try_parse_from(["gauntlet", "run", "--until", "cleanup"]).is_err(),
            "cleanup belongs to the clean command"
        );
    }

    #[test]
    fn clean_defaults_to_the_last_run() {
        let cli = Cli::try_parse_from(["gauntlet", "clean"]).unwrap();
        match cli.command {
            Commands::Clean(args) => {
                assert!(args.id.is_none());
                assert!(!args.all);
            }
            _ => panic!("expected the clean command"),
        }
        assert!(Cli::try_parse_from(["gauntlet", "clean", "--all", "--last"]).is_err());
    }
}
