//! Foundry CLI entrypoint.

use clap::Parser;
use console::style;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

mod commands;
mod config;
mod handlers;
mod output;

use crate::commands::{Commands, ConfigCommands};
use crate::config::CliConfig;

#[derive(Parser)]
#[command(name = "foundry")]
#[command(author, version, about = "Run staged CI pipelines on this machine", long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Project directory holding foundry.yaml and run state
    #[arg(short = 'C', long, global = true, default_value = ".")]
    dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Load-time failures exit with 2, everything else with 1.
fn failure_code(err: &anyhow::Error) -> ExitCode {
    let configuration = err.chain().any(|cause| {
        cause
            .downcast_ref::<foundry_core::Error>()
            .is_some_and(foundry_core::Error::is_configuration)
            || cause.downcast_ref::<::config::ConfigError>().is_some()
    });
    if configuration {
        ExitCode::from(2)
    } else {
        ExitCode::FAILURE
    }
}

async fn dispatch(cli: Cli) -> anyhow::Result<ExitCode> {
    let config = CliConfig::load(&cli.dir)?;

    match cli.command {
        Commands::Init { force } => handlers::init(force).await,
        Commands::Validate { path } => handlers::validate(&path).await,
        Commands::Plan { path, trigger } => handlers::plan(&config, &path, &trigger).await,
        Commands::Run {
            path,
            trigger,
            follow,
        } => handlers::run(&config, &path, &trigger, follow).await,
        Commands::Resume {
            run_id,
            pipeline,
            follow,
        } => handlers::resume(&config, &run_id, pipeline.as_deref(), follow).await,
        Commands::Status { run_id, json } => handlers::status(&config, &run_id, json).await,
        Commands::Logs { run_id, job, step } => {
            handlers::logs(&config, &run_id, job.as_deref(), step.as_deref()).await
        }
        Commands::Runs { limit } => handlers::runs(&config, limit).await,
        Commands::Prune { days } => handlers::prune(&config, days).await,
        Commands::Schedules {
            path,
            count,
            branch,
        } => handlers::schedules(&path, count, &branch).await,
        Commands::Schema => handlers::schema(),
        Commands::Config { command } => match command {
            ConfigCommands::Show => handlers::show_config(&config),
            ConfigCommands::Path => handlers::config_paths(&cli.dir),
        },
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match dispatch(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{} {:#}", style("✗").red(), err);
            failure_code(&err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_run_with_params() {
        let cli = Cli::try_parse_from([
            "foundry", "run", "ci.yaml", "-b", "release/1.0", "-p", "quality=fast", "--follow",
        ])
        .unwrap();
        match cli.command {
            Commands::Run {
                path,
                trigger,
                follow,
            } => {
                assert_eq!(path, PathBuf::from("ci.yaml"));
                assert_eq!(trigger.branch, "release/1.0");
                assert_eq!(trigger.params, vec!["quality=fast".to_string()]);
                assert!(follow);
            }
            _ => panic!("expected run command"),
        }
    }

    #[test]
    fn test_configuration_errors_exit_with_two() {
        let err: anyhow::Error = foundry_core::Error::configuration("cycle").into();
        assert_eq!(failure_code(&err), ExitCode::from(2));

        let err = anyhow::Error::from(foundry_core::Error::Internal("boom".into()))
            .context("run failed");
        assert_eq!(failure_code(&err), ExitCode::FAILURE);
    }
}
