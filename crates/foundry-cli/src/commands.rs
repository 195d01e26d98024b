//! CLI command definitions.

use clap::{Args, Subcommand};
use std::path::PathBuf;

#[derive(Subcommand)]
pub enum Commands {
    /// Create a starter pipeline definition
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Validate a pipeline definition
    Validate {
        /// Path to pipeline file
        #[arg(default_value = "pipeline.yaml")]
        path: PathBuf,
    },

    /// Show which stages and jobs a trigger would run
    Plan {
        #[arg(default_value = "pipeline.yaml")]
        path: PathBuf,

        #[command(flatten)]
        trigger: TriggerArgs,
    },

    /// Execute a pipeline locally
    Run {
        #[arg(default_value = "pipeline.yaml")]
        path: PathBuf,

        #[command(flatten)]
        trigger: TriggerArgs,

        /// Print step output as it arrives
        #[arg(short, long)]
        follow: bool,
    },

    /// Continue an interrupted run
    Resume {
        /// Run ID
        run_id: String,

        /// Pipeline file (defaults to the one the run was created from)
        #[arg(short, long)]
        pipeline: Option<PathBuf>,

        #[arg(short, long)]
        follow: bool,
    },

    /// Show the state of a run
    Status {
        /// Run ID
        run_id: String,

        /// Print the full run record as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print captured step output
    Logs {
        /// Run ID
        run_id: String,

        /// Only this job (`Stage/job`)
        #[arg(short, long)]
        job: Option<String>,

        /// Only this step
        #[arg(short, long)]
        step: Option<String>,
    },

    /// List recent runs
    Runs {
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },

    /// Delete finished runs older than the retention period
    Prune {
        /// Override the configured retention in days
        #[arg(long)]
        days: Option<u32>,
    },

    /// List upcoming schedule firings
    Schedules {
        #[arg(default_value = "pipeline.yaml")]
        path: PathBuf,

        /// Number of firings to show
        #[arg(short, long, default_value_t = 10)]
        count: usize,

        /// Branches to check against each schedule's filter
        #[arg(short, long)]
        branch: Vec<String>,
    },

    /// Print the JSON schema of pipeline definitions
    Schema,

    /// Manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

/// Trigger inputs shared by `plan` and `run`.
#[derive(Args, Debug, Clone)]
pub struct TriggerArgs {
    /// Branch to build
    #[arg(short, long, default_value = "main")]
    pub branch: String,

    /// Build reason: manual, schedule, or ci
    #[arg(short, long, default_value = "manual")]
    pub reason: String,

    /// Parameter value as NAME=VALUE
    #[arg(short = 'p', long = "param", value_name = "NAME=VALUE")]
    pub params: Vec<String>,

    /// Who requested the run
    #[arg(long)]
    pub requested_for: Option<String>,
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,

    /// Print the configuration file locations
    Path,
}
