//! Command handlers.

use crate::commands::TriggerArgs;
use crate::config::CliConfig;
use crate::output::{ConsoleReporter, format_duration, print_run, run_status, status_mark};
use anyhow::{Context, Result};
use chrono::Utc;
use console::style;
use foundry_core::Error;
use foundry_core::ids::RunId;
use foundry_core::pipeline::PipelineDefinition;
use foundry_core::ports::RunRepository;
use foundry_core::run::{NodeStatus, RunStatus};
use foundry_core::snapshot::{BuildReason, TriggerContext};
use foundry_runner::LocalEnvironmentProvider;
use foundry_scheduler::triggers::upcoming;
use foundry_scheduler::{
    FileRunStore, LoadedPipeline, Orchestrator, PipelineLoader, RunRequest, RunStateTracker,
    preview,
};
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const STARTER_PIPELINE: &str = r#"name: product-build

parameters:
  - name: quality
    type: enum
    values: [insider, stable]
    default: insider
  - name: publish
    type: boolean
    default: false

variables:
  - name: Quality
    expr: parameters.quality
  - name: ShouldPublish
    expr: and(parameters.publish, eq(variables['Build.SourceBranchName'], 'main'))

pools:
  - name: linux
    max_concurrency: 2

templates:
  compile-steps:
    kind: steps
    parameters:
      - name: target
    body:
      - name: compile-${{ parameters.target }}
        run: echo "compiling for ${{ parameters.target }} ($(Quality))"

stages:
  - name: Compile
    jobs:
      - name: compile
        steps:
          - template: compile-steps
            parameters:
              target: all

  - name: Linux
    depends_on: [Compile]
    pool: linux
    jobs:
      - name: x64
        steps:
          - template: compile-steps
            parameters:
              target: linux-x64
      - name: arm64
        steps:
          - template: compile-steps
            parameters:
              target: linux-arm64

  - name: Publish
    depends_on: [Linux]
    condition: eq(variables.ShouldPublish, true)
    jobs:
      - name: publish
        steps:
          - name: upload
            run: echo "publishing $(Quality) build"
"#;

fn load(path: &Path) -> Result<LoadedPipeline> {
    Ok(PipelineLoader::new().load_file(path)?)
}

fn parse_run_id(value: &str) -> Result<RunId> {
    Ok(value
        .parse::<RunId>()
        .map_err(|e| Error::configuration(format!("invalid run ID '{}': {}", value, e)))?)
}

fn parse_param(raw: &str) -> Result<(String, serde_json::Value)> {
    let (name, value) = raw.split_once('=').ok_or_else(|| {
        Error::configuration(format!("parameter '{}' must be NAME=VALUE", raw))
    })?;
    let value = match serde_json::from_str::<serde_json::Value>(value) {
        Ok(parsed @ (serde_json::Value::Bool(_) | serde_json::Value::Number(_))) => parsed,
        _ => serde_json::Value::String(value.to_string()),
    };
    Ok((name.trim().to_string(), value))
}

fn run_request(args: &TriggerArgs, source: Option<&Path>) -> Result<RunRequest> {
    let reason: BuildReason = args.reason.parse().map_err(Error::Configuration)?;
    let mut trigger = TriggerContext::new(reason, &args.branch);
    if let Some(actor) = &args.requested_for {
        trigger = trigger.requested_for(actor);
    }
    let mut request = RunRequest::new(trigger);
    for raw in &args.params {
        let (name, value) = parse_param(raw)?;
        request.parameters.insert(name, value);
    }
    request.source = source.map(|p| {
        std::fs::canonicalize(p)
            .unwrap_or_else(|_| p.to_path_buf())
            .display()
            .to_string()
    });
    Ok(request)
}

fn orchestrator(config: &CliConfig, follow: bool) -> Orchestrator {
    let provider = LocalEnvironmentProvider::new(config.environment_settings());
    Orchestrator::new(
        Arc::new(provider),
        Arc::new(ConsoleReporter::new(follow)),
        Arc::new(FileRunStore::new(&config.state_dir)),
    )
    .with_settings(config.orchestrator_settings())
}

/// Cancel `token` on Ctrl-C.
fn cancel_on_interrupt(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, canceling run");
            token.cancel();
        }
    });
}

fn exit_code(status: RunStatus) -> ExitCode {
    ExitCode::from(status.exit_code() as u8)
}

/// Initialize a new pipeline.
pub async fn init(force: bool) -> Result<ExitCode> {
    let path = Path::new("pipeline.yaml");

    if path.exists() && !force {
        println!("{} pipeline.yaml already exists", style("!").yellow());
        return Ok(ExitCode::SUCCESS);
    }

    std::fs::write(path, STARTER_PIPELINE)?;
    println!("{} Created pipeline.yaml", style("✓").green());
    Ok(ExitCode::SUCCESS)
}

/// Validate a pipeline configuration.
pub async fn validate(path: &Path) -> Result<ExitCode> {
    let pipeline = load(path)?;

    println!(
        "{} Pipeline \"{}\" is valid",
        style("✓").green(),
        pipeline.name()
    );
    println!(
        "  Parameters: {}  Variables: {}  Templates: {}",
        pipeline.definition.parameters.len(),
        pipeline.definition.variables.len(),
        pipeline.definition.templates.len()
    );
    println!(
        "  Stages: {}  Jobs: {}",
        pipeline.graph.stage_count(),
        pipeline.graph.job_count()
    );

    for stage in pipeline.graph.stages() {
        let deps = if stage.depends_on.is_empty() {
            String::new()
        } else {
            format!(" <- {}", stage.depends_on.join(", "))
        };
        println!("    - {}{}", style(&stage.name).bold(), style(deps).dim());
        for job in pipeline.graph.jobs(&stage.name) {
            println!(
                "        {} [{}] {} steps",
                job.key.job,
                job.selector,
                job.spec.steps.len()
            );
        }
    }

    Ok(ExitCode::SUCCESS)
}

/// Show the active subgraph for a trigger.
pub async fn plan(config: &CliConfig, path: &Path, args: &TriggerArgs) -> Result<ExitCode> {
    let pipeline = load(path)?;
    let run = orchestrator(config, false).prepare(&pipeline, run_request(args, None)?)?;
    let snapshot = run.snapshot.clone();

    println!(
        "Plan for {} ({} on {})",
        style(pipeline.name()).bold(),
        run.trigger.reason,
        run.trigger.branch_name()
    );
    if !snapshot.parameters.is_empty() {
        println!("  Parameters:");
        for (name, value) in &snapshot.parameters {
            println!("    {} = {}", name, value);
        }
    }

    let mut tracker = RunStateTracker::new(run);
    preview(&pipeline.graph, &mut tracker, &snapshot)?;

    for stage in &tracker.run().stages {
        let (mark, note) = match stage.status {
            NodeStatus::Skipped => (
                status_mark(NodeStatus::Skipped),
                stage.skip_reason.map(|r| format!(" ({})", r)).unwrap_or_default(),
            ),
            _ => (style("▶").cyan(), String::new()),
        };
        println!("  {} {}{}", mark, style(&stage.name).bold(), style(note).dim());
        if stage.status == NodeStatus::Skipped {
            continue;
        }
        for job in &stage.jobs {
            let note = job
                .skip_reason
                .map(|r| format!(" ({})", r))
                .unwrap_or_default();
            let mark = if job.status == NodeStatus::Skipped {
                status_mark(NodeStatus::Skipped)
            } else {
                style("▶").cyan()
            };
            println!(
                "      {} {} [{}]{}",
                mark,
                job.name,
                job.environment,
                style(note).dim()
            );
        }
    }

    Ok(ExitCode::SUCCESS)
}

/// Execute a pipeline locally.
pub async fn run(
    config: &CliConfig,
    path: &Path,
    args: &TriggerArgs,
    follow: bool,
) -> Result<ExitCode> {
    let pipeline = load(path)?;
    let request = run_request(args, Some(path))?;

    let cancel = CancellationToken::new();
    cancel_on_interrupt(cancel.clone());

    let run = orchestrator(config, follow)
        .run(&pipeline, request, cancel)
        .await?;
    info!(run_id = %run.id, status = %run.status, "Run finished");
    Ok(exit_code(run.status))
}

/// Continue an interrupted run.
pub async fn resume(
    config: &CliConfig,
    run_id: &str,
    pipeline_path: Option<&Path>,
    follow: bool,
) -> Result<ExitCode> {
    let id = parse_run_id(run_id)?;
    let store = FileRunStore::new(&config.state_dir);
    let stored = store
        .get(id)
        .await?
        .ok_or_else(|| Error::RunNotFound(run_id.to_string()))?;

    let path = match (pipeline_path, &stored.source) {
        (Some(path), _) => path.to_path_buf(),
        (None, Some(source)) => source.into(),
        (None, None) => {
            return Err(Error::configuration(format!(
                "run {} has no recorded pipeline file; pass --pipeline",
                id
            ))
            .into());
        }
    };
    let pipeline = load(&path)?;

    let cancel = CancellationToken::new();
    cancel_on_interrupt(cancel.clone());

    let run = orchestrator(config, follow)
        .resume(&pipeline, id, cancel)
        .await?;
    Ok(exit_code(run.status))
}

/// Show the state of a run.
pub async fn status(config: &CliConfig, run_id: &str, json: bool) -> Result<ExitCode> {
    let id = parse_run_id(run_id)?;
    let run = FileRunStore::new(&config.state_dir)
        .get(id)
        .await?
        .ok_or_else(|| Error::RunNotFound(run_id.to_string()))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&run)?);
    } else {
        print_run(&run);
    }
    Ok(ExitCode::SUCCESS)
}

/// Print captured step output.
pub async fn logs(
    config: &CliConfig,
    run_id: &str,
    job: Option<&str>,
    step: Option<&str>,
) -> Result<ExitCode> {
    let id = parse_run_id(run_id)?;
    let run = FileRunStore::new(&config.state_dir)
        .get(id)
        .await?
        .ok_or_else(|| Error::RunNotFound(run_id.to_string()))?;

    let mut printed = 0;
    for record in run.jobs() {
        if job.is_some_and(|j| j != record.key().to_string()) {
            continue;
        }
        for step_record in &record.steps {
            if step.is_some_and(|s| s != step_record.name) || step_record.log.is_empty() {
                continue;
            }
            println!(
                "{} {} / {}",
                status_mark(step_record.status),
                style(record.key()).bold(),
                style(&step_record.name).bold()
            );
            for line in &step_record.log {
                println!(
                    "{:>5} {}",
                    style(line.line_number).dim(),
                    line.content
                );
                printed += 1;
            }
        }
    }

    if printed == 0 {
        println!("{} No output captured", style("i").blue());
    }
    Ok(ExitCode::SUCCESS)
}

/// List recent runs.
pub async fn runs(config: &CliConfig, limit: usize) -> Result<ExitCode> {
    let summaries = FileRunStore::new(&config.state_dir).list(limit).await?;
    if summaries.is_empty() {
        println!("{} No runs recorded", style("i").blue());
        return Ok(ExitCode::SUCCESS);
    }

    for summary in summaries {
        println!(
            "{}  {:<10} {:<20} {:<16} {} {}",
            summary.id,
            run_status(summary.status),
            summary.pipeline_name,
            summary.branch,
            summary.created_at.format("%Y-%m-%d %H:%M"),
            summary
                .duration_ms
                .map(format_duration)
                .unwrap_or_default()
        );
    }
    Ok(ExitCode::SUCCESS)
}

/// Delete finished runs past retention.
pub async fn prune(config: &CliConfig, days: Option<u32>) -> Result<ExitCode> {
    let days = days.unwrap_or(config.retention_days);
    let cutoff = Utc::now() - chrono::Duration::days(i64::from(days));
    let removed = FileRunStore::new(&config.state_dir).prune(cutoff).await?;
    println!(
        "{} Removed {} run(s) older than {} days",
        style("✓").green(),
        removed.len(),
        days
    );
    Ok(ExitCode::SUCCESS)
}

/// List upcoming schedule firings.
pub async fn schedules(path: &Path, count: usize, branches: &[String]) -> Result<ExitCode> {
    let pipeline = load(path)?;
    if pipeline.definition.schedules.is_empty() {
        println!("{} {} has no schedules", style("i").blue(), pipeline.name());
        return Ok(ExitCode::SUCCESS);
    }

    for firing in upcoming(&pipeline.definition.schedules, Utc::now(), count)? {
        let targets = if branches.is_empty() {
            firing.branches.include.join(", ")
        } else {
            firing.matching(branches).join(", ")
        };
        println!(
            "{}  {:<24} {}  {}{}",
            firing.at.format("%Y-%m-%d %H:%M UTC"),
            firing.display_name,
            style(&firing.cron).dim(),
            if targets.is_empty() {
                style("no matching branches".to_string()).dim()
            } else {
                style(targets)
            },
            if firing.always {
                ""
            } else {
                " (only with new changes)"
            }
        );
    }
    Ok(ExitCode::SUCCESS)
}

/// Print the pipeline definition JSON schema.
pub fn schema() -> Result<ExitCode> {
    let schema = schemars::schema_for!(PipelineDefinition);
    println!("{}", serde_json::to_string_pretty(&schema)?);
    Ok(ExitCode::SUCCESS)
}

/// Show the effective configuration.
pub fn show_config(config: &CliConfig) -> Result<ExitCode> {
    print!("{}", serde_yaml::to_string(config).context("failed to render configuration")?);
    Ok(ExitCode::SUCCESS)
}

pub fn config_paths(project_dir: &Path) -> Result<ExitCode> {
    println!("project: {}", project_dir.join(crate::config::PROJECT_FILE).display());
    match CliConfig::user_config_path() {
        Some(path) => println!("user:    {}", path.display()),
        None => println!("user:    (no home directory)"),
    }
    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn parse_params(raw: &[&str]) -> Result<BTreeMap<String, serde_json::Value>> {
        raw.iter().map(|r| parse_param(r)).collect()
    }

    #[test]
    fn test_parse_params() {
        let params = parse_params(&["publish=true", "quality=stable", "retries=3"]).unwrap();
        assert_eq!(params["publish"], json!(true));
        assert_eq!(params["quality"], json!("stable"));
        assert_eq!(params["retries"], json!(3));

        assert!(parse_params(&["publish"]).is_err());
    }

    #[test]
    fn test_starter_pipeline_is_valid() {
        let pipeline = PipelineLoader::new().load_str(STARTER_PIPELINE).unwrap();
        assert_eq!(pipeline.graph.stage_count(), 3);
        assert_eq!(pipeline.graph.job_count(), 4);
    }
}
