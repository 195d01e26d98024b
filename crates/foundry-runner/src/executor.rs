//! Sequential step execution for one job.

use crate::environments::Environment;
use crate::runner::{OutputLine, StepContext, StepResult};
use chrono::Utc;
use foundry_core::Error;
use foundry_core::events::{Event, StepCompletedPayload, StepOutputPayload, StepStartedPayload};
use foundry_core::expr::Value;
use foundry_core::ids::{JobKey, RunId};
use foundry_core::interpolation::expand_macros;
use foundry_core::pipeline::StepDefinition;
use foundry_core::ports::EventSink;
use foundry_core::run::{LogLine, NodeStatus, StepRecord};
use foundry_core::snapshot::{Snapshot, env_name};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Captured lines longer than this are truncated.
pub const MAX_LINE_BYTES: usize = 64 * 1024;

const OUTPUT_BUFFER: usize = 256;

/// A step with its effective timeout.
#[derive(Debug, Clone)]
pub struct StepSpec {
    pub definition: StepDefinition,
    pub timeout: Duration,
}

impl StepSpec {
    pub fn new(definition: StepDefinition) -> Self {
        let timeout = Duration::from_secs(u64::from(definition.timeout_minutes) * 60);
        Self {
            definition,
            timeout,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }
}

/// A resolved job ready to execute.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub key: JobKey,
    pub timeout: Duration,
    pub timeout_minutes: u32,
    /// Job variables exported to every step.
    pub variables: BTreeMap<String, String>,
    pub steps: Vec<StepSpec>,
}

impl JobSpec {
    pub fn new(key: JobKey, timeout_minutes: u32, steps: Vec<StepSpec>) -> Self {
        Self {
            key,
            timeout: Duration::from_secs(u64::from(timeout_minutes) * 60),
            timeout_minutes,
            variables: BTreeMap::new(),
            steps,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Fresh pending records for every step.
    pub fn pending_steps(&self) -> Vec<StepRecord> {
        self.steps
            .iter()
            .map(|step| StepRecord {
                name: step.definition.name.clone(),
                display_name: step.definition.display_name.clone(),
                status: NodeStatus::Pending,
                exit_code: None,
                error: None,
                log: Vec::new(),
                started_at: None,
                completed_at: None,
                duration_ms: None,
            })
            .collect()
    }
}

/// Final state of a job and its steps.
#[derive(Debug, Clone)]
pub struct JobExecution {
    pub status: NodeStatus,
    pub error: Option<String>,
    pub steps: Vec<StepRecord>,
}

enum StepOutcome {
    Finished(foundry_core::Result<StepResult>),
    TimedOut { job_deadline: bool },
    Canceled,
}

/// Truncate `content` to at most `max` bytes on a char boundary.
pub fn truncate_line(mut content: String, max: usize) -> String {
    if content.len() > max {
        let mut end = max;
        while !content.is_char_boundary(end) {
            end -= 1;
        }
        content.truncate(end);
    }
    content
}

/// Runs a job's steps in order on an acquired environment.
pub struct JobExecutor {
    events: Arc<dyn EventSink>,
}

impl JobExecutor {
    pub fn new(events: Arc<dyn EventSink>) -> Self {
        Self { events }
    }

    async fn publish(&self, event: Event) {
        if let Err(e) = self.events.publish(event).await {
            warn!(error = %e, "Failed to publish event");
        }
    }

    /// Run every step of `spec`. The first failing step halts the job
    /// unless it is marked continue-on-error; halted steps end skipped.
    pub async fn execute(
        &self,
        run_id: RunId,
        spec: &JobSpec,
        snapshot: &Snapshot,
        environment: &dyn Environment,
        cancel: &CancellationToken,
    ) -> JobExecution {
        let job_deadline = Instant::now() + spec.timeout;
        let runner = environment.runner();
        let mut records = spec.pending_steps();
        let mut status = NodeStatus::Succeeded;
        let mut error: Option<String> = None;
        let mut halted = false;

        let mut macros = snapshot.variables.clone();
        for (name, value) in &spec.variables {
            let expanded = expand_macros(value, &snapshot.variables);
            macros.insert(name.clone(), Value::from(expanded));
        }
        let mut base_env = snapshot.environment();
        for (name, value) in &spec.variables {
            base_env.insert(env_name(name), expand_macros(value, &macros));
        }

        info!(
            run_id = %run_id,
            job = %spec.key,
            environment = %environment.description(),
            "Executing job"
        );

        for (index, step) in spec.steps.iter().enumerate() {
            if !halted && cancel.is_cancelled() {
                status = NodeStatus::Canceled;
                error = Some(
                    Error::Canceled {
                        reason: "run canceled".to_string(),
                    }
                    .to_string(),
                );
                halted = true;
            }
            if halted {
                records[index].status = NodeStatus::Skipped;
                continue;
            }

            if let Some(condition) = &step.definition.condition {
                match condition.evaluate(snapshot) {
                    Ok(true) => {}
                    Ok(false) => {
                        debug!(job = %spec.key, step = %step.name(), "Step condition false, skipping");
                        records[index].status = NodeStatus::Skipped;
                        continue;
                    }
                    Err(e) => {
                        records[index].status = NodeStatus::Failed;
                        records[index].error = Some(e.to_string());
                        if !step.definition.continue_on_error {
                            status = NodeStatus::Failed;
                            error = Some(format!("step '{}': {}", step.name(), e));
                            halted = true;
                        }
                        continue;
                    }
                }
            }

            let mut step_env = base_env.clone();
            for (name, value) in &step.definition.env {
                step_env.insert(name.clone(), expand_macros(value, &macros));
            }
            let ctx = StepContext {
                step_name: step.name().to_string(),
                command: expand_macros(&step.definition.run, &macros),
                shell: step.definition.shell.clone(),
                workspace: environment.working_dir().to_path_buf(),
                working_directory: step.definition.working_directory.clone(),
                env: step_env,
            };

            let step_deadline = Instant::now() + step.timeout;
            let deadline = step_deadline.min(job_deadline);
            let started = Instant::now();

            let record = &mut records[index];
            record.status = NodeStatus::Running;
            record.started_at = Some(Utc::now());
            self.publish(Event::StepStarted(StepStartedPayload {
                run_id,
                job: spec.key.clone(),
                step: step.name().to_string(),
                started_at: Utc::now(),
            }))
            .await;

            let (tx, mut rx) = mpsc::channel::<OutputLine>(OUTPUT_BUFFER);
            let outcome = {
                let exec = runner.execute(&ctx, tx);
                tokio::pin!(exec);
                let timer = tokio::time::sleep_until(deadline);
                tokio::pin!(timer);
                let mut rx_open = true;

                loop {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break StepOutcome::Canceled,
                        _ = &mut timer => break StepOutcome::TimedOut {
                            job_deadline: job_deadline <= step_deadline,
                        },
                        line = rx.recv(), if rx_open => match line {
                            Some(line) => self.capture(run_id, &spec.key, record, line).await,
                            None => rx_open = false,
                        },
                        result = &mut exec => break StepOutcome::Finished(result),
                    }
                }
            };
            while let Ok(line) = rx.try_recv() {
                self.capture(run_id, &spec.key, record, line).await;
            }

            record.completed_at = Some(Utc::now());
            record.duration_ms = Some(started.elapsed().as_millis() as u64);

            match outcome {
                StepOutcome::Finished(Ok(result)) => {
                    record.exit_code = Some(result.exit_code);
                    if result.success() {
                        record.status = NodeStatus::Succeeded;
                    } else {
                        let failure = Error::StepFailed {
                            exit_code: result.exit_code,
                            message: format!("step '{}'", step.name()),
                        };
                        record.status = NodeStatus::Failed;
                        record.error = Some(failure.to_string());
                        if !step.definition.continue_on_error {
                            status = NodeStatus::Failed;
                            error = Some(failure.to_string());
                            halted = true;
                        }
                    }
                }
                StepOutcome::Finished(Err(e)) => {
                    record.status = NodeStatus::Failed;
                    record.error = Some(e.to_string());
                    if !step.definition.continue_on_error {
                        status = NodeStatus::Failed;
                        error = Some(format!("step '{}': {}", step.name(), e));
                        halted = true;
                    }
                }
                StepOutcome::TimedOut { job_deadline } => {
                    record.status = NodeStatus::TimedOut;
                    if job_deadline {
                        let timeout = Error::JobTimeout {
                            minutes: spec.timeout_minutes,
                        };
                        record.error = Some(timeout.to_string());
                        status = NodeStatus::TimedOut;
                        error = Some(timeout.to_string());
                        halted = true;
                    } else {
                        let timeout = Error::StepTimeout {
                            minutes: step.definition.timeout_minutes,
                        };
                        record.error = Some(timeout.to_string());
                        if !step.definition.continue_on_error {
                            status = NodeStatus::TimedOut;
                            error = Some(format!("step '{}': {}", step.name(), timeout));
                            halted = true;
                        }
                    }
                    warn!(job = %spec.key, step = %step.name(), "Step timed out");
                }
                StepOutcome::Canceled => {
                    record.status = NodeStatus::Canceled;
                    status = NodeStatus::Canceled;
                    error = Some(
                        Error::Canceled {
                            reason: "run canceled".to_string(),
                        }
                        .to_string(),
                    );
                    halted = true;
                }
            }

            self.publish(Event::StepCompleted(StepCompletedPayload {
                run_id,
                job: spec.key.clone(),
                step: step.name().to_string(),
                status: record.status,
                exit_code: record.exit_code,
                duration_ms: record.duration_ms.unwrap_or_default(),
                completed_at: Utc::now(),
            }))
            .await;
        }

        info!(run_id = %run_id, job = %spec.key, status = %status, "Job finished");

        JobExecution {
            status,
            error,
            steps: records,
        }
    }

    async fn capture(&self, run_id: RunId, job: &JobKey, record: &mut StepRecord, line: OutputLine) {
        let line_number = record.log.len() as u32 + 1;
        let content = truncate_line(line.content, MAX_LINE_BYTES);
        self.publish(Event::StepOutput(StepOutputPayload {
            run_id,
            job: job.clone(),
            step: record.name.clone(),
            stream: line.stream,
            line_number,
            content: content.clone(),
            timestamp: line.timestamp,
        }))
        .await;
        record.log.push(LogLine {
            stream: line.stream,
            line_number,
            content,
            timestamp: line.timestamp,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environments::HostEnvironment;
    use foundry_core::expr::Condition;
    use foundry_core::ports::NullEventSink;
    use pretty_assertions::assert_eq;

    fn step(name: &str, run: &str) -> StepDefinition {
        StepDefinition {
            name: name.to_string(),
            display_name: None,
            run: run.to_string(),
            shell: "sh".to_string(),
            working_directory: None,
            env: BTreeMap::new(),
            condition: None,
            timeout_minutes: 30,
            continue_on_error: false,
        }
    }

    fn job(steps: Vec<StepSpec>) -> JobSpec {
        JobSpec::new(JobKey::new("Compile", "compile"), 60, steps)
    }

    fn statuses(execution: &JobExecution) -> Vec<NodeStatus> {
        execution.steps.iter().map(|s| s.status).collect()
    }

    async fn run(spec: &JobSpec, snapshot: &Snapshot, cancel: &CancellationToken) -> JobExecution {
        let env = HostEnvironment::new(std::env::temp_dir());
        JobExecutor::new(Arc::new(NullEventSink))
            .execute(RunId::new(), spec, snapshot, &env, cancel)
            .await
    }

    #[tokio::test]
    async fn test_failure_halts_remaining_steps() {
        let spec = job(vec![
            StepSpec::new(step("one", "echo one")),
            StepSpec::new(step("two", "exit 2")),
            StepSpec::new(step("three", "echo three")),
        ]);
        let result = run(&spec, &Snapshot::default(), &CancellationToken::new()).await;

        assert_eq!(result.status, NodeStatus::Failed);
        assert_eq!(
            statuses(&result),
            vec![NodeStatus::Succeeded, NodeStatus::Failed, NodeStatus::Skipped]
        );
        assert_eq!(result.steps[1].exit_code, Some(2));
        assert_eq!(result.steps[0].log[0].content, "one");
    }

    #[tokio::test]
    async fn test_continue_on_error() {
        let mut flaky = step("flaky", "exit 1");
        flaky.continue_on_error = true;
        let spec = job(vec![
            StepSpec::new(flaky),
            StepSpec::new(step("after", "echo after")),
        ]);
        let result = run(&spec, &Snapshot::default(), &CancellationToken::new()).await;

        assert_eq!(result.status, NodeStatus::Succeeded);
        assert_eq!(
            statuses(&result),
            vec![NodeStatus::Failed, NodeStatus::Succeeded]
        );
    }

    #[tokio::test]
    async fn test_step_timeout() {
        let spec = job(vec![
            StepSpec::new(step("slow", "sleep 5")).with_timeout(Duration::from_millis(100)),
            StepSpec::new(step("next", "echo next")),
        ]);
        let result = run(&spec, &Snapshot::default(), &CancellationToken::new()).await;

        assert_eq!(result.status, NodeStatus::TimedOut);
        assert_eq!(
            statuses(&result),
            vec![NodeStatus::TimedOut, NodeStatus::Skipped]
        );
    }

    #[tokio::test]
    async fn test_job_timeout_bounds_all_steps() {
        let mut lenient = step("slow", "sleep 5");
        lenient.continue_on_error = true;
        let spec = job(vec![StepSpec::new(lenient)]).with_timeout(Duration::from_millis(100));
        let result = run(&spec, &Snapshot::default(), &CancellationToken::new()).await;

        assert_eq!(result.status, NodeStatus::TimedOut);
        assert!(result.error.unwrap().contains("Job timeout"));
    }

    #[tokio::test]
    async fn test_cancellation_stops_running_step() {
        let spec = job(vec![
            StepSpec::new(step("hang", "sleep 30")),
            StepSpec::new(step("never", "echo never")),
        ]);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let result = run(&spec, &Snapshot::default(), &cancel).await;

        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(result.status, NodeStatus::Canceled);
        assert_eq!(
            statuses(&result),
            vec![NodeStatus::Canceled, NodeStatus::Skipped]
        );
    }

    #[tokio::test]
    async fn test_step_condition_and_variables() {
        let mut snapshot = Snapshot::default();
        snapshot
            .parameters
            .insert("VSCODE_BUILD_WEB".to_string(), Value::from(false));
        snapshot
            .variables
            .insert("VSCODE_QUALITY".to_string(), Value::from("insider"));

        let mut web = step("web", "echo web");
        web.condition = Some(Condition::parse("eq(parameters.VSCODE_BUILD_WEB, true)").unwrap());
        let mut spec = job(vec![
            StepSpec::new(web),
            StepSpec::new(step("env", "echo $VSCODE_QUALITY-$(VSCODE_QUALITY)-$TARGET")),
        ]);
        spec.variables
            .insert("target".to_string(), "linux-$(VSCODE_QUALITY)".to_string());

        let result = run(&spec, &snapshot, &CancellationToken::new()).await;
        assert_eq!(result.status, NodeStatus::Succeeded);
        assert_eq!(result.steps[0].status, NodeStatus::Skipped);
        assert_eq!(result.steps[1].log[0].content, "insider-insider-linux-insider");
    }

    #[test]
    fn test_truncate_line() {
        assert_eq!(truncate_line("abcdef".to_string(), 4), "abcd");
        assert_eq!(truncate_line("ab".to_string(), 4), "ab");
        // 'é' is two bytes; never split it.
        assert_eq!(truncate_line("aé".to_string(), 2), "a");
    }
}
