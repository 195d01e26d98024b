//! Run lifecycle events.

use crate::ids::*;
use crate::run::{LogStream, NodeStatus, RunStatus, SkipReason};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Everything observable about a run while it executes.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    // Run lifecycle
    RunStarted(RunStartedPayload),
    RunCanceled(RunCanceledPayload),
    RunCompleted(RunCompletedPayload),

    // Stage lifecycle
    StageStarted(StageStartedPayload),
    StageCompleted(StageCompletedPayload),

    // Job lifecycle
    JobQueued(JobQueuedPayload),
    JobStarted(JobStartedPayload),
    JobCompleted(JobCompletedPayload),

    // Step lifecycle
    StepStarted(StepStartedPayload),
    StepOutput(StepOutputPayload),
    StepCompleted(StepCompletedPayload),

    NodeSkipped(NodeSkippedPayload),
}

impl Event {
    /// Dotted subject used for filtering and log correlation.
    pub fn subject(&self) -> String {
        match self {
            Event::RunStarted(p) => format!("run.started.{}", p.run_id),
            Event::RunCanceled(p) => format!("run.canceled.{}", p.run_id),
            Event::RunCompleted(p) => format!("run.completed.{}", p.run_id),
            Event::StageStarted(p) => format!("stage.started.{}.{}", p.run_id, p.stage),
            Event::StageCompleted(p) => format!("stage.completed.{}.{}", p.run_id, p.stage),
            Event::JobQueued(p) => format!("job.queued.{}.{}", p.run_id, p.job),
            Event::JobStarted(p) => format!("job.started.{}.{}", p.run_id, p.job),
            Event::JobCompleted(p) => format!("job.completed.{}.{}", p.run_id, p.job),
            Event::StepStarted(p) => {
                format!("step.started.{}.{}.{}", p.run_id, p.job, p.step)
            }
            Event::StepOutput(p) => format!("step.output.{}.{}.{}", p.run_id, p.job, p.step),
            Event::StepCompleted(p) => {
                format!("step.completed.{}.{}.{}", p.run_id, p.job, p.step)
            }
            Event::NodeSkipped(p) => format!("node.skipped.{}.{}", p.run_id, p.node),
        }
    }

    pub fn run_id(&self) -> RunId {
        match self {
            Event::RunStarted(p) => p.run_id,
            Event::RunCanceled(p) => p.run_id,
            Event::RunCompleted(p) => p.run_id,
            Event::StageStarted(p) => p.run_id,
            Event::StageCompleted(p) => p.run_id,
            Event::JobQueued(p) => p.run_id,
            Event::JobStarted(p) => p.run_id,
            Event::JobCompleted(p) => p.run_id,
            Event::StepStarted(p) => p.run_id,
            Event::StepOutput(p) => p.run_id,
            Event::StepCompleted(p) => p.run_id,
            Event::NodeSkipped(p) => p.run_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RunStartedPayload {
    pub run_id: RunId,
    pub pipeline_name: String,
    pub branch: String,
    pub reason: String,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RunCanceledPayload {
    pub run_id: RunId,
    pub reason: String,
    pub canceled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RunCompletedPayload {
    pub run_id: RunId,
    pub status: RunStatus,
    pub duration_ms: u64,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StageStartedPayload {
    pub run_id: RunId,
    pub stage: String,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StageCompletedPayload {
    pub run_id: RunId,
    pub stage: String,
    pub status: NodeStatus,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct JobQueuedPayload {
    pub run_id: RunId,
    pub job: JobKey,
    pub pool: String,
    pub queued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct JobStartedPayload {
    pub run_id: RunId,
    pub job: JobKey,
    pub pool: String,
    pub environment: String,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct JobCompletedPayload {
    pub run_id: RunId,
    pub job: JobKey,
    pub status: NodeStatus,
    pub error: Option<String>,
    pub duration_ms: u64,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StepStartedPayload {
    pub run_id: RunId,
    pub job: JobKey,
    pub step: String,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StepOutputPayload {
    pub run_id: RunId,
    pub job: JobKey,
    pub step: String,
    pub stream: LogStream,
    pub line_number: u32,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StepCompletedPayload {
    pub run_id: RunId,
    pub job: JobKey,
    pub step: String,
    pub status: NodeStatus,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    pub completed_at: DateTime<Utc>,
}

/// A stage (`job` is `None`) or job moved to skipped without dispatch.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct NodeSkippedPayload {
    pub run_id: RunId,
    /// `Stage` or `Stage/job`.
    pub node: String,
    pub reason: SkipReason,
    pub skipped_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_tagging() {
        let event = Event::JobQueued(JobQueuedPayload {
            run_id: RunId::new(),
            job: JobKey::new("Compile", "compile"),
            pool: "default".to_string(),
            queued_at: Utc::now(),
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "job_queued");
        assert_eq!(json["job"]["stage"], "Compile");
    }

    #[test]
    fn test_subject() {
        let run_id = RunId::new();
        let event = Event::NodeSkipped(NodeSkippedPayload {
            run_id,
            node: "Linux/build_arm64".to_string(),
            reason: SkipReason::DependencyFailed,
            skipped_at: Utc::now(),
        });
        assert_eq!(
            event.subject(),
            format!("node.skipped.{}.Linux/build_arm64", run_id)
        );
        assert_eq!(event.run_id(), run_id);
    }
}
