//! Run and execution record types.

use crate::ids::{JobKey, RunId};
use crate::snapshot::{Snapshot, TriggerContext};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Status of a stage, job, or step within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Canceled,
    TimedOut,
    Skipped,
}

impl NodeStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, NodeStatus::Pending | NodeStatus::Running)
    }

    /// Failed or timed out.
    pub fn is_failure(&self) -> bool {
        matches!(self, NodeStatus::Failed | NodeStatus::TimedOut)
    }

    /// Allowed forward transitions; status never moves backwards.
    pub fn can_transition_to(&self, next: NodeStatus) -> bool {
        match (self, next) {
            (NodeStatus::Pending, NodeStatus::Running | NodeStatus::Skipped) => true,
            (
                NodeStatus::Running,
                NodeStatus::Succeeded
                | NodeStatus::Failed
                | NodeStatus::Canceled
                | NodeStatus::TimedOut,
            ) => true,
            _ => false,
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeStatus::Pending => "pending",
            NodeStatus::Running => "running",
            NodeStatus::Succeeded => "succeeded",
            NodeStatus::Failed => "failed",
            NodeStatus::Canceled => "canceled",
            NodeStatus::TimedOut => "timed_out",
            NodeStatus::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// The node's own condition evaluated false.
    ConditionFalse,
    /// A dependency failed, timed out, or was canceled.
    DependencyFailed,
    /// A dependency was skipped and the policy requires success.
    DependencySkipped,
    /// The run was canceled before the node was dispatched.
    Canceled,
}

impl SkipReason {
    /// Skips that do not count against the run outcome.
    pub fn is_permissible(&self) -> bool {
        matches!(self, SkipReason::ConditionFalse | SkipReason::DependencySkipped)
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SkipReason::ConditionFalse => "condition false",
            SkipReason::DependencyFailed => "dependency failed",
            SkipReason::DependencySkipped => "dependency skipped",
            SkipReason::Canceled => "run canceled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::Canceled
        )
    }

    /// Process exit code reported for this outcome.
    pub fn exit_code(&self) -> i32 {
        match self {
            RunStatus::Succeeded => 0,
            RunStatus::Canceled => 130,
            _ => 1,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Canceled => "canceled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Run {
    pub id: RunId,
    pub pipeline_name: String,
    /// Path of the definition the run was created from.
    #[serde(default)]
    pub source: Option<String>,
    pub status: RunStatus,
    pub trigger: TriggerContext,
    pub snapshot: Snapshot,
    pub stages: Vec<StageRecord>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub canceled_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
}

impl Run {
    pub fn stage(&self, name: &str) -> Option<&StageRecord> {
        self.stages.iter().find(|s| s.name == name)
    }

    pub fn stage_mut(&mut self, name: &str) -> Option<&mut StageRecord> {
        self.stages.iter_mut().find(|s| s.name == name)
    }

    pub fn job(&self, key: &JobKey) -> Option<&JobRecord> {
        self.stage(&key.stage)?.jobs.iter().find(|j| j.name == key.job)
    }

    pub fn job_mut(&mut self, key: &JobKey) -> Option<&mut JobRecord> {
        self.stage_mut(&key.stage)?
            .jobs
            .iter_mut()
            .find(|j| j.name == key.job)
    }

    pub fn jobs(&self) -> impl Iterator<Item = &JobRecord> {
        self.stages.iter().flat_map(|s| s.jobs.iter())
    }

    /// True when every stage, job, and step is terminal.
    pub fn is_settled(&self) -> bool {
        self.stages.iter().all(|stage| {
            stage.status.is_terminal()
                && stage.jobs.iter().all(|job| {
                    job.status.is_terminal() && job.steps.iter().all(|s| s.status.is_terminal())
                })
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StageRecord {
    pub name: String,
    pub display_name: Option<String>,
    pub required: bool,
    pub status: NodeStatus,
    #[serde(default)]
    pub skip_reason: Option<SkipReason>,
    pub jobs: Vec<JobRecord>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct JobRecord {
    pub name: String,
    pub stage: String,
    pub display_name: Option<String>,
    pub pool: String,
    pub environment: String,
    pub status: NodeStatus,
    #[serde(default)]
    pub skip_reason: Option<SkipReason>,
    #[serde(default)]
    pub error: Option<String>,
    /// Environment acquisition attempts.
    #[serde(default)]
    pub attempts: u32,
    pub steps: Vec<StepRecord>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    pub fn key(&self) -> JobKey {
        JobKey::new(&self.stage, &self.name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StepRecord {
    pub name: String,
    pub display_name: Option<String>,
    pub status: NodeStatus,
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub log: Vec<LogLine>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct LogLine {
    pub stream: LogStream,
    pub line_number: u32,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum LogStream {
    Stdout,
    Stderr,
}

/// Short listing entry for stored runs.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RunSummary {
    pub id: RunId,
    pub pipeline_name: String,
    pub status: RunStatus,
    pub branch: String,
    pub created_at: DateTime<Utc>,
    pub duration_ms: Option<u64>,
}

impl From<&Run> for RunSummary {
    fn from(run: &Run) -> Self {
        Self {
            id: run.id,
            pipeline_name: run.pipeline_name.clone(),
            status: run.status,
            branch: run.trigger.branch_name().to_string(),
            created_at: run.created_at,
            duration_ms: run.duration_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions_are_monotonic() {
        use NodeStatus::*;

        assert!(Pending.can_transition_to(Running));
        assert!(Pending.can_transition_to(Skipped));
        assert!(Running.can_transition_to(TimedOut));
        assert!(Running.can_transition_to(Canceled));

        assert!(!Running.can_transition_to(Pending));
        assert!(!Running.can_transition_to(Skipped));
        assert!(!Succeeded.can_transition_to(Running));
        assert!(!Failed.can_transition_to(Succeeded));
        assert!(!Skipped.can_transition_to(Running));
        assert!(!Pending.can_transition_to(Succeeded));
    }

    #[test]
    fn test_terminal_and_failure() {
        assert!(!NodeStatus::Running.is_terminal());
        assert!(NodeStatus::Skipped.is_terminal());
        assert!(NodeStatus::TimedOut.is_failure());
        assert!(!NodeStatus::Canceled.is_failure());
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(RunStatus::Succeeded.exit_code(), 0);
        assert_eq!(RunStatus::Failed.exit_code(), 1);
        assert_eq!(RunStatus::Canceled.exit_code(), 130);
    }
}
