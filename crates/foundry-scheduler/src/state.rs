//! Run state tracking.
//!
//! Every status change of a stage, job, or step goes through
//! [`RunStateTracker`], which rejects backward transitions.

use crate::dag::PipelineGraph;
use chrono::Utc;
use foundry_core::ids::{JobKey, RunId};
use foundry_core::run::{JobRecord, NodeStatus, Run, RunStatus, SkipReason, StageRecord};
use foundry_core::snapshot::{Snapshot, TriggerContext};
use foundry_core::{Error, Result};
use foundry_runner::JobExecution;
use tracing::{debug, info};

fn transition(status: &mut NodeStatus, node: impl Into<String>, to: NodeStatus) -> Result<()> {
    if !status.can_transition_to(to) {
        return Err(Error::InvalidTransition {
            node: node.into(),
            from: *status,
            to,
        });
    }
    *status = to;
    Ok(())
}

/// Build the pending records of a new run.
pub fn instantiate(
    graph: &PipelineGraph,
    pipeline_name: &str,
    trigger: TriggerContext,
    snapshot: Snapshot,
) -> Run {
    let stages = graph
        .stages()
        .into_iter()
        .map(|stage| StageRecord {
            name: stage.name.clone(),
            display_name: stage.display_name.clone(),
            required: stage.required,
            status: NodeStatus::Pending,
            skip_reason: None,
            jobs: graph
                .jobs(&stage.name)
                .into_iter()
                .map(|job| JobRecord {
                    name: job.key.job.clone(),
                    stage: job.key.stage.clone(),
                    display_name: job.display_name.clone(),
                    pool: job.pool.clone(),
                    environment: job.selector.to_string(),
                    status: NodeStatus::Pending,
                    skip_reason: None,
                    error: None,
                    attempts: 0,
                    steps: job.spec.pending_steps(),
                    started_at: None,
                    completed_at: None,
                })
                .collect(),
            started_at: None,
            completed_at: None,
        })
        .collect();

    Run {
        id: RunId::new(),
        pipeline_name: pipeline_name.to_string(),
        source: None,
        status: RunStatus::Pending,
        trigger,
        snapshot,
        stages,
        created_at: Utc::now(),
        started_at: None,
        completed_at: None,
        canceled_at: None,
        duration_ms: None,
    }
}

/// Owns a run record and applies validated transitions to it.
pub struct RunStateTracker {
    run: Run,
}

impl RunStateTracker {
    pub fn new(run: Run) -> Self {
        Self { run }
    }

    pub fn run(&self) -> &Run {
        &self.run
    }

    pub fn into_run(self) -> Run {
        self.run
    }

    pub fn is_canceled(&self) -> bool {
        self.run.canceled_at.is_some()
    }

    pub fn stage_status(&self, name: &str) -> Option<(NodeStatus, Option<SkipReason>)> {
        self.run.stage(name).map(|s| (s.status, s.skip_reason))
    }

    pub fn job_status(&self, key: &JobKey) -> Option<(NodeStatus, Option<SkipReason>)> {
        self.run.job(key).map(|j| (j.status, j.skip_reason))
    }

    fn stage_mut(&mut self, name: &str) -> Result<&mut StageRecord> {
        self.run
            .stage_mut(name)
            .ok_or_else(|| Error::Internal(format!("unknown stage '{}'", name)))
    }

    fn job_mut(&mut self, key: &JobKey) -> Result<&mut JobRecord> {
        self.run
            .job_mut(key)
            .ok_or_else(|| Error::Internal(format!("unknown job '{}'", key)))
    }

    pub fn start(&mut self) {
        self.run.status = RunStatus::Running;
        if self.run.started_at.is_none() {
            self.run.started_at = Some(Utc::now());
        }
        info!(run_id = %self.run.id, pipeline = %self.run.pipeline_name, "Run started");
    }

    pub fn start_stage(&mut self, name: &str) -> Result<()> {
        let stage = self.stage_mut(name)?;
        transition(&mut stage.status, format!("stage '{}'", name), NodeStatus::Running)?;
        stage.started_at = Some(Utc::now());
        Ok(())
    }

    pub fn complete_stage(&mut self, name: &str, status: NodeStatus) -> Result<()> {
        let stage = self.stage_mut(name)?;
        transition(&mut stage.status, format!("stage '{}'", name), status)?;
        stage.completed_at = Some(Utc::now());
        debug!(stage = %name, status = %status, "Stage completed");
        Ok(())
    }

    /// Skip a pending stage and every pending job in it.
    pub fn skip_stage(&mut self, name: &str, reason: SkipReason) -> Result<()> {
        let stage = self.stage_mut(name)?;
        transition(&mut stage.status, format!("stage '{}'", name), NodeStatus::Skipped)?;
        stage.skip_reason = Some(reason);
        stage.completed_at = Some(Utc::now());
        for job in stage.jobs.iter_mut().filter(|j| j.status == NodeStatus::Pending) {
            skip_job_record(job, reason);
        }
        debug!(stage = %name, reason = %reason, "Stage skipped");
        Ok(())
    }

    /// Dispatch: the only `pending -> running` transition for jobs.
    pub fn start_job(&mut self, key: &JobKey) -> Result<()> {
        let job = self.job_mut(key)?;
        transition(&mut job.status, format!("job '{}'", key), NodeStatus::Running)?;
        job.started_at = Some(Utc::now());
        Ok(())
    }

    pub fn record_environment(&mut self, key: &JobKey, description: &str, attempts: u32) -> Result<()> {
        let job = self.job_mut(key)?;
        job.environment = description.to_string();
        job.attempts = attempts;
        Ok(())
    }

    pub fn complete_job(&mut self, key: &JobKey, execution: JobExecution) -> Result<()> {
        let job = self.job_mut(key)?;
        transition(&mut job.status, format!("job '{}'", key), execution.status)?;
        job.error = execution.error;
        job.steps = execution.steps;
        job.completed_at = Some(Utc::now());
        Ok(())
    }

    /// Fail a dispatched job before any step ran.
    pub fn fail_job(&mut self, key: &JobKey, error: &Error, attempts: u32) -> Result<()> {
        let job = self.job_mut(key)?;
        let to = if matches!(error, Error::Canceled { .. }) {
            NodeStatus::Canceled
        } else {
            NodeStatus::Failed
        };
        transition(&mut job.status, format!("job '{}'", key), to)?;
        job.error = Some(error.to_string());
        job.attempts = attempts;
        job.completed_at = Some(Utc::now());
        for step in &mut job.steps {
            if step.status == NodeStatus::Pending {
                step.status = NodeStatus::Skipped;
            }
        }
        Ok(())
    }

    /// Mark a running job canceled without a result from its task.
    pub fn abort_job(&mut self, key: &JobKey, reason: &str) -> Result<()> {
        let job = self.job_mut(key)?;
        transition(&mut job.status, format!("job '{}'", key), NodeStatus::Canceled)?;
        job.error = Some(
            Error::Canceled {
                reason: reason.to_string(),
            }
            .to_string(),
        );
        job.completed_at = Some(Utc::now());
        for step in &mut job.steps {
            step.status = match step.status {
                NodeStatus::Pending => NodeStatus::Skipped,
                NodeStatus::Running => NodeStatus::Canceled,
                other => other,
            };
        }
        Ok(())
    }

    pub fn skip_job(&mut self, key: &JobKey, reason: SkipReason) -> Result<()> {
        let job = self.job_mut(key)?;
        if job.status != NodeStatus::Pending {
            return Err(Error::InvalidTransition {
                node: format!("job '{}'", key),
                from: job.status,
                to: NodeStatus::Skipped,
            });
        }
        skip_job_record(job, reason);
        debug!(job = %key, reason = %reason, "Job skipped");
        Ok(())
    }

    /// Cancel the run: pending nodes become skipped and no new work may
    /// start. Running jobs are left to observe the cancellation token.
    pub fn cancel(&mut self) -> Vec<JobKey> {
        if self.is_canceled() {
            return Vec::new();
        }
        self.run.canceled_at = Some(Utc::now());
        let mut skipped = Vec::new();
        for stage in &mut self.run.stages {
            for job in stage.jobs.iter_mut().filter(|j| j.status == NodeStatus::Pending) {
                skip_job_record(job, SkipReason::Canceled);
                skipped.push(job.key());
            }
            if stage.status == NodeStatus::Pending {
                stage.status = NodeStatus::Skipped;
                stage.skip_reason = Some(SkipReason::Canceled);
                stage.completed_at = Some(Utc::now());
            }
        }
        info!(run_id = %self.run.id, skipped = skipped.len(), "Run canceled");
        skipped
    }

    /// Prepare a persisted run for resumption: jobs that were running when
    /// the previous process stopped are marked canceled.
    pub fn interrupt(&mut self) -> Vec<JobKey> {
        let mut interrupted = Vec::new();
        for stage in &mut self.run.stages {
            for job in stage.jobs.iter_mut().filter(|j| j.status == NodeStatus::Running) {
                job.status = NodeStatus::Canceled;
                job.error = Some(
                    Error::Canceled {
                        reason: "interrupted".to_string(),
                    }
                    .to_string(),
                );
                job.completed_at = Some(Utc::now());
                for step in &mut job.steps {
                    step.status = match step.status {
                        NodeStatus::Pending => NodeStatus::Skipped,
                        NodeStatus::Running => NodeStatus::Canceled,
                        other => other,
                    };
                }
                interrupted.push(job.key());
            }
        }
        self.run.completed_at = None;
        self.run.duration_ms = None;
        interrupted
    }

    /// Outcome implied by the current node states.
    pub fn outcome(&self) -> RunStatus {
        if self.is_canceled() {
            return RunStatus::Canceled;
        }
        let failed = self.run.stages.iter().filter(|s| s.required).any(|stage| {
            stage.status.is_failure()
                || stage.status == NodeStatus::Canceled
                || matches!(stage.skip_reason, Some(reason) if !reason.is_permissible())
        });
        if failed {
            RunStatus::Failed
        } else {
            RunStatus::Succeeded
        }
    }

    /// Record the final outcome.
    pub fn finish(&mut self) -> RunStatus {
        let status = self.outcome();
        let now = Utc::now();
        self.run.status = status;
        self.run.completed_at = Some(now);
        self.run.duration_ms = self
            .run
            .started_at
            .map(|started| (now - started).num_milliseconds().max(0) as u64);
        info!(run_id = %self.run.id, status = %status, "Run finished");
        status
    }
}

fn skip_job_record(job: &mut JobRecord, reason: SkipReason) {
    job.status = NodeStatus::Skipped;
    job.skip_reason = Some(reason);
    job.completed_at = Some(Utc::now());
    for step in &mut job.steps {
        if step.status == NodeStatus::Pending {
            step.status = NodeStatus::Skipped;
        }
    }
}
