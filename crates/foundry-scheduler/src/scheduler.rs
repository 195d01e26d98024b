//! Dependency-driven readiness for stages and jobs.

use crate::dag::PipelineGraph;
use crate::state::RunStateTracker;
use foundry_core::expr::Condition;
use foundry_core::ids::JobKey;
use foundry_core::pipeline::DependencyPolicy;
use foundry_core::run::{NodeStatus, SkipReason};
use foundry_core::snapshot::Snapshot;
use foundry_core::{Error, Result};
use foundry_runner::JobExecution;
use std::collections::HashSet;
use tracing::debug;

/// What a node's dependencies allow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Some dependency is not terminal yet.
    Waiting,
    Ready,
    /// The policy can no longer be satisfied.
    Blocked(SkipReason),
}

/// Evaluate a dependency policy over terminal dependency states.
pub fn readiness(
    policy: DependencyPolicy,
    dependencies: &[(NodeStatus, Option<SkipReason>)],
) -> Readiness {
    if dependencies.iter().any(|(status, _)| !status.is_terminal()) {
        return Readiness::Waiting;
    }
    // A failure anywhere outranks a cancellation.
    let blocked = if dependencies.iter().any(|(status, _)| status.is_failure()) {
        Some(SkipReason::DependencyFailed)
    } else if dependencies
        .iter()
        .any(|(status, _)| *status == NodeStatus::Canceled)
    {
        Some(SkipReason::Canceled)
    } else {
        None
    };

    match policy {
        DependencyPolicy::Completed => Readiness::Ready,
        DependencyPolicy::SucceededOrSkipped => match blocked {
            Some(reason) => Readiness::Blocked(reason),
            None => Readiness::Ready,
        },
        DependencyPolicy::Succeeded => {
            if let Some(reason) = blocked {
                return Readiness::Blocked(reason);
            }
            let skipped: Vec<SkipReason> = dependencies
                .iter()
                .filter(|(status, _)| *status == NodeStatus::Skipped)
                .map(|(_, reason)| reason.unwrap_or(SkipReason::DependencySkipped))
                .collect();
            if skipped.is_empty() {
                Readiness::Ready
            } else if skipped.contains(&SkipReason::DependencyFailed) {
                Readiness::Blocked(SkipReason::DependencyFailed)
            } else if skipped.contains(&SkipReason::Canceled) {
                Readiness::Blocked(SkipReason::Canceled)
            } else {
                Readiness::Blocked(SkipReason::DependencySkipped)
            }
        }
    }
}

/// Terminal status of a stage from its jobs: failed if any job failed or
/// timed out, canceled if any was canceled, otherwise succeeded.
pub fn stage_outcome(jobs: &[(NodeStatus, Option<SkipReason>)]) -> NodeStatus {
    if jobs.iter().any(|(status, _)| status.is_failure()) {
        NodeStatus::Failed
    } else if jobs.iter().any(|(status, reason)| {
        *status == NodeStatus::Canceled || *reason == Some(SkipReason::Canceled)
    }) {
        NodeStatus::Canceled
    } else {
        NodeStatus::Succeeded
    }
}

fn condition_holds(condition: Option<&Condition>, snapshot: &Snapshot, node: &str) -> Result<bool> {
    match condition {
        None => Ok(true),
        Some(condition) => condition
            .evaluate(snapshot)
            .map_err(|e| Error::configuration(format!("condition of {}: {}", node, e))),
    }
}

/// Advances a run through the graph.
///
/// Each call applies every skip and stage transition that the current
/// state allows, until nothing changes, and returns the jobs that became
/// ready for dispatch. A job is returned at most once.
pub struct DependencyScheduler<'g> {
    graph: &'g PipelineGraph,
    dispatched: HashSet<JobKey>,
}

impl<'g> DependencyScheduler<'g> {
    pub fn new(graph: &'g PipelineGraph) -> Self {
        Self {
            graph,
            dispatched: HashSet::new(),
        }
    }

    pub fn advance(
        &mut self,
        tracker: &mut RunStateTracker,
        snapshot: &Snapshot,
    ) -> Result<Vec<JobKey>> {
        let graph = self.graph;
        let mut ready = Vec::new();

        loop {
            let mut changed = false;

            for stage in graph.stages() {
                let Some((status, _)) = tracker.stage_status(&stage.name) else {
                    continue;
                };

                match status {
                    NodeStatus::Pending => {
                        let deps: Vec<_> = stage
                            .depends_on
                            .iter()
                            .filter_map(|dep| tracker.stage_status(dep))
                            .collect();
                        match readiness(stage.policy, &deps) {
                            Readiness::Waiting => {}
                            Readiness::Blocked(reason) => {
                                tracker.skip_stage(&stage.name, reason)?;
                                changed = true;
                            }
                            Readiness::Ready => {
                                let location = format!("stage '{}'", stage.name);
                                if condition_holds(stage.condition.as_ref(), snapshot, &location)? {
                                    tracker.start_stage(&stage.name)?;
                                } else {
                                    tracker.skip_stage(&stage.name, SkipReason::ConditionFalse)?;
                                }
                                changed = true;
                            }
                        }
                    }
                    NodeStatus::Running => {
                        let jobs = graph.jobs(&stage.name);
                        for job in &jobs {
                            if self.dispatched.contains(&job.key) {
                                continue;
                            }
                            let Some((job_status, _)) = tracker.job_status(&job.key) else {
                                continue;
                            };
                            if job_status != NodeStatus::Pending {
                                continue;
                            }
                            let deps: Vec<_> = job
                                .depends_on
                                .iter()
                                .filter_map(|dep| {
                                    tracker.job_status(&JobKey::new(&stage.name, dep))
                                })
                                .collect();
                            match readiness(job.policy, &deps) {
                                Readiness::Waiting => {}
                                Readiness::Blocked(reason) => {
                                    tracker.skip_job(&job.key, reason)?;
                                    changed = true;
                                }
                                Readiness::Ready => {
                                    let location = format!("job '{}'", job.key);
                                    if condition_holds(job.condition.as_ref(), snapshot, &location)? {
                                        debug!(job = %job.key, "Job ready");
                                        self.dispatched.insert(job.key.clone());
                                        ready.push(job.key.clone());
                                    } else {
                                        tracker.skip_job(&job.key, SkipReason::ConditionFalse)?;
                                    }
                                    changed = true;
                                }
                            }
                        }

                        let statuses: Vec<_> = jobs
                            .iter()
                            .filter_map(|job| tracker.job_status(&job.key))
                            .collect();
                        if statuses.iter().all(|(status, _)| status.is_terminal()) {
                            tracker.complete_stage(&stage.name, stage_outcome(&statuses))?;
                            changed = true;
                        }
                    }
                    _ => {}
                }
            }

            if !changed {
                break;
            }
        }

        Ok(ready)
    }
}

/// Predicted state of every node if all dispatched jobs succeed.
///
/// Used to show which parts of the graph a given snapshot activates.
pub fn preview(graph: &PipelineGraph, tracker: &mut RunStateTracker, snapshot: &Snapshot) -> Result<()> {
    let mut scheduler = DependencyScheduler::new(graph);
    loop {
        let ready = scheduler.advance(tracker, snapshot)?;
        if ready.is_empty() {
            return Ok(());
        }
        for key in ready {
            tracker.start_job(&key)?;
            let steps = tracker
                .run()
                .job(&key)
                .map(|job| {
                    job.steps
                        .iter()
                        .cloned()
                        .map(|mut step| {
                            step.status = NodeStatus::Succeeded;
                            step
                        })
                        .collect()
                })
                .unwrap_or_default();
            tracker.complete_job(
                &key,
                JobExecution {
                    status: NodeStatus::Succeeded,
                    error: None,
                    steps,
                },
            )?;
        }
    }
}
