//! Run orchestration.
//!
//! One control loop per run owns the scheduler, the pool dispatcher and the
//! run state. Job tasks run on a [`JoinSet`] and report back to the loop,
//! so every state mutation happens in one place.

use crate::dag::PipelineGraph;
use crate::loader::LoadedPipeline;
use crate::pool::{PoolDispatcher, RetryPolicy, acquire_environment};
use crate::scheduler::DependencyScheduler;
use crate::state::{RunStateTracker, instantiate};
use crate::triggers;
use chrono::Utc;
use foundry_core::events::*;
use foundry_core::ids::{JobKey, RunId};
use foundry_core::pipeline::EnvironmentSelector;
use foundry_core::ports::{EventSink, RunRepository};
use foundry_core::run::{NodeStatus, Run, SkipReason};
use foundry_core::snapshot::{Snapshot, TriggerContext};
use foundry_core::{Error, Result};
use foundry_runner::{
    Environment, EnvironmentProvider, EnvironmentRequest, JobExecution, JobExecutor, JobSpec,
};
use futures::FutureExt;
use futures::future::join_all;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Tunables shared by every run.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Concurrency of the `default` pool when a pipeline does not declare it.
    pub default_pool_concurrency: u32,
    pub retry: RetryPolicy,
    /// How long running work may take to stop after cancellation.
    pub grace_period: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            default_pool_concurrency: 2,
            retry: RetryPolicy::default(),
            grace_period: Duration::from_secs(10),
        }
    }
}

/// Inputs for a new run.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub trigger: TriggerContext,
    pub parameters: BTreeMap<String, serde_json::Value>,
    /// Where the definition was loaded from, kept for `resume`.
    pub source: Option<String>,
}

impl RunRequest {
    pub fn new(trigger: TriggerContext) -> Self {
        Self {
            trigger,
            parameters: BTreeMap::new(),
            source: None,
        }
    }

    pub fn parameter(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.parameters.insert(name.into(), value);
        self
    }
}

/// Result reported by a job task.
struct JobOutcome {
    key: JobKey,
    pool: String,
    attempts: u32,
    environment: Option<String>,
    result: Result<JobExecution>,
    duration_ms: u64,
}

/// Environments held by job tasks that have not finished cleaning up.
type HeldEnvironments = Arc<Mutex<BTreeMap<JobKey, Arc<dyn Environment>>>>;

/// Everything a job task needs, owned so it can move onto the runtime.
struct JobTask {
    run_id: RunId,
    key: JobKey,
    pool: String,
    selector: EnvironmentSelector,
    spec: JobSpec,
    snapshot: Arc<Snapshot>,
    provider: Arc<dyn EnvironmentProvider>,
    executor: Arc<JobExecutor>,
    events: Arc<dyn EventSink>,
    retry: RetryPolicy,
    held: HeldEnvironments,
    cancel: CancellationToken,
}

impl JobTask {
    async fn run(self) -> JobOutcome {
        let started = Instant::now();
        let request = EnvironmentRequest {
            run_id: self.run_id,
            job: self.key.clone(),
            selector: self.selector.clone(),
        };
        let (acquired, attempts) =
            acquire_environment(self.provider.as_ref(), &request, &self.retry, &self.cancel).await;

        let environment: Arc<dyn Environment> = match acquired {
            Ok(environment) => Arc::from(environment),
            Err(e) => {
                warn!(job = %self.key, attempts, error = %e, "Environment acquisition failed");
                return JobOutcome {
                    key: self.key,
                    pool: self.pool,
                    attempts,
                    environment: None,
                    result: Err(e),
                    duration_ms: started.elapsed().as_millis() as u64,
                };
            }
        };

        self.held
            .lock()
            .await
            .insert(self.key.clone(), environment.clone());

        let description = environment.description();
        let started_event = Event::JobStarted(JobStartedPayload {
            run_id: self.run_id,
            job: self.key.clone(),
            pool: self.pool.clone(),
            environment: description.clone(),
            started_at: Utc::now(),
        });
        if let Err(e) = self.events.publish(started_event).await {
            warn!(error = %e, "Failed to publish event");
        }

        let execution = self
            .executor
            .execute(
                self.run_id,
                &self.spec,
                &self.snapshot,
                environment.as_ref(),
                &self.cancel,
            )
            .await;

        if let Err(e) = environment.cleanup().await {
            warn!(job = %self.key, error = %e, "Environment cleanup failed");
        }
        self.held.lock().await.remove(&self.key);

        JobOutcome {
            key: self.key,
            pool: self.pool,
            attempts,
            environment: Some(description),
            result: Ok(execution),
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }
}

type NodeStates = BTreeMap<String, (NodeStatus, Option<SkipReason>)>;

fn stage_states(run: &Run) -> NodeStates {
    run.stages
        .iter()
        .map(|s| (s.name.clone(), (s.status, s.skip_reason)))
        .collect()
}

fn job_states(run: &Run) -> NodeStates {
    run.jobs()
        .map(|j| (j.key().to_string(), (j.status, j.skip_reason)))
        .collect()
}

/// The per-run control loop.
struct RunLoop<'a> {
    orchestrator: &'a Orchestrator,
    graph: &'a PipelineGraph,
    run_id: RunId,
    tracker: RunStateTracker,
    scheduler: DependencyScheduler<'a>,
    pools: PoolDispatcher,
    snapshot: Arc<Snapshot>,
    executor: Arc<JobExecutor>,
    tasks: JoinSet<JobOutcome>,
    held: HeldEnvironments,
    cancel: CancellationToken,
}

impl RunLoop<'_> {
    async fn publish(&self, event: Event) {
        if let Err(e) = self.orchestrator.events.publish(event).await {
            warn!(error = %e, "Failed to publish event");
        }
    }

    async fn save(&self) {
        if let Err(e) = self.orchestrator.store.save(self.tracker.run()).await {
            error!(run_id = %self.run_id, error = %e, "Failed to persist run");
        }
    }

    /// Publish stage and skip events for everything that changed since
    /// `stages` and `jobs` were captured.
    async fn publish_changes(&self, stages: NodeStates, jobs: NodeStates) {
        let run = self.tracker.run();
        let now = Utc::now();
        let mut events = Vec::new();

        for (name, (status, reason)) in stage_states(run) {
            let Some(&(before, _)) = stages.get(&name) else {
                continue;
            };
            if before == status {
                continue;
            }
            if status == NodeStatus::Skipped {
                events.push(Event::NodeSkipped(NodeSkippedPayload {
                    run_id: self.run_id,
                    node: name,
                    reason: reason.unwrap_or(SkipReason::DependencySkipped),
                    skipped_at: now,
                }));
                continue;
            }
            if before == NodeStatus::Pending {
                events.push(Event::StageStarted(StageStartedPayload {
                    run_id: self.run_id,
                    stage: name.clone(),
                    started_at: now,
                }));
            }
            if status.is_terminal() {
                events.push(Event::StageCompleted(StageCompletedPayload {
                    run_id: self.run_id,
                    stage: name,
                    status,
                    completed_at: now,
                }));
            }
        }

        for (node, (status, reason)) in job_states(run) {
            let before = jobs.get(&node).map(|(s, _)| *s);
            if status == NodeStatus::Skipped && before != Some(NodeStatus::Skipped) {
                events.push(Event::NodeSkipped(NodeSkippedPayload {
                    run_id: self.run_id,
                    node,
                    reason: reason.unwrap_or(SkipReason::DependencySkipped),
                    skipped_at: now,
                }));
            }
        }

        for event in events {
            self.publish(event).await;
        }
    }

    /// Advance readiness, queue newly ready jobs and start admitted ones.
    async fn schedule(&mut self) -> Result<()> {
        let graph = self.graph;
        let stages = stage_states(self.tracker.run());
        let jobs = job_states(self.tracker.run());
        let ready = self.scheduler.advance(&mut self.tracker, &self.snapshot)?;
        self.publish_changes(stages, jobs).await;

        if self.tracker.is_canceled() {
            return Ok(());
        }

        for key in ready {
            let Some(node) = graph.job(&key) else {
                continue;
            };
            self.pools.enqueue(&node.pool, key.clone());
            debug!(
                run_id = %self.run_id,
                job = %key,
                pool = %node.pool,
                queued = self.pools.queued(&node.pool),
                "Job queued"
            );
            self.publish(Event::JobQueued(JobQueuedPayload {
                run_id: self.run_id,
                job: key,
                pool: node.pool.clone(),
                queued_at: Utc::now(),
            }))
            .await;
        }

        for (pool, key) in self.pools.next_admissible() {
            let Some(node) = graph.job(&key) else {
                continue;
            };
            self.tracker.start_job(&key)?;
            info!(
                run_id = %self.run_id,
                job = %key,
                pool = %pool,
                running = self.pools.running(&pool),
                limit = self.pools.limit(&pool).unwrap_or(0),
                "Job dispatched"
            );

            let task = JobTask {
                run_id: self.run_id,
                key: key.clone(),
                pool: pool.clone(),
                selector: node.selector.clone(),
                spec: node.spec.clone(),
                snapshot: self.snapshot.clone(),
                provider: self.orchestrator.provider.clone(),
                executor: self.executor.clone(),
                events: self.orchestrator.events.clone(),
                retry: self.orchestrator.settings.retry,
                held: self.held.clone(),
                cancel: self.cancel.child_token(),
            };
            self.tasks.spawn(async move {
                match AssertUnwindSafe(task.run()).catch_unwind().await {
                    Ok(outcome) => outcome,
                    Err(_) => JobOutcome {
                        key,
                        pool,
                        attempts: 0,
                        environment: None,
                        result: Err(Error::Internal("job task panicked".to_string())),
                        duration_ms: 0,
                    },
                }
            });
        }
        Ok(())
    }

    async fn record(&mut self, outcome: JobOutcome) -> Result<()> {
        self.pools.release(&outcome.pool);
        let key = outcome.key;

        let (status, error) = match outcome.result {
            Ok(execution) => {
                if let Some(description) = &outcome.environment {
                    self.tracker
                        .record_environment(&key, description, outcome.attempts)?;
                }
                let summary = (execution.status, execution.error.clone());
                self.tracker.complete_job(&key, execution)?;
                summary
            }
            Err(e) => {
                self.tracker.fail_job(&key, &e, outcome.attempts)?;
                let status = self
                    .tracker
                    .job_status(&key)
                    .map(|(s, _)| s)
                    .unwrap_or(NodeStatus::Failed);
                (status, Some(e.to_string()))
            }
        };

        info!(run_id = %self.run_id, job = %key, status = %status, "Job completed");
        self.publish(Event::JobCompleted(JobCompletedPayload {
            run_id: self.run_id,
            job: key,
            status,
            error,
            duration_ms: outcome.duration_ms,
            completed_at: Utc::now(),
        }))
        .await;
        Ok(())
    }

    async fn on_cancel(&mut self) {
        let stages = stage_states(self.tracker.run());
        let jobs = job_states(self.tracker.run());
        self.tracker.cancel();
        let dropped = self.pools.drain_queued();
        debug!(run_id = %self.run_id, dropped = dropped.len(), "Dropped queued jobs");
        self.publish_changes(stages, jobs).await;
        self.publish(Event::RunCanceled(RunCanceledPayload {
            run_id: self.run_id,
            reason: "cancellation requested".to_string(),
            canceled_at: Utc::now(),
        }))
        .await;
    }

    /// Abort work that outlived the grace period.
    async fn abort_remaining(&mut self) -> Result<()> {
        warn!(run_id = %self.run_id, tasks = self.tasks.len(), "Grace period expired, aborting jobs");
        self.tasks.abort_all();
        while let Some(joined) = self.tasks.join_next().await {
            if let Ok(outcome) = joined {
                self.record(outcome).await?;
            }
        }

        self.release_held_environments().await;

        let running: Vec<(JobKey, String)> = self
            .tracker
            .run()
            .jobs()
            .filter(|j| j.status == NodeStatus::Running)
            .map(|j| (j.key(), j.pool.clone()))
            .collect();
        for (key, pool) in running {
            self.pools.release(&pool);
            self.tracker.abort_job(&key, "grace period expired")?;
            self.publish(Event::JobCompleted(JobCompletedPayload {
                run_id: self.run_id,
                job: key,
                status: NodeStatus::Canceled,
                error: Some("aborted after grace period".to_string()),
                duration_ms: 0,
                completed_at: Utc::now(),
            }))
            .await;
        }
        Ok(())
    }

    /// Clean up environments whose job task was aborted before its own
    /// cleanup finished. Each cleanup gets one more grace period.
    async fn release_held_environments(&self) {
        let held = std::mem::take(&mut *self.held.lock().await);
        let grace = self.orchestrator.settings.grace_period;
        let cleanups = held.into_iter().map(|(key, environment)| async move {
            match tokio::time::timeout(grace, environment.cleanup()).await {
                Ok(Ok(())) => info!(job = %key, "Released environment of aborted job"),
                Ok(Err(e)) => warn!(job = %key, error = %e, "Environment cleanup failed"),
                Err(_) => {
                    warn!(job = %key, environment = %environment.description(), "Environment cleanup timed out")
                }
            }
        });
        join_all(cleanups).await;
    }

    async fn drive(mut self) -> Result<Run> {
        let grace = self.orchestrator.settings.grace_period;
        let mut grace_deadline: Option<Instant> = None;

        loop {
            if grace_deadline.is_none() && self.cancel.is_cancelled() && !self.tracker.is_canceled() {
                self.on_cancel().await;
                grace_deadline = Some(Instant::now() + grace);
            }

            self.schedule().await?;
            self.save().await;

            if self.tasks.is_empty() {
                break;
            }

            let deadline = grace_deadline.unwrap_or_else(Instant::now);
            tokio::select! {
                biased;

                _ = self.cancel.cancelled(), if grace_deadline.is_none() => {
                    self.on_cancel().await;
                    grace_deadline = Some(Instant::now() + grace);
                }
                _ = tokio::time::sleep_until(deadline), if grace_deadline.is_some() => {
                    self.abort_remaining().await?;
                }
                Some(joined) = self.tasks.join_next() => {
                    match joined {
                        Ok(outcome) => self.record(outcome).await?,
                        Err(e) => warn!(run_id = %self.run_id, error = %e, "Job task ended abnormally"),
                    }
                }
            }
        }

        for pool in self.graph.pools().keys() {
            debug!(run_id = %self.run_id, pool = %pool, peak = self.pools.peak(pool), "Pool usage");
        }
        let status = self.tracker.finish();
        let run = self.tracker.run();
        self.publish(Event::RunCompleted(RunCompletedPayload {
            run_id: self.run_id,
            status,
            duration_ms: run.duration_ms.unwrap_or(0),
            completed_at: run.completed_at.unwrap_or_else(Utc::now),
        }))
        .await;
        self.orchestrator.store.save(self.tracker.run()).await?;
        Ok(self.tracker.into_run())
    }
}

/// Executes runs of loaded pipelines.
pub struct Orchestrator {
    provider: Arc<dyn EnvironmentProvider>,
    events: Arc<dyn EventSink>,
    store: Arc<dyn RunRepository>,
    settings: OrchestratorSettings,
}

impl Orchestrator {
    pub fn new(
        provider: Arc<dyn EnvironmentProvider>,
        events: Arc<dyn EventSink>,
        store: Arc<dyn RunRepository>,
    ) -> Self {
        Self {
            provider,
            events,
            store,
            settings: OrchestratorSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: OrchestratorSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    /// Check the request against the pipeline triggers, resolve the snapshot
    /// and instantiate every node as pending.
    pub fn prepare(&self, pipeline: &LoadedPipeline, mut request: RunRequest) -> Result<Run> {
        triggers::admit(&pipeline.definition, &mut request)?;
        let snapshot = pipeline
            .resolver
            .resolve(&request.parameters, &request.trigger)?;
        let mut run = instantiate(&pipeline.graph, pipeline.name(), request.trigger, snapshot);
        run.source = request.source;
        Ok(run)
    }

    /// Create and execute a run to completion.
    pub async fn run(
        &self,
        pipeline: &LoadedPipeline,
        request: RunRequest,
        cancel: CancellationToken,
    ) -> Result<Run> {
        let run = self.prepare(pipeline, request)?;
        self.execute(pipeline, run, cancel).await
    }

    /// Drive a prepared (or interrupted) run until every node is terminal.
    pub async fn execute(
        &self,
        pipeline: &LoadedPipeline,
        run: Run,
        cancel: CancellationToken,
    ) -> Result<Run> {
        let run_id = run.id;
        let snapshot = Arc::new(run.snapshot.clone());
        let mut tracker = RunStateTracker::new(run);
        tracker.start();

        let trigger = tracker.run().trigger.clone();
        let executor = Arc::new(JobExecutor::new(self.events.clone()));
        let run_loop = RunLoop {
            orchestrator: self,
            graph: &pipeline.graph,
            run_id,
            tracker,
            scheduler: DependencyScheduler::new(&pipeline.graph),
            pools: PoolDispatcher::new(
                pipeline.graph.pools(),
                self.settings.default_pool_concurrency,
            ),
            snapshot,
            executor,
            tasks: JoinSet::new(),
            held: HeldEnvironments::default(),
            cancel,
        };

        run_loop
            .publish(Event::RunStarted(RunStartedPayload {
                run_id,
                pipeline_name: pipeline.name().to_string(),
                branch: trigger.branch_name().to_string(),
                reason: trigger.reason.to_string(),
                started_at: Utc::now(),
            }))
            .await;

        run_loop.drive().await
    }

    /// Continue a persisted run. Jobs that were running when it stopped are
    /// marked canceled; pending work is scheduled again.
    pub async fn resume(
        &self,
        pipeline: &LoadedPipeline,
        run_id: RunId,
        cancel: CancellationToken,
    ) -> Result<Run> {
        let run = self
            .store
            .get(run_id)
            .await?
            .ok_or_else(|| Error::RunNotFound(run_id.to_string()))?;
        if run.status.is_terminal() {
            return Err(Error::configuration(format!(
                "run {} already finished as {}",
                run_id, run.status
            )));
        }
        if run.pipeline_name != pipeline.name() {
            return Err(Error::configuration(format!(
                "run {} belongs to pipeline '{}', not '{}'",
                run_id,
                run.pipeline_name,
                pipeline.name()
            )));
        }

        let mut tracker = RunStateTracker::new(run);
        let interrupted = tracker.interrupt();
        info!(run_id = %run_id, interrupted = interrupted.len(), "Resuming run");
        self.execute(pipeline, tracker.into_run(), cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::PipelineLoader;
    use crate::store::MemoryRunStore;
    use foundry_core::ports::NullEventSink;
    use foundry_core::run::RunStatus;
    use foundry_core::snapshot::BuildReason;
    use foundry_runner::{LocalEnvironmentProvider, LocalEnvironmentSettings};
    use pretty_assertions::assert_eq;

    const PIPELINE: &str = r#"
name: smoke
parameters:
  - name: publish
    type: boolean
    default: false
stages:
  - name: Compile
    jobs:
      - name: compile
        steps:
          - name: build
            run: echo "building $BUILD_SOURCEBRANCHNAME"
  - name: Publish
    depends_on: [Compile]
    condition: eq(parameters.publish, true)
    jobs:
      - name: publish
        steps:
          - name: upload
            run: echo uploading
"#;

    fn orchestrator(workspace: &std::path::Path, store: Arc<MemoryRunStore>) -> Orchestrator {
        let provider = LocalEnvironmentProvider::new(LocalEnvironmentSettings {
            workspace: workspace.to_path_buf(),
            vm_images: BTreeMap::new(),
            docker_enabled: false,
        });
        Orchestrator::new(Arc::new(provider), Arc::new(NullEventSink), store)
    }

    #[tokio::test]
    async fn test_run_on_host() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryRunStore::new());
        let pipeline = PipelineLoader::new().load_str(PIPELINE).unwrap();
        let orchestrator = orchestrator(dir.path(), store.clone());

        let run = orchestrator
            .run(
                &pipeline,
                RunRequest::new(TriggerContext::new(BuildReason::Manual, "main")),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Succeeded);
        assert!(run.is_settled());
        let compile = run.job(&JobKey::new("Compile", "compile")).unwrap();
        assert_eq!(compile.steps[0].log[0].content, "building main");
        assert_eq!(
            run.stage("Publish").unwrap().skip_reason,
            Some(SkipReason::ConditionFalse)
        );

        let stored = store.get(run.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_undeclared_parameter_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = PipelineLoader::new().load_str(PIPELINE).unwrap();
        let orchestrator = orchestrator(dir.path(), Arc::new(MemoryRunStore::new()));

        let request = RunRequest::new(TriggerContext::new(BuildReason::Manual, "main"))
            .parameter("sign", serde_json::json!(true));
        let err = orchestrator.prepare(&pipeline, request).unwrap_err();
        assert!(err.is_configuration());
    }

    #[tokio::test]
    async fn test_resume_unknown_run() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = PipelineLoader::new().load_str(PIPELINE).unwrap();
        let orchestrator = orchestrator(dir.path(), Arc::new(MemoryRunStore::new()));
        let err = orchestrator
            .resume(&pipeline, RunId::new(), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RunNotFound(_)));
    }
}
