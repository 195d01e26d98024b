//! Test doubles and helpers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use foundry_core::events::Event;
use foundry_core::ids::{EnvironmentId, JobKey};
use foundry_core::pipeline::EnvironmentSelector;
use foundry_core::ports::{EventSink, RunRepository};
use foundry_core::run::Run;
use foundry_core::snapshot::{BuildReason, TriggerContext};
use foundry_core::{Error, Result};
use foundry_runner::{
    Environment, EnvironmentProvider, EnvironmentRequest, OutputLine, StepContext, StepResult,
    StepRunner,
};
use foundry_scheduler::{
    MemoryRunStore, Orchestrator, OrchestratorSettings, PipelineLoader, RetryPolicy, RunRequest,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Interprets step commands line by line instead of spawning a shell.
///
/// - `echo <text>` writes `<text>` to stdout
/// - `warn <text>` writes `<text>` to stderr
/// - `sleep <ms>` waits
/// - `fail <code>` exits with `<code>`
/// - `hang` never returns
/// - anything else succeeds silently
#[derive(Debug, Default)]
pub struct ScriptedRunner;

#[async_trait]
impl StepRunner for ScriptedRunner {
    async fn execute(
        &self,
        ctx: &StepContext,
        output_tx: mpsc::Sender<OutputLine>,
    ) -> Result<StepResult> {
        let started = tokio::time::Instant::now();
        for line in ctx.command.lines().map(str::trim) {
            let (verb, rest) = line.split_once(' ').unwrap_or((line, ""));
            match verb {
                "echo" => {
                    let _ = output_tx.send(OutputLine::stdout(rest)).await;
                }
                "warn" => {
                    let _ = output_tx.send(OutputLine::stderr(rest)).await;
                }
                "sleep" => {
                    let ms = rest.trim().parse().unwrap_or(0);
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                }
                "fail" => {
                    return Ok(StepResult {
                        exit_code: rest.trim().parse().unwrap_or(1),
                        duration_ms: started.elapsed().as_millis() as u64,
                    });
                }
                "hang" => std::future::pending::<()>().await,
                _ => {}
            }
        }
        Ok(StepResult {
            exit_code: 0,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }
}

/// Environments currently held, per pool and in total.
#[derive(Debug, Default)]
struct Occupancy {
    active: usize,
    peak: usize,
    by_pool: BTreeMap<String, (usize, usize)>,
}

impl Occupancy {
    fn enter(&mut self, pool: &str) {
        self.active += 1;
        self.peak = self.peak.max(self.active);
        let (active, peak) = self.by_pool.entry(pool.to_string()).or_default();
        *active += 1;
        *peak = (*peak).max(*active);
    }

    fn leave(&mut self, pool: &str) {
        self.active = self.active.saturating_sub(1);
        if let Some((active, _)) = self.by_pool.get_mut(pool) {
            *active = active.saturating_sub(1);
        }
    }
}

#[derive(Debug, Default)]
struct ProviderState {
    occupancy: Mutex<Occupancy>,
    acquired: Mutex<Vec<JobKey>>,
    unavailable: Mutex<BTreeMap<JobKey, usize>>,
    rejected: Mutex<Vec<JobKey>>,
    calls: AtomicUsize,
    hang_cleanup: AtomicBool,
    stall_first_cleanup: AtomicBool,
}

/// Hands out scripted environments and records how they are used.
#[derive(Debug, Clone, Default)]
pub struct FakeEnvironmentProvider {
    state: Arc<ProviderState>,
}

impl FakeEnvironmentProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report the environment of `job` unavailable for its first `times`
    /// acquisitions.
    pub fn unavailable_for(self, job: JobKey, times: usize) -> Self {
        self.state
            .unavailable
            .lock()
            .unwrap()
            .insert(job, times);
        self
    }

    /// Fail every acquisition for `job` with a non-retryable error.
    pub fn reject(self, job: JobKey) -> Self {
        self.state.rejected.lock().unwrap().push(job);
        self
    }

    /// Make environment cleanup block forever.
    pub fn hang_on_cleanup(self) -> Self {
        self.state.hang_cleanup.store(true, Ordering::SeqCst);
        self
    }

    /// Make the first cleanup of every environment block forever; later
    /// cleanups of the same environment succeed.
    pub fn stall_first_cleanup(self) -> Self {
        self.state.stall_first_cleanup.store(true, Ordering::SeqCst);
        self
    }

    /// Jobs that obtained an environment, in order.
    pub fn acquired(&self) -> Vec<JobKey> {
        self.state.acquired.lock().unwrap().clone()
    }

    /// Total calls to `acquire`, including failed ones.
    pub fn calls(&self) -> usize {
        self.state.calls.load(Ordering::SeqCst)
    }

    /// Highest number of environments held at once in `pool`.
    pub fn peak(&self, pool: &str) -> usize {
        let occupancy = self.state.occupancy.lock().unwrap();
        occupancy.by_pool.get(pool).map(|(_, peak)| *peak).unwrap_or(0)
    }

    /// Highest number of environments held at once across all pools.
    pub fn peak_total(&self) -> usize {
        self.state.occupancy.lock().unwrap().peak
    }

    /// Environments acquired and not yet cleaned up.
    pub fn active(&self) -> usize {
        self.state.occupancy.lock().unwrap().active
    }
}

#[async_trait]
impl EnvironmentProvider for FakeEnvironmentProvider {
    async fn acquire(&self, request: &EnvironmentRequest) -> Result<Box<dyn Environment>> {
        self.state.calls.fetch_add(1, Ordering::SeqCst);

        if self.state.rejected.lock().unwrap().contains(&request.job) {
            return Err(Error::Internal(format!("no image for {}", request.selector)));
        }
        {
            let mut unavailable = self.state.unavailable.lock().unwrap();
            if let Some(remaining) = unavailable.get_mut(&request.job) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(Error::EnvironmentUnavailable {
                        selector: request.selector.to_string(),
                        message: "no capacity".to_string(),
                    });
                }
            }
        }

        let pool = match &request.selector {
            EnvironmentSelector::Pool(name) => name.clone(),
            other => other.to_string(),
        };
        self.state.occupancy.lock().unwrap().enter(&pool);
        self.state.acquired.lock().unwrap().push(request.job.clone());

        Ok(Box::new(FakeEnvironment {
            id: EnvironmentId::new(),
            pool,
            workspace: PathBuf::from("/fake/workspace"),
            cleanups: AtomicUsize::new(0),
            state: self.state.clone(),
        }))
    }
}

struct FakeEnvironment {
    id: EnvironmentId,
    pool: String,
    workspace: PathBuf,
    cleanups: AtomicUsize,
    state: Arc<ProviderState>,
}

#[async_trait]
impl Environment for FakeEnvironment {
    fn id(&self) -> EnvironmentId {
        self.id
    }

    fn description(&self) -> String {
        format!("fake:{}", self.pool)
    }

    fn working_dir(&self) -> &Path {
        &self.workspace
    }

    fn runner(&self) -> Arc<dyn StepRunner> {
        Arc::new(ScriptedRunner)
    }

    async fn cleanup(&self) -> Result<()> {
        let first = self.cleanups.fetch_add(1, Ordering::SeqCst) == 0;
        let stalled = first && self.state.stall_first_cleanup.load(Ordering::SeqCst);
        if stalled || self.state.hang_cleanup.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.state.occupancy.lock().unwrap().leave(&self.pool);
        Ok(())
    }
}

/// Collects every published event.
#[derive(Debug, Default)]
pub struct RecordingEventSink {
    events: Mutex<Vec<(DateTime<Utc>, Event)>>,
}

impl RecordingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|(_, event)| event.clone())
            .collect()
    }

    /// Event subjects in publication order.
    pub fn subjects(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|(_, event)| event.subject())
            .collect()
    }

    /// When the first event matching `predicate` was published.
    pub fn first(&self, predicate: impl Fn(&Event) -> bool) -> Option<DateTime<Utc>> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .find(|(_, event)| predicate(event))
            .map(|(at, _)| *at)
    }
}

#[async_trait]
impl EventSink for RecordingEventSink {
    async fn publish(&self, event: Event) -> Result<()> {
        self.events.lock().unwrap().push((Utc::now(), event));
        Ok(())
    }
}

/// Settings with short retry delays and grace period.
pub fn fast_settings() -> OrchestratorSettings {
    OrchestratorSettings {
        default_pool_concurrency: 2,
        retry: RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
        },
        grace_period: Duration::from_millis(200),
    }
}

/// A manual run of `main`.
pub fn manual_request() -> RunRequest {
    RunRequest::new(TriggerContext::new(BuildReason::Manual, "main"))
}

pub fn request(reason: BuildReason, branch: &str) -> RunRequest {
    RunRequest::new(TriggerContext::new(reason, branch))
}

/// Orchestrator wired to fakes.
pub struct TestHarness {
    pub provider: FakeEnvironmentProvider,
    pub events: Arc<RecordingEventSink>,
    pub store: Arc<MemoryRunStore>,
    pub orchestrator: Orchestrator,
}

impl TestHarness {
    pub fn new(provider: FakeEnvironmentProvider) -> Self {
        Self::with_settings(provider, fast_settings())
    }

    pub fn with_settings(provider: FakeEnvironmentProvider, settings: OrchestratorSettings) -> Self {
        let events = Arc::new(RecordingEventSink::new());
        let store = Arc::new(MemoryRunStore::new());
        let orchestrator = Orchestrator::new(
            Arc::new(provider.clone()),
            events.clone(),
            store.clone(),
        )
        .with_settings(settings);
        Self {
            provider,
            events,
            store,
            orchestrator,
        }
    }

    /// Load `yaml` and run it to completion with a manual trigger.
    pub async fn run(&self, yaml: &str) -> anyhow::Result<Run> {
        self.run_with(yaml, manual_request(), CancellationToken::new())
            .await
    }

    pub async fn run_with(
        &self,
        yaml: &str,
        request: RunRequest,
        cancel: CancellationToken,
    ) -> anyhow::Result<Run> {
        let pipeline = PipelineLoader::new().load_str(yaml)?;
        Ok(self.orchestrator.run(&pipeline, request, cancel).await?)
    }

    /// The stored copy of a run.
    pub async fn stored(&self, run: &Run) -> anyhow::Result<Run> {
        self.store
            .get(run.id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("run {} was not persisted", run.id))
    }
}
