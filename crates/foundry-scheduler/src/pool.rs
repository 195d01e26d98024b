//! Worker pool admission and environment acquisition.

use foundry_core::ids::JobKey;
use foundry_core::pipeline::DEFAULT_POOL;
use foundry_core::{Error, Result};
use foundry_runner::{Environment, EnvironmentProvider, EnvironmentRequest};
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug)]
struct PoolState {
    limit: u32,
    running: u32,
    peak: u32,
    queue: VecDeque<JobKey>,
}

impl PoolState {
    fn new(limit: u32) -> Self {
        Self {
            limit: limit.max(1),
            running: 0,
            peak: 0,
            queue: VecDeque::new(),
        }
    }
}

/// Bounded FIFO admission per pool.
///
/// A pool never has more than its limit of jobs admitted at once; jobs
/// beyond that wait in arrival order.
#[derive(Debug)]
pub struct PoolDispatcher {
    pools: BTreeMap<String, PoolState>,
}

impl PoolDispatcher {
    /// Create a dispatcher for the declared pools. The default pool takes
    /// `default_concurrency` unless it was declared.
    pub fn new(declared: &BTreeMap<String, u32>, default_concurrency: u32) -> Self {
        let mut pools: BTreeMap<String, PoolState> = declared
            .iter()
            .map(|(name, limit)| (name.clone(), PoolState::new(*limit)))
            .collect();
        pools
            .entry(DEFAULT_POOL.to_string())
            .or_insert_with(|| PoolState::new(default_concurrency));
        Self { pools }
    }

    pub fn enqueue(&mut self, pool: &str, key: JobKey) {
        let state = self
            .pools
            .entry(pool.to_string())
            .or_insert_with(|| PoolState::new(1));
        debug!(pool = %pool, job = %key, queued = state.queue.len() + 1, "Job queued");
        state.queue.push_back(key);
    }

    /// Admit queued jobs while their pools have free slots.
    pub fn next_admissible(&mut self) -> Vec<(String, JobKey)> {
        let mut admitted = Vec::new();
        for (name, state) in &mut self.pools {
            while state.running < state.limit {
                let Some(key) = state.queue.pop_front() else {
                    break;
                };
                state.running += 1;
                state.peak = state.peak.max(state.running);
                admitted.push((name.clone(), key));
            }
        }
        admitted
    }

    /// Free the slot held by a finished job.
    pub fn release(&mut self, pool: &str) {
        if let Some(state) = self.pools.get_mut(pool) {
            state.running = state.running.saturating_sub(1);
        }
    }

    /// Remove every queued job, e.g. on cancellation.
    pub fn drain_queued(&mut self) -> Vec<JobKey> {
        self.pools
            .values_mut()
            .flat_map(|state| state.queue.drain(..))
            .collect()
    }

    pub fn running(&self, pool: &str) -> u32 {
        self.pools.get(pool).map(|s| s.running).unwrap_or(0)
    }

    pub fn queued(&self, pool: &str) -> usize {
        self.pools.get(pool).map(|s| s.queue.len()).unwrap_or(0)
    }

    /// Highest number of jobs admitted at once.
    pub fn peak(&self, pool: &str) -> u32 {
        self.pools.get(pool).map(|s| s.peak).unwrap_or(0)
    }

    pub fn limit(&self, pool: &str) -> Option<u32> {
        self.pools.get(pool).map(|s| s.limit)
    }
}

/// Backoff for environment acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay after the given failed attempt (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Acquire an environment, retrying unavailability with backoff.
///
/// Returns the number of attempts made alongside the result. Errors other
/// than [`Error::EnvironmentUnavailable`] fail immediately.
pub async fn acquire_environment(
    provider: &dyn EnvironmentProvider,
    request: &EnvironmentRequest,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
) -> (Result<Box<dyn Environment>>, u32) {
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        if cancel.is_cancelled() {
            return (Err(canceled()), attempt - 1);
        }

        match provider.acquire(request).await {
            Ok(environment) => return (Ok(environment), attempt),
            Err(err @ Error::EnvironmentUnavailable { .. }) if attempt < max_attempts => {
                let delay = policy.delay(attempt);
                warn!(
                    job = %request.job,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Environment unavailable, retrying"
                );
                tokio::select! {
                    _ = cancel.cancelled() => return (Err(canceled()), attempt),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Err(err) => return (Err(err), attempt),
        }
    }
}

fn canceled() -> Error {
    Error::Canceled {
        reason: "run canceled before the environment was acquired".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use foundry_core::ids::RunId;
    use foundry_core::pipeline::EnvironmentSelector;
    use foundry_runner::HostEnvironment;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn key(job: &str) -> JobKey {
        JobKey::new("Build", job)
    }

    #[test]
    fn test_fifo_admission_respects_limit() {
        let declared = BTreeMap::from([("macos".to_string(), 1)]);
        let mut pools = PoolDispatcher::new(&declared, 2);

        pools.enqueue("macos", key("intel"));
        pools.enqueue("macos", key("arm64"));
        pools.enqueue("default", key("a"));
        pools.enqueue("default", key("b"));
        pools.enqueue("default", key("c"));

        let admitted = pools.next_admissible();
        assert_eq!(
            admitted,
            vec![
                ("default".to_string(), key("a")),
                ("default".to_string(), key("b")),
                ("macos".to_string(), key("intel")),
            ]
        );
        assert!(pools.next_admissible().is_empty());

        pools.release("macos");
        assert_eq!(
            pools.next_admissible(),
            vec![("macos".to_string(), key("arm64"))]
        );
        assert_eq!(pools.peak("macos"), 1);
        assert_eq!(pools.peak("default"), 2);
        assert_eq!(pools.queued("default"), 1);
    }

    #[test]
    fn test_declared_default_overrides_configuration() {
        let declared = BTreeMap::from([("default".to_string(), 5)]);
        let pools = PoolDispatcher::new(&declared, 2);
        assert_eq!(pools.limit("default"), Some(5));
    }

    #[test]
    fn test_drain_queued() {
        let mut pools = PoolDispatcher::new(&BTreeMap::new(), 1);
        pools.enqueue("default", key("a"));
        pools.enqueue("default", key("b"));
        pools.next_admissible();
        assert_eq!(pools.drain_queued(), vec![key("b")]);
        assert_eq!(pools.running("default"), 1);
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(1), Duration::from_secs(2));
        assert_eq!(policy.delay(2), Duration::from_secs(4));
        assert_eq!(policy.delay(3), Duration::from_secs(8));
        assert_eq!(policy.delay(10), Duration::from_secs(30));
    }

    struct FlakyProvider {
        failures: u32,
        calls: AtomicU32,
        workspace: tempfile::TempDir,
    }

    #[async_trait]
    impl EnvironmentProvider for FlakyProvider {
        async fn acquire(&self, request: &EnvironmentRequest) -> Result<Box<dyn Environment>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures {
                return Err(Error::EnvironmentUnavailable {
                    selector: request.selector.to_string(),
                    message: "no capacity".to_string(),
                });
            }
            Ok(Box::new(HostEnvironment::new(
                self.workspace.path().to_path_buf(),
            )))
        }
    }

    fn request() -> EnvironmentRequest {
        EnvironmentRequest {
            run_id: RunId::new(),
            job: key("linux"),
            selector: EnvironmentSelector::Container("alpine".to_string()),
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
        }
    }

    #[tokio::test]
    async fn test_acquire_retries_until_success() {
        let provider = FlakyProvider {
            failures: 2,
            calls: AtomicU32::new(0),
            workspace: tempfile::tempdir().unwrap(),
        };
        let (result, attempts) = acquire_environment(
            &provider,
            &request(),
            &fast_policy(),
            &CancellationToken::new(),
        )
        .await;
        assert!(result.is_ok());
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn test_acquire_gives_up_after_max_attempts() {
        let provider = FlakyProvider {
            failures: 10,
            calls: AtomicU32::new(0),
            workspace: tempfile::tempdir().unwrap(),
        };
        let (result, attempts) = acquire_environment(
            &provider,
            &request(),
            &fast_policy(),
            &CancellationToken::new(),
        )
        .await;
        assert!(matches!(result, Err(Error::EnvironmentUnavailable { .. })));
        assert_eq!(attempts, 3);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_acquire_observes_cancellation() {
        let provider = FlakyProvider {
            failures: 0,
            calls: AtomicU32::new(0),
            workspace: tempfile::tempdir().unwrap(),
        };
        let cancel = CancellationToken::new();
        cancel.cancel();
        let (result, attempts) =
            acquire_environment(&provider, &request(), &fast_policy(), &cancel).await;
        assert!(matches!(result, Err(Error::Canceled { .. })));
        assert_eq!(attempts, 0);
    }
}
