//! Integration test infrastructure for Foundry.
//!
//! Runs go through the real orchestrator with scripted environments in
//! place of shells and containers, so scenarios stay fast and
//! deterministic.
//!
//! # Usage
//!
//! ```ignore
//! use foundry_tests::{FakeEnvironmentProvider, TestHarness, fixtures};
//!
//! #[tokio::test]
//! async fn test_something() {
//!     let harness = TestHarness::new(FakeEnvironmentProvider::new());
//!     let run = harness.run(fixtures::FAN_OUT).await.unwrap();
//! }
//! ```

pub mod fixtures;
pub mod helpers;

pub use helpers::*;

/// Initialize test logging (call once per test binary).
pub fn init_test_logging() {
    use tracing_subscriber::{EnvFilter, fmt};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warn,foundry_scheduler=debug")),
        )
        .with_test_writer()
        .try_init();
}
