//! Pipeline loading, scheduling and run orchestration for Foundry.

pub mod dag;
pub mod engine;
pub mod loader;
pub mod pool;
pub mod scheduler;
pub mod state;
pub mod store;
pub mod triggers;
pub mod variables;

pub use dag::{DagBuilder, DagError, PipelineGraph};
pub use engine::{Orchestrator, OrchestratorSettings, RunRequest};
pub use loader::{LoadError, LoadedPipeline, PipelineLoader};
pub use pool::{PoolDispatcher, RetryPolicy};
pub use scheduler::{DependencyScheduler, preview};
pub use state::RunStateTracker;
pub use store::{FileRunStore, MemoryRunStore};
pub use variables::SnapshotResolver;
