//! Port traits.
//!
//! These traits define the interfaces between the orchestration core and
//! its adapters: where events go and where run records live.

use crate::events::Event;
use crate::ids::RunId;
use crate::run::{Run, RunSummary};
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Receives run lifecycle events.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Publish an event. Sinks must not block the run on slow consumers.
    async fn publish(&self, event: Event) -> Result<()>;
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullEventSink;

#[async_trait]
impl EventSink for NullEventSink {
    async fn publish(&self, _event: Event) -> Result<()> {
        Ok(())
    }
}

/// Persistence for run records.
#[async_trait]
pub trait RunRepository: Send + Sync {
    /// Insert or replace a run.
    async fn save(&self, run: &Run) -> Result<()>;

    /// Get a run by ID.
    async fn get(&self, id: RunId) -> Result<Option<Run>>;

    /// List runs, newest first.
    async fn list(&self, limit: usize) -> Result<Vec<RunSummary>>;

    /// Delete a run. Returns whether it existed.
    async fn delete(&self, id: RunId) -> Result<bool>;

    /// Delete terminal runs created before `cutoff`. Returns the removed IDs.
    async fn prune(&self, cutoff: DateTime<Utc>) -> Result<Vec<RunId>>;
}
