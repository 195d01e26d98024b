//! Run record persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use foundry_core::ids::RunId;
use foundry_core::ports::RunRepository;
use foundry_core::run::{Run, RunSummary};
use foundry_core::{Error, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// In-memory implementation of RunRepository.
#[derive(Default)]
pub struct MemoryRunStore {
    runs: RwLock<HashMap<RunId, Run>>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn newest_first(mut summaries: Vec<RunSummary>, limit: usize) -> Vec<RunSummary> {
    summaries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    summaries.truncate(limit);
    summaries
}

fn expired(run: &Run, cutoff: DateTime<Utc>) -> bool {
    run.status.is_terminal() && run.created_at < cutoff
}

#[async_trait]
impl RunRepository for MemoryRunStore {
    async fn save(&self, run: &Run) -> Result<()> {
        self.runs.write().await.insert(run.id, run.clone());
        Ok(())
    }

    async fn get(&self, id: RunId) -> Result<Option<Run>> {
        Ok(self.runs.read().await.get(&id).cloned())
    }

    async fn list(&self, limit: usize) -> Result<Vec<RunSummary>> {
        let runs = self.runs.read().await;
        Ok(newest_first(runs.values().map(RunSummary::from).collect(), limit))
    }

    async fn delete(&self, id: RunId) -> Result<bool> {
        Ok(self.runs.write().await.remove(&id).is_some())
    }

    async fn prune(&self, cutoff: DateTime<Utc>) -> Result<Vec<RunId>> {
        let mut runs = self.runs.write().await;
        let expired: Vec<RunId> = runs
            .values()
            .filter(|run| expired(run, cutoff))
            .map(|run| run.id)
            .collect();
        for id in &expired {
            runs.remove(id);
        }
        Ok(expired)
    }
}

/// Stores each run as `<state_dir>/runs/<id>.json`.
pub struct FileRunStore {
    dir: PathBuf,
}

impl FileRunStore {
    pub fn new(state_dir: impl AsRef<Path>) -> Self {
        Self {
            dir: state_dir.as_ref().join("runs"),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, id: RunId) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    async fn read(path: &Path) -> Result<Run> {
        let bytes = tokio::fs::read(path).await?;
        serde_json::from_slice(&bytes).map_err(|e| {
            Error::Serialization(format!("{}: {}", path.display(), e))
        })
    }

    async fn read_all(&self) -> Result<Vec<Run>> {
        let mut runs = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(runs),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match Self::read(&path).await {
                Ok(run) => runs.push(run),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable run record"),
            }
        }
        Ok(runs)
    }
}

#[async_trait]
impl RunRepository for FileRunStore {
    async fn save(&self, run: &Run) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let json = serde_json::to_vec_pretty(run)?;
        let path = self.path(run.id);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!(run_id = %run.id, path = %path.display(), "Run saved");
        Ok(())
    }

    async fn get(&self, id: RunId) -> Result<Option<Run>> {
        let path = self.path(id);
        if !tokio::fs::try_exists(&path).await? {
            return Ok(None);
        }
        Self::read(&path).await.map(Some)
    }

    async fn list(&self, limit: usize) -> Result<Vec<RunSummary>> {
        let runs = self.read_all().await?;
        Ok(newest_first(runs.iter().map(RunSummary::from).collect(), limit))
    }

    async fn delete(&self, id: RunId) -> Result<bool> {
        match tokio::fs::remove_file(self.path(id)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn prune(&self, cutoff: DateTime<Utc>) -> Result<Vec<RunId>> {
        let mut removed = Vec::new();
        for run in self.read_all().await? {
            if expired(&run, cutoff) {
                tokio::fs::remove_file(self.path(run.id)).await?;
                removed.push(run.id);
            }
        }
        Ok(removed)
    }
}
