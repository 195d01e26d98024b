//! Run records on disk and resumption of interrupted runs.

use chrono::{Duration as ChronoDuration, Utc};
use foundry_core::ids::JobKey;
use foundry_core::ports::{NullEventSink, RunRepository};
use foundry_core::run::{NodeStatus, RunStatus, SkipReason};
use foundry_runner::JobExecution;
use foundry_scheduler::{FileRunStore, Orchestrator, PipelineLoader, RunStateTracker};
use foundry_tests::{FakeEnvironmentProvider, fast_settings, fixtures, manual_request};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn orchestrator(provider: &FakeEnvironmentProvider, store: Arc<FileRunStore>) -> Orchestrator {
    Orchestrator::new(Arc::new(provider.clone()), Arc::new(NullEventSink), store)
        .with_settings(fast_settings())
}

#[tokio::test]
async fn test_finished_run_written_to_state_dir() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileRunStore::new(dir.path()));
    let provider = FakeEnvironmentProvider::new();
    let pipeline = PipelineLoader::new()
        .load_str(&fixtures::fan_out("echo ok"))
        .unwrap();

    let run = orchestrator(&provider, store.clone())
        .run(&pipeline, manual_request(), CancellationToken::new())
        .await
        .unwrap();

    let path = dir.path().join("runs").join(format!("{}.json", run.id));
    assert!(path.exists());

    let reopened = FileRunStore::new(dir.path());
    let stored = reopened.get(run.id).await.unwrap().unwrap();
    assert_eq!(stored.status, RunStatus::Succeeded);
    assert_eq!(stored.stages.len(), 4);
    assert_eq!(
        stored.job(&JobKey::new("Windows", "package")).unwrap().steps[0].log[0].content,
        "windows"
    );

    let listed = reopened.list(10).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, run.id);
}

#[tokio::test]
async fn test_prune_keeps_recent_runs() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileRunStore::new(dir.path()));
    let provider = FakeEnvironmentProvider::new();
    let pipeline = PipelineLoader::new()
        .load_str(&fixtures::fan_out("echo ok"))
        .unwrap();
    let orchestrator = orchestrator(&provider, store.clone());

    let old = orchestrator
        .run(&pipeline, manual_request(), CancellationToken::new())
        .await
        .unwrap();
    let mut aged = old.clone();
    aged.created_at = Utc::now() - ChronoDuration::days(45);
    store.save(&aged).await.unwrap();

    let recent = orchestrator
        .run(&pipeline, manual_request(), CancellationToken::new())
        .await
        .unwrap();

    let removed = store
        .prune(Utc::now() - ChronoDuration::days(30))
        .await
        .unwrap();
    assert_eq!(removed, vec![old.id]);
    assert!(store.get(old.id).await.unwrap().is_none());
    assert!(store.get(recent.id).await.unwrap().is_some());
}

#[tokio::test]
async fn test_resume_runs_only_unfinished_work() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileRunStore::new(dir.path()));
    let pipeline = PipelineLoader::new().load_str(fixtures::TWO_JOBS).unwrap();

    // A previous process finished `lint` and stopped before `build` started.
    let interrupted = {
        let prepared = orchestrator(&FakeEnvironmentProvider::new(), store.clone())
            .prepare(&pipeline, manual_request())
            .unwrap();
        let lint = JobKey::new("Compile", "lint");
        let mut tracker = RunStateTracker::new(prepared);
        tracker.start();
        tracker.start_stage("Compile").unwrap();
        tracker.start_job(&lint).unwrap();
        let mut steps = tracker.run().job(&lint).unwrap().steps.clone();
        for step in &mut steps {
            step.status = NodeStatus::Succeeded;
            step.exit_code = Some(0);
        }
        tracker
            .complete_job(
                &lint,
                JobExecution {
                    status: NodeStatus::Succeeded,
                    error: None,
                    steps,
                },
            )
            .unwrap();
        tracker.into_run()
    };
    store.save(&interrupted).await.unwrap();

    let provider = FakeEnvironmentProvider::new();
    let run = orchestrator(&provider, store.clone())
        .resume(&pipeline, interrupted.id, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(run.id, interrupted.id);
    assert_eq!(run.status, RunStatus::Succeeded);
    assert!(run.is_settled());
    assert_eq!(
        provider.acquired(),
        vec![JobKey::new("Compile", "build"), JobKey::new("Test", "unit")]
    );

    // A finished run cannot be resumed again.
    let err = orchestrator(&provider, store.clone())
        .resume(&pipeline, run.id, CancellationToken::new())
        .await
        .unwrap_err();
    assert!(err.is_configuration());
}

#[tokio::test]
async fn test_resume_cancels_jobs_that_were_running() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileRunStore::new(dir.path()));
    let pipeline = PipelineLoader::new().load_str(fixtures::TWO_JOBS).unwrap();

    let interrupted = {
        let prepared = orchestrator(&FakeEnvironmentProvider::new(), store.clone())
            .prepare(&pipeline, manual_request())
            .unwrap();
        let mut tracker = RunStateTracker::new(prepared);
        tracker.start();
        tracker.start_stage("Compile").unwrap();
        tracker.start_job(&JobKey::new("Compile", "build")).unwrap();
        tracker.into_run()
    };
    store.save(&interrupted).await.unwrap();

    let provider = FakeEnvironmentProvider::new();
    let run = orchestrator(&provider, store.clone())
        .resume(&pipeline, interrupted.id, CancellationToken::new())
        .await
        .unwrap();

    let build = run.job(&JobKey::new("Compile", "build")).unwrap();
    assert_eq!(build.status, NodeStatus::Canceled);
    assert!(build.error.as_deref().unwrap().contains("interrupted"));
    assert_eq!(
        run.job(&JobKey::new("Compile", "lint")).unwrap().status,
        NodeStatus::Succeeded
    );
    assert_eq!(run.stage("Compile").unwrap().status, NodeStatus::Canceled);
    let test = run.stage("Test").unwrap();
    assert_eq!(test.status, NodeStatus::Skipped);
    assert_eq!(test.skip_reason, Some(SkipReason::Canceled));
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(provider.acquired(), vec![JobKey::new("Compile", "lint")]);
}
