//! Load-time validation: nothing runs when a definition is rejected.

use foundry_core::ports::RunRepository;
use foundry_scheduler::PipelineLoader;
use foundry_tests::{FakeEnvironmentProvider, TestHarness, fixtures, manual_request};

#[tokio::test]
async fn test_undeclared_parameter_rejected_before_any_node() {
    let harness = TestHarness::new(FakeEnvironmentProvider::new());

    let err = PipelineLoader::new()
        .load_str(fixtures::UNDECLARED_PARAMETER)
        .err()
        .expect("load should fail");
    assert!(err.is_configuration());
    assert!(err.to_string().contains("undeclared parameter 'channel'"));

    let err = harness.run(fixtures::UNDECLARED_PARAMETER).await.unwrap_err();
    assert!(err.to_string().contains("channel"));
    assert!(harness.events.events().is_empty());
    assert!(harness.store.list(10).await.unwrap().is_empty());
    assert_eq!(harness.provider.calls(), 0);
}

#[test]
fn test_stage_cycle_rejected() {
    let err = PipelineLoader::new()
        .load_str(fixtures::STAGE_CYCLE)
        .err()
        .expect("load should fail");
    assert!(err.is_configuration());
    assert!(err.to_string().contains("Cycle detected"));
}

#[test]
fn test_malformed_condition_rejected() {
    let yaml = r#"
name: bad-condition
stages:
  - name: Build
    condition: eq(parameters.missing, true
    jobs:
      - name: build
        steps: [{ name: build, run: echo build }]
"#;
    let err = PipelineLoader::new().load_str(yaml).err().expect("load should fail");
    assert!(err.is_configuration());
}

#[test]
fn test_condition_on_undeclared_parameter_rejected() {
    let yaml = r#"
name: bad-reference
stages:
  - name: Build
    condition: eq(parameters.missing, true)
    jobs:
      - name: build
        steps: [{ name: build, run: echo build }]
"#;
    let err = PipelineLoader::new().load_str(yaml).err().expect("load should fail");
    assert!(err.is_configuration());
    assert!(err.to_string().contains("missing"));
}

#[tokio::test]
async fn test_unknown_run_parameter_rejected() {
    let harness = TestHarness::new(FakeEnvironmentProvider::new());
    let request = manual_request().parameter("sign", serde_json::json!(true));

    let pipeline = PipelineLoader::new().load_str(fixtures::POLICIES).unwrap();
    let err = harness.orchestrator.prepare(&pipeline, request).unwrap_err();

    assert!(err.is_configuration());
    assert_eq!(harness.provider.calls(), 0);
}
