//! Pipeline definition types.
//!
//! These types represent the user-authored pipeline YAML document before
//! template expansion. The loader in `foundry-scheduler` turns them into a
//! validated stage/job graph.

use crate::expr::Condition;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Name of the pool used by jobs that do not select one.
pub const DEFAULT_POOL: &str = "default";

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PipelineDefinition {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub parameters: Vec<ParameterDefinition>,
    #[serde(default)]
    pub variables: Vec<VariableDefinition>,
    #[serde(default)]
    pub pools: Vec<PoolDefinition>,
    #[serde(default)]
    pub trigger: Option<CiTrigger>,
    #[serde(default)]
    pub schedules: Vec<ScheduleDefinition>,
    #[serde(default)]
    pub templates: BTreeMap<String, TemplateDefinition>,
    pub stages: Vec<StageEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ParameterDefinition {
    pub name: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(rename = "type", default)]
    pub param_type: ParameterType,
    #[serde(default)]
    pub default: Option<serde_json::Value>,
    /// Allowed values for `enum` parameters.
    #[serde(default)]
    pub values: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ParameterType {
    Boolean,
    #[default]
    String,
    Enum,
}

/// A run-level variable: a literal `value` or an `expr` over the snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct VariableDefinition {
    pub name: String,
    #[serde(default)]
    pub value: Option<serde_json::Value>,
    #[serde(default)]
    pub expr: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PoolDefinition {
    pub name: String,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: u32,
    #[serde(default)]
    pub description: Option<String>,
}

fn default_max_concurrency() -> u32 {
    1
}

/// Branch include/exclude globs, e.g. `main`, `release/*`, `release/**`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct BranchFilter {
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct CiTrigger {
    #[serde(default)]
    pub branches: BranchFilter,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ScheduleDefinition {
    pub cron: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub branches: BranchFilter,
    /// Run even when the branch has no new changes.
    #[serde(default)]
    pub always: bool,
    #[serde(default)]
    pub parameters: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TemplateKind {
    Stage,
    Job,
    Steps,
}

impl fmt::Display for TemplateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TemplateKind::Stage => f.write_str("stage"),
            TemplateKind::Job => f.write_str("job"),
            TemplateKind::Steps => f.write_str("steps"),
        }
    }
}

/// A reusable, parameterized stage, job, or step-list body.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TemplateDefinition {
    pub kind: TemplateKind,
    #[serde(default)]
    pub parameters: Vec<TemplateParameter>,
    pub body: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TemplateParameter {
    pub name: String,
    #[serde(default)]
    pub default: Option<serde_json::Value>,
}

/// A call site instantiating a template.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct TemplateReference {
    pub template: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum StageEntry {
    Template(TemplateReference),
    Stage(StageDefinition),
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum JobEntry {
    Template(TemplateReference),
    Job(JobDefinition),
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum StepEntry {
    Template(TemplateReference),
    Step(StepDefinition),
}

/// How a node reacts to the outcome of its dependencies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum DependencyPolicy {
    /// Every dependency succeeded.
    #[default]
    Succeeded,
    /// Every dependency succeeded or was skipped.
    SucceededOrSkipped,
    /// Every dependency reached a terminal state, whatever the outcome.
    Completed,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StageDefinition {
    pub name: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub condition: Option<Condition>,
    #[serde(default)]
    pub dependency_policy: DependencyPolicy,
    /// Pool for jobs that do not select their own.
    #[serde(default)]
    pub pool: Option<String>,
    /// Whether the stage counts towards the run outcome.
    #[serde(default = "default_true")]
    pub required: bool,
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
    pub jobs: Vec<JobEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct JobDefinition {
    pub name: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub condition: Option<Condition>,
    #[serde(default)]
    pub dependency_policy: DependencyPolicy,
    #[serde(default)]
    pub pool: Option<String>,
    #[serde(default)]
    pub container: Option<String>,
    #[serde(default)]
    pub vm_image: Option<String>,
    #[serde(default = "default_job_timeout")]
    pub timeout_minutes: u32,
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
    pub steps: Vec<StepEntry>,
}

fn default_job_timeout() -> u32 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StepDefinition {
    pub name: String,
    #[serde(default)]
    pub display_name: Option<String>,
    pub run: String,
    #[serde(default = "default_shell")]
    pub shell: String,
    #[serde(default)]
    pub working_directory: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub condition: Option<Condition>,
    #[serde(default = "default_step_timeout")]
    pub timeout_minutes: u32,
    #[serde(default)]
    pub continue_on_error: bool,
}

fn default_shell() -> String {
    "bash".to_string()
}

fn default_step_timeout() -> u32 {
    30
}

fn default_true() -> bool {
    true
}

/// Where a job runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case", tag = "kind", content = "name")]
pub enum EnvironmentSelector {
    Pool(String),
    Container(String),
    VmImage(String),
}

impl fmt::Display for EnvironmentSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnvironmentSelector::Pool(name) => write!(f, "pool:{}", name),
            EnvironmentSelector::Container(image) => write!(f, "container:{}", image),
            EnvironmentSelector::VmImage(image) => write!(f, "vm:{}", image),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_entry_variants() {
        let yaml = r#"
- template: platform-stage
  parameters:
    os: linux
- name: Compile
  jobs:
    - name: compile
      steps:
        - name: build
          run: npm run compile
"#;
        let entries: Vec<StageEntry> = serde_yaml::from_str(yaml).unwrap();
        assert!(matches!(&entries[0], StageEntry::Template(r) if r.template == "platform-stage"));
        let StageEntry::Stage(stage) = &entries[1] else {
            panic!("expected inline stage");
        };
        assert!(stage.required);
        assert_eq!(stage.dependency_policy, DependencyPolicy::Succeeded);

        let JobEntry::Job(job) = &stage.jobs[0] else {
            panic!("expected inline job");
        };
        assert_eq!(job.timeout_minutes, 60);
        let StepEntry::Step(step) = &job.steps[0] else {
            panic!("expected inline step");
        };
        assert_eq!(step.shell, "bash");
        assert_eq!(step.timeout_minutes, 30);
        assert!(!step.continue_on_error);
    }

    #[test]
    fn test_parameter_types() {
        let yaml = r#"
- name: VSCODE_BUILD_WIN32
  type: boolean
  default: true
- name: VSCODE_QUALITY
  type: enum
  values: [exploration, insider, stable]
- name: NOTE
"#;
        let params: Vec<ParameterDefinition> = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(params[0].param_type, ParameterType::Boolean);
        assert_eq!(params[0].default, Some(serde_json::Value::Bool(true)));
        assert_eq!(params[1].values.len(), 3);
        assert_eq!(params[2].param_type, ParameterType::String);
    }

    #[test]
    fn test_selector_display() {
        assert_eq!(
            EnvironmentSelector::Container("vscode-linux-build-agent:centos7".into()).to_string(),
            "container:vscode-linux-build-agent:centos7"
        );
    }
}
