//! Pipeline definition loading and template expansion.

use crate::dag::{DagBuilder, DagError, ExpandedJob, ExpandedStage, PipelineGraph};
use crate::triggers;
use crate::variables::SnapshotResolver;
use foundry_core::interpolation::{placeholder_names, substitute_parameters};
use foundry_core::pipeline::{
    JobEntry, PipelineDefinition, StageEntry, StepDefinition, StepEntry, TemplateDefinition,
    TemplateKind, TemplateReference,
};
use foundry_core::{Error, Result};
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info};

/// Maximum depth of templates including other templates.
pub const MAX_TEMPLATE_DEPTH: usize = 16;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("invalid pipeline YAML: {0}")]
    Yaml(String),
    #[error("unknown template '{0}'")]
    UnknownTemplate(String),
    #[error("template '{name}' is a {found} template, expected {expected}")]
    KindMismatch {
        name: String,
        expected: TemplateKind,
        found: TemplateKind,
    },
    #[error("template '{template}' parameter '{parameter}' is not bound and has no default")]
    UnboundParameter { template: String, parameter: String },
    #[error("template '{template}' has no parameter '{parameter}'")]
    UnknownParameter { template: String, parameter: String },
    #[error("template '{template}' exceeds the nesting limit of {limit}")]
    TooDeep { template: String, limit: usize },
    #[error("template '{template}' produced an invalid {kind}: {message}")]
    InvalidBody {
        template: String,
        kind: TemplateKind,
        message: String,
    },
    #[error(transparent)]
    Dag(#[from] DagError),
}

impl From<LoadError> for Error {
    fn from(err: LoadError) -> Self {
        Error::Configuration(err.to_string())
    }
}

/// A validated pipeline: expanded stages, the dependency graph, and the
/// snapshot resolver for its parameters and variables.
pub struct LoadedPipeline {
    pub definition: PipelineDefinition,
    pub stages: Vec<ExpandedStage>,
    pub graph: PipelineGraph,
    pub resolver: SnapshotResolver,
}

impl LoadedPipeline {
    pub fn name(&self) -> &str {
        &self.definition.name
    }
}

/// Loads YAML pipeline definitions.
pub struct PipelineLoader;

impl PipelineLoader {
    pub fn new() -> Self {
        Self
    }

    pub fn load_file(&self, path: &Path) -> Result<LoadedPipeline> {
        info!(path = %path.display(), "Loading pipeline");
        let yaml = std::fs::read_to_string(path).map_err(|e| {
            Error::configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        self.load_str(&yaml)
    }

    pub fn load_str(&self, yaml: &str) -> Result<LoadedPipeline> {
        let definition = self.parse(yaml)?;
        self.load(definition)
    }

    pub fn parse(&self, yaml: &str) -> std::result::Result<PipelineDefinition, LoadError> {
        serde_yaml::from_str(yaml).map_err(|e| LoadError::Yaml(e.to_string()))
    }

    /// Expand templates, build the graph, and check every condition.
    pub fn load(&self, definition: PipelineDefinition) -> Result<LoadedPipeline> {
        let resolver = SnapshotResolver::new(&definition.parameters, &definition.variables)?;
        triggers::validate(&definition)?;

        let expander = TemplateExpander {
            templates: &definition.templates,
        };
        let stages = expander.expand_stages(&definition.stages, 0)?;
        let graph = DagBuilder::new()
            .build(&definition.pools, &stages)
            .map_err(LoadError::from)?;

        for stage in &stages {
            let name = &stage.definition.name;
            if let Some(condition) = &stage.definition.condition {
                resolver.check_condition(condition, &format!("stage '{}'", name))?;
            }
            for job in &stage.jobs {
                let location = format!("job '{}/{}'", name, job.definition.name);
                if let Some(condition) = &job.definition.condition {
                    resolver.check_condition(condition, &location)?;
                }
                for step in &job.steps {
                    if let Some(condition) = &step.condition {
                        resolver.check_condition(
                            condition,
                            &format!("step '{}' of {}", step.name, location),
                        )?;
                    }
                }
            }
        }

        debug!(
            pipeline = %definition.name,
            stages = graph.stage_count(),
            jobs = graph.job_count(),
            "Pipeline loaded"
        );

        Ok(LoadedPipeline {
            definition,
            stages,
            graph,
            resolver,
        })
    }
}

impl Default for PipelineLoader {
    fn default() -> Self {
        Self::new()
    }
}

struct TemplateExpander<'a> {
    templates: &'a BTreeMap<String, TemplateDefinition>,
}

impl TemplateExpander<'_> {
    fn instantiate<T: DeserializeOwned>(
        &self,
        reference: &TemplateReference,
        expected: TemplateKind,
        depth: usize,
    ) -> std::result::Result<Vec<T>, LoadError> {
        if depth >= MAX_TEMPLATE_DEPTH {
            return Err(LoadError::TooDeep {
                template: reference.template.clone(),
                limit: MAX_TEMPLATE_DEPTH,
            });
        }
        let template = self
            .templates
            .get(&reference.template)
            .ok_or_else(|| LoadError::UnknownTemplate(reference.template.clone()))?;
        if template.kind != expected {
            return Err(LoadError::KindMismatch {
                name: reference.template.clone(),
                expected,
                found: template.kind,
            });
        }

        if let Some(unknown) = reference
            .parameters
            .keys()
            .find(|name| !template.parameters.iter().any(|p| &p.name == *name))
        {
            return Err(LoadError::UnknownParameter {
                template: reference.template.clone(),
                parameter: unknown.clone(),
            });
        }

        if let Some(undeclared) = placeholder_names(&template.body)
            .into_iter()
            .find(|name| !template.parameters.iter().any(|p| &p.name == name))
        {
            return Err(LoadError::UnknownParameter {
                template: reference.template.clone(),
                parameter: undeclared,
            });
        }

        let mut bindings = BTreeMap::new();
        for param in &template.parameters {
            let value = reference
                .parameters
                .get(&param.name)
                .or(param.default.as_ref())
                .ok_or_else(|| LoadError::UnboundParameter {
                    template: reference.template.clone(),
                    parameter: param.name.clone(),
                })?;
            bindings.insert(param.name.clone(), value.clone());
        }

        let body = substitute_parameters(&template.body, &bindings);
        let items = match body {
            serde_json::Value::Array(items) => items,
            single => vec![single],
        };

        debug!(template = %reference.template, kind = %expected, depth, "Instantiated template");

        items
            .into_iter()
            .map(|item| {
                serde_json::from_value(item).map_err(|e| LoadError::InvalidBody {
                    template: reference.template.clone(),
                    kind: expected,
                    message: e.to_string(),
                })
            })
            .collect()
    }

    fn expand_stages(
        &self,
        entries: &[StageEntry],
        depth: usize,
    ) -> std::result::Result<Vec<ExpandedStage>, LoadError> {
        let mut out = Vec::new();
        for entry in entries {
            match entry {
                StageEntry::Template(reference) => {
                    let nested: Vec<StageEntry> =
                        self.instantiate(reference, TemplateKind::Stage, depth)?;
                    out.extend(self.expand_stages(&nested, depth + 1)?);
                }
                StageEntry::Stage(stage) => {
                    let jobs = self.expand_jobs(&stage.jobs, depth)?;
                    let mut definition = stage.clone();
                    definition.jobs.clear();
                    out.push(ExpandedStage { definition, jobs });
                }
            }
        }
        Ok(out)
    }

    fn expand_jobs(
        &self,
        entries: &[JobEntry],
        depth: usize,
    ) -> std::result::Result<Vec<ExpandedJob>, LoadError> {
        let mut out = Vec::new();
        for entry in entries {
            match entry {
                JobEntry::Template(reference) => {
                    let nested: Vec<JobEntry> =
                        self.instantiate(reference, TemplateKind::Job, depth)?;
                    out.extend(self.expand_jobs(&nested, depth + 1)?);
                }
                JobEntry::Job(job) => {
                    let steps = self.expand_steps(&job.steps, depth)?;
                    let mut definition = job.clone();
                    definition.steps.clear();
                    out.push(ExpandedJob { definition, steps });
                }
            }
        }
        Ok(out)
    }

    fn expand_steps(
        &self,
        entries: &[StepEntry],
        depth: usize,
    ) -> std::result::Result<Vec<StepDefinition>, LoadError> {
        let mut out = Vec::new();
        for entry in entries {
            match entry {
                StepEntry::Template(reference) => {
                    let nested: Vec<StepEntry> =
                        self.instantiate(reference, TemplateKind::Steps, depth)?;
                    out.extend(self.expand_steps(&nested, depth + 1)?);
                }
                StepEntry::Step(step) => out.push(step.clone()),
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use foundry_core::ids::JobKey;
    use foundry_core::pipeline::EnvironmentSelector;
    use pretty_assertions::assert_eq;

    const PIPELINE: &str = r#"
name: product-build
parameters:
  - name: VSCODE_BUILD_LINUX_ARM64
    type: boolean
    default: false
templates:
  linux-job:
    kind: job
    parameters:
      - name: arch
      - name: container
        default: vscode-linux-build-agent:centos7
    body:
      name: build_${{ parameters.arch }}
      container: ${{ parameters.container }}
      steps:
        - template: compile-steps
          parameters:
            target: linux-${{ parameters.arch }}
  compile-steps:
    kind: steps
    parameters:
      - name: target
    body:
      - name: install
        run: npm ci
      - name: compile
        run: npm run gulp vscode-${{ parameters.target }}
stages:
  - name: Compile
    jobs:
      - name: compile
        steps:
          - name: compile
            run: npm run compile
  - name: Linux
    depends_on: [Compile]
    jobs:
      - template: linux-job
        parameters:
          arch: x64
      - template: linux-job
        parameters:
          arch: arm64
          container: vscode-linux-build-agent:arm64
"#;

    #[test]
    fn test_template_expansion() {
        let loaded = PipelineLoader::new().load_str(PIPELINE).unwrap();
        assert_eq!(loaded.graph.stage_count(), 2);
        assert_eq!(loaded.graph.job_count(), 3);

        let arm = loaded
            .graph
            .job(&JobKey::new("Linux", "build_arm64"))
            .unwrap();
        assert_eq!(
            arm.selector,
            EnvironmentSelector::Container("vscode-linux-build-agent:arm64".into())
        );
        let commands: Vec<_> = arm
            .spec
            .steps
            .iter()
            .map(|s| s.definition.run.clone())
            .collect();
        assert_eq!(
            commands,
            vec!["npm ci", "npm run gulp vscode-linux-arm64"]
        );

        let x64 = loaded.graph.job(&JobKey::new("Linux", "build_x64")).unwrap();
        assert_eq!(
            x64.selector,
            EnvironmentSelector::Container("vscode-linux-build-agent:centos7".into())
        );
    }

    #[test]
    fn test_unknown_template() {
        let yaml = r#"
name: p
stages:
  - template: missing
"#;
        let err = PipelineLoader::new().load_str(yaml).err().unwrap();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn test_unbound_template_parameter() {
        let yaml = r#"
name: p
templates:
  steps:
    kind: steps
    parameters:
      - name: target
    body:
      - name: build
        run: make ${{ parameters.target }}
stages:
  - name: A
    jobs:
      - name: a
        steps:
          - template: steps
"#;
        let err = PipelineLoader::new().load_str(yaml).err().unwrap();
        assert!(err.to_string().contains("target"));
    }

    #[test]
    fn test_template_placeholder_must_be_declared() {
        let yaml = r#"
name: p
templates:
  steps:
    kind: steps
    parameters:
      - name: target
        default: linux
    body:
      - name: build
        run: make ${{ parameters.target }}-${{ parameters.arch }}
stages:
  - name: A
    jobs:
      - name: a
        steps:
          - template: steps
"#;
        let err = PipelineLoader::new().load_str(yaml).err().unwrap();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("has no parameter 'arch'"));
    }

    #[test]
    fn test_template_kind_mismatch() {
        let yaml = r#"
name: p
templates:
  steps:
    kind: steps
    body:
      - name: build
        run: make
stages:
  - template: steps
"#;
        let err = PipelineLoader::new().load_str(yaml).err().unwrap();
        assert!(err.to_string().contains("expected stage"));
    }

    #[test]
    fn test_recursive_template_hits_depth_limit() {
        let yaml = r#"
name: p
templates:
  loop:
    kind: steps
    body:
      - template: loop
stages:
  - name: A
    jobs:
      - name: a
        steps:
          - template: loop
"#;
        let err = PipelineLoader::new().load_str(yaml).err().unwrap();
        assert!(err.to_string().contains("nesting limit"));
    }

    #[test]
    fn test_condition_with_unknown_reference_fails_load() {
        let yaml = r#"
name: p
stages:
  - name: A
    condition: eq(parameters.VSCODE_BUILD_MACOS, true)
    jobs:
      - name: a
        steps:
          - name: s
            run: echo
"#;
        let err = PipelineLoader::new().load_str(yaml).err().unwrap();
        assert!(err.to_string().contains("VSCODE_BUILD_MACOS"));
    }

    #[test]
    fn test_malformed_yaml_is_configuration_error() {
        let err = PipelineLoader::new()
            .load_str("name: [unterminated")
            .err()
            .unwrap();
        assert!(err.is_configuration());
    }
}
