//! DAG resolution for stages and jobs.

use foundry_core::expr::Condition;
use foundry_core::ids::JobKey;
use foundry_core::pipeline::{
    DEFAULT_POOL, DependencyPolicy, EnvironmentSelector, JobDefinition, PoolDefinition,
    StageDefinition, StepDefinition,
};
use foundry_runner::{JobSpec, StepSpec};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DagError {
    #[error("Cycle detected in {0} dependencies")]
    CycleDetected(String),
    #[error("Unknown dependency '{dependency}' of {node}")]
    UnknownDependency { node: String, dependency: String },
    #[error("Duplicate name: {0}")]
    DuplicateName(String),
    #[error("Empty pipeline")]
    EmptyPipeline,
    #[error("Stage '{0}' has no jobs")]
    EmptyStage(String),
    #[error("Job '{0}' has no steps")]
    EmptyJob(String),
    #[error("Step '{step}' of job '{job}' has an empty command")]
    EmptyCommand { job: String, step: String },
    #[error("Job '{job}' references unknown pool '{pool}'")]
    UnknownPool { job: String, pool: String },
    #[error("Pool '{0}' must allow at least one concurrent job")]
    InvalidPool(String),
    #[error("Job '{0}' selects both a container and a VM image")]
    ConflictingSelectors(String),
}

/// A stage with its jobs fully expanded.
#[derive(Debug, Clone)]
pub struct ExpandedStage {
    pub definition: StageDefinition,
    pub jobs: Vec<ExpandedJob>,
}

/// A job with its steps fully expanded.
#[derive(Debug, Clone)]
pub struct ExpandedJob {
    pub definition: JobDefinition,
    pub steps: Vec<StepDefinition>,
}

#[derive(Debug, Clone)]
pub struct StageNode {
    pub name: String,
    pub display_name: Option<String>,
    pub depends_on: Vec<String>,
    pub condition: Option<Condition>,
    pub policy: DependencyPolicy,
    pub required: bool,
}

#[derive(Debug, Clone)]
pub struct JobNode {
    pub key: JobKey,
    pub display_name: Option<String>,
    /// Sibling jobs within the same stage.
    pub depends_on: Vec<String>,
    pub condition: Option<Condition>,
    pub policy: DependencyPolicy,
    pub pool: String,
    pub selector: EnvironmentSelector,
    pub spec: JobSpec,
}

#[derive(Debug)]
struct JobGraph {
    graph: DiGraph<JobNode, ()>,
    order: Vec<NodeIndex>,
    index: HashMap<String, NodeIndex>,
}

/// Validated stage graph with one job graph per stage.
#[derive(Debug)]
pub struct PipelineGraph {
    stages: DiGraph<StageNode, ()>,
    stage_order: Vec<NodeIndex>,
    stage_index: HashMap<String, NodeIndex>,
    jobs: HashMap<String, JobGraph>,
    pools: BTreeMap<String, u32>,
}

impl PipelineGraph {
    /// Stages in topological order.
    pub fn stages(&self) -> Vec<&StageNode> {
        self.stage_order
            .iter()
            .filter_map(|&idx| self.stages.node_weight(idx))
            .collect()
    }

    pub fn stage(&self, name: &str) -> Option<&StageNode> {
        self.stage_index
            .get(name)
            .and_then(|&idx| self.stages.node_weight(idx))
    }

    /// Jobs of a stage in topological order.
    pub fn jobs(&self, stage: &str) -> Vec<&JobNode> {
        self.jobs
            .get(stage)
            .map(|jobs| {
                jobs.order
                    .iter()
                    .filter_map(|&idx| jobs.graph.node_weight(idx))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn job(&self, key: &JobKey) -> Option<&JobNode> {
        let jobs = self.jobs.get(&key.stage)?;
        jobs.index
            .get(&key.job)
            .and_then(|&idx| jobs.graph.node_weight(idx))
    }

    pub fn stage_count(&self) -> usize {
        self.stages.node_count()
    }

    pub fn job_count(&self) -> usize {
        self.jobs.values().map(|j| j.graph.node_count()).sum()
    }

    /// Declared pools and their concurrency limits. The default pool is
    /// only present when declared.
    pub fn pools(&self) -> &BTreeMap<String, u32> {
        &self.pools
    }
}

/// Builder for constructing pipeline graphs.
pub struct DagBuilder;

impl DagBuilder {
    pub fn new() -> Self {
        Self
    }

    pub fn build(
        &self,
        pools: &[PoolDefinition],
        stages: &[ExpandedStage],
    ) -> Result<PipelineGraph, DagError> {
        if stages.is_empty() {
            return Err(DagError::EmptyPipeline);
        }

        let mut pool_limits = BTreeMap::new();
        for pool in pools {
            if pool.max_concurrency == 0 {
                return Err(DagError::InvalidPool(pool.name.clone()));
            }
            if pool_limits
                .insert(pool.name.clone(), pool.max_concurrency)
                .is_some()
            {
                return Err(DagError::DuplicateName(format!("pool '{}'", pool.name)));
            }
        }

        let mut graph = DiGraph::new();
        let mut stage_index = HashMap::new();
        let mut jobs = HashMap::new();

        for stage in stages {
            let def = &stage.definition;
            let node = StageNode {
                name: def.name.clone(),
                display_name: def.display_name.clone(),
                depends_on: def.depends_on.clone(),
                condition: def.condition.clone(),
                policy: def.dependency_policy,
                required: def.required,
            };
            let idx = graph.add_node(node);
            if stage_index.insert(def.name.clone(), idx).is_some() {
                return Err(DagError::DuplicateName(format!("stage '{}'", def.name)));
            }
            jobs.insert(def.name.clone(), self.build_jobs(stage, &pool_limits)?);
        }

        for stage in stages {
            let def = &stage.definition;
            let stage_idx = stage_index[&def.name];
            for dep in &def.depends_on {
                let dep_idx =
                    stage_index
                        .get(dep)
                        .ok_or_else(|| DagError::UnknownDependency {
                            node: format!("stage '{}'", def.name),
                            dependency: dep.clone(),
                        })?;
                graph.add_edge(*dep_idx, stage_idx, ());
            }
        }

        let stage_order =
            toposort(&graph, None).map_err(|_| DagError::CycleDetected("stage".to_string()))?;

        Ok(PipelineGraph {
            stages: graph,
            stage_order,
            stage_index,
            jobs,
            pools: pool_limits,
        })
    }

    fn build_jobs(
        &self,
        stage: &ExpandedStage,
        pools: &BTreeMap<String, u32>,
    ) -> Result<JobGraph, DagError> {
        let stage_def = &stage.definition;
        if stage.jobs.is_empty() {
            return Err(DagError::EmptyStage(stage_def.name.clone()));
        }

        let mut graph = DiGraph::new();
        let mut index = HashMap::new();

        for job in &stage.jobs {
            let def = &job.definition;
            let key = JobKey::new(&stage_def.name, &def.name);
            if job.steps.is_empty() {
                return Err(DagError::EmptyJob(key.to_string()));
            }
            if let Some(step) = job.steps.iter().find(|s| s.run.trim().is_empty()) {
                return Err(DagError::EmptyCommand {
                    job: key.to_string(),
                    step: step.name.clone(),
                });
            }

            let pool = def
                .pool
                .clone()
                .or_else(|| stage_def.pool.clone())
                .unwrap_or_else(|| DEFAULT_POOL.to_string());
            if pool != DEFAULT_POOL && !pools.contains_key(&pool) {
                return Err(DagError::UnknownPool {
                    job: key.to_string(),
                    pool,
                });
            }

            let selector = match (&def.container, &def.vm_image) {
                (Some(_), Some(_)) => return Err(DagError::ConflictingSelectors(key.to_string())),
                (Some(image), None) => EnvironmentSelector::Container(image.clone()),
                (None, Some(image)) => EnvironmentSelector::VmImage(image.clone()),
                (None, None) => EnvironmentSelector::Pool(pool.clone()),
            };

            let mut variables = stage_def.variables.clone();
            variables.extend(def.variables.clone());
            let mut spec = JobSpec::new(
                key.clone(),
                def.timeout_minutes,
                job.steps.iter().cloned().map(StepSpec::new).collect(),
            );
            spec.variables = variables;

            let node = JobNode {
                key: key.clone(),
                display_name: def.display_name.clone(),
                depends_on: def.depends_on.clone(),
                condition: def.condition.clone(),
                policy: def.dependency_policy,
                pool,
                selector,
                spec,
            };
            let idx = graph.add_node(node);
            if index.insert(def.name.clone(), idx).is_some() {
                return Err(DagError::DuplicateName(format!("job '{}'", key)));
            }
        }

        for job in &stage.jobs {
            let def = &job.definition;
            let job_idx = index[&def.name];
            for dep in &def.depends_on {
                let dep_idx = index.get(dep).ok_or_else(|| DagError::UnknownDependency {
                    node: format!("job '{}/{}'", stage_def.name, def.name),
                    dependency: dep.clone(),
                })?;
                graph.add_edge(*dep_idx, job_idx, ());
            }
        }

        let order = toposort(&graph, None)
            .map_err(|_| DagError::CycleDetected(format!("job (stage '{}')", stage_def.name)))?;

        Ok(JobGraph {
            graph,
            order,
            index,
        })
    }
}

impl Default for DagBuilder {
    fn default() -> Self {
        Self::new()
    }
}
