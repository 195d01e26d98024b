//! Immutable per-run parameter and variable snapshot.

use crate::expr::{Reference, Scope, Value};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Variables defined for every run from its trigger.
pub const BUILD_REASON: &str = "Build.Reason";
pub const BUILD_SOURCE_BRANCH: &str = "Build.SourceBranch";
pub const BUILD_SOURCE_BRANCH_NAME: &str = "Build.SourceBranchName";
pub const BUILD_REQUESTED_FOR: &str = "Build.RequestedFor";

pub const BUILTIN_VARIABLES: &[&str] = &[
    BUILD_REASON,
    BUILD_SOURCE_BRANCH,
    BUILD_SOURCE_BRANCH_NAME,
    BUILD_REQUESTED_FOR,
];

/// Why a run was triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum BuildReason {
    Manual,
    Schedule,
    #[serde(rename = "IndividualCI")]
    IndividualCi,
}

impl fmt::Display for BuildReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildReason::Manual => f.write_str("Manual"),
            BuildReason::Schedule => f.write_str("Schedule"),
            BuildReason::IndividualCi => f.write_str("IndividualCI"),
        }
    }
}

impl std::str::FromStr for BuildReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "manual" => Ok(BuildReason::Manual),
            "schedule" | "scheduled" => Ok(BuildReason::Schedule),
            "individualci" | "ci" | "push" => Ok(BuildReason::IndividualCi),
            other => Err(format!("unknown build reason: {}", other)),
        }
    }
}

/// Trigger inputs bound to a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct TriggerContext {
    pub reason: BuildReason,
    /// Fully qualified ref, e.g. `refs/heads/main`.
    pub source_branch: String,
    #[serde(default)]
    pub requested_for: Option<String>,
}

impl TriggerContext {
    /// Accepts either a short branch name or a fully qualified ref.
    pub fn new(reason: BuildReason, branch: &str) -> Self {
        let source_branch = if branch.starts_with("refs/") {
            branch.to_string()
        } else {
            format!("refs/heads/{}", branch)
        };
        Self {
            reason,
            source_branch,
            requested_for: None,
        }
    }

    pub fn requested_for(mut self, actor: impl Into<String>) -> Self {
        self.requested_for = Some(actor.into());
        self
    }

    /// Branch name without the `refs/heads/` prefix.
    pub fn branch_name(&self) -> &str {
        self.source_branch
            .strip_prefix("refs/heads/")
            .unwrap_or(&self.source_branch)
    }

    /// The built-in `Build.*` variables for this trigger.
    pub fn builtin_variables(&self) -> BTreeMap<String, Value> {
        BTreeMap::from([
            (BUILD_REASON.to_string(), Value::from(self.reason.to_string())),
            (
                BUILD_SOURCE_BRANCH.to_string(),
                Value::from(self.source_branch.clone()),
            ),
            (
                BUILD_SOURCE_BRANCH_NAME.to_string(),
                Value::from(self.branch_name()),
            ),
            (
                BUILD_REQUESTED_FOR.to_string(),
                Value::from(self.requested_for.clone().unwrap_or_default()),
            ),
        ])
    }
}

/// Resolved parameter and variable values for one run.
///
/// Computed once when the run is created and never mutated afterwards.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Snapshot {
    pub parameters: BTreeMap<String, Value>,
    pub variables: BTreeMap<String, Value>,
}

impl Snapshot {
    pub fn parameter(&self, name: &str) -> Option<&Value> {
        self.parameters.get(name)
    }

    pub fn variable(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }

    /// Variables as process environment, `Build.Reason` -> `BUILD_REASON`.
    pub fn environment(&self) -> BTreeMap<String, String> {
        self.variables
            .iter()
            .map(|(name, value)| (env_name(name), value.to_string()))
            .collect()
    }
}

impl Scope for Snapshot {
    fn lookup(&self, reference: &Reference) -> Option<Value> {
        match reference {
            Reference::Parameter(name) => self.parameters.get(name).cloned(),
            Reference::Variable(name) => self.variables.get(name).cloned(),
        }
    }
}

/// Upper-snake environment name for a variable.
pub fn env_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_context_branch_forms() {
        let short = TriggerContext::new(BuildReason::Manual, "release/1.90");
        assert_eq!(short.source_branch, "refs/heads/release/1.90");
        assert_eq!(short.branch_name(), "release/1.90");

        let full = TriggerContext::new(BuildReason::IndividualCi, "refs/heads/main");
        assert_eq!(full.branch_name(), "main");
    }

    #[test]
    fn test_builtin_variables() {
        let trigger = TriggerContext::new(BuildReason::Schedule, "main").requested_for("nightly");
        let vars = trigger.builtin_variables();
        assert_eq!(vars[BUILD_REASON], Value::from("Schedule"));
        assert_eq!(vars[BUILD_SOURCE_BRANCH_NAME], Value::from("main"));
        assert_eq!(vars[BUILD_REQUESTED_FOR], Value::from("nightly"));
    }

    #[test]
    fn test_build_reason_parse() {
        assert_eq!("ci".parse::<BuildReason>(), Ok(BuildReason::IndividualCi));
        assert_eq!("Schedule".parse::<BuildReason>(), Ok(BuildReason::Schedule));
        assert!("nope".parse::<BuildReason>().is_err());
    }

    #[test]
    fn test_environment_names() {
        let mut snapshot = Snapshot::default();
        snapshot
            .variables
            .insert("Build.Reason".to_string(), Value::from("Manual"));
        snapshot
            .variables
            .insert("VSCODE_QUALITY".to_string(), Value::from("insider"));

        let env = snapshot.environment();
        assert_eq!(env["BUILD_REASON"], "Manual");
        assert_eq!(env["VSCODE_QUALITY"], "insider");
    }
}
