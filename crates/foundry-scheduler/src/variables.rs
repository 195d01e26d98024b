//! Parameter validation and variable derivation.
//!
//! Produces the immutable [`Snapshot`] for a run. Variables are computed in
//! reference-dependency order, never in declaration order.

use foundry_core::expr::{Condition, Expr, Reference, Value};
use foundry_core::pipeline::{ParameterDefinition, ParameterType, VariableDefinition};
use foundry_core::snapshot::{BUILTIN_VARIABLES, Snapshot, TriggerContext};
use foundry_core::{Error, Result};
use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

enum VariableSource {
    Literal(Value),
    Expr(Expr),
}

/// Resolves run snapshots for one pipeline definition.
pub struct SnapshotResolver {
    parameters: Vec<ParameterDefinition>,
    /// Variables in evaluation order.
    variables: Vec<(String, VariableSource)>,
}

impl SnapshotResolver {
    /// Validate parameter and variable declarations.
    ///
    /// Fails on duplicate names, malformed expressions, references to
    /// undeclared parameters or variables, and variable cycles.
    pub fn new(
        parameters: &[ParameterDefinition],
        variables: &[VariableDefinition],
    ) -> Result<Self> {
        let mut seen = BTreeMap::new();
        for param in parameters {
            if seen.insert(param.name.clone(), ()).is_some() {
                return Err(Error::configuration(format!(
                    "duplicate parameter '{}'",
                    param.name
                )));
            }
            if param.param_type == ParameterType::Enum && param.values.is_empty() {
                return Err(Error::configuration(format!(
                    "enum parameter '{}' declares no values",
                    param.name
                )));
            }
            if let Some(default) = &param.default {
                coerce_parameter(param, default)?;
            }
        }

        let mut sources = HashMap::new();
        let mut order = Vec::new();
        for var in variables {
            if BUILTIN_VARIABLES.contains(&var.name.as_str()) {
                return Err(Error::configuration(format!(
                    "variable '{}' is built in and cannot be redefined",
                    var.name
                )));
            }
            let source = match (&var.value, &var.expr) {
                (Some(value), None) => VariableSource::Literal(Value::from_json(value)),
                (None, Some(expr)) => VariableSource::Expr(Expr::parse(expr).map_err(|e| {
                    Error::configuration(format!("variable '{}': {}", var.name, e))
                })?),
                _ => {
                    return Err(Error::configuration(format!(
                        "variable '{}' must set exactly one of `value` or `expr`",
                        var.name
                    )));
                }
            };
            if sources.insert(var.name.clone(), source).is_some() {
                return Err(Error::configuration(format!(
                    "duplicate variable '{}'",
                    var.name
                )));
            }
            order.push(var.name.clone());
        }

        let mut graph = DiGraph::<String, ()>::new();
        let index: HashMap<String, _> = order
            .iter()
            .map(|name| (name.clone(), graph.add_node(name.clone())))
            .collect();

        for name in &order {
            let VariableSource::Expr(expr) = &sources[name] else {
                continue;
            };
            for reference in expr.references() {
                match reference {
                    Reference::Parameter(param) => {
                        if !parameters.iter().any(|p| &p.name == param) {
                            return Err(Error::configuration(format!(
                                "variable '{}' references undeclared parameter '{}'",
                                name, param
                            )));
                        }
                    }
                    Reference::Variable(var) => {
                        if BUILTIN_VARIABLES.contains(&var.as_str()) {
                            continue;
                        }
                        let dep = index.get(var).ok_or_else(|| {
                            Error::configuration(format!(
                                "variable '{}' references undeclared variable '{}'",
                                name, var
                            ))
                        })?;
                        graph.add_edge(*dep, index[name], ());
                    }
                }
            }
        }

        let sorted = toposort(&graph, None).map_err(|cycle| {
            Error::configuration(format!(
                "variable cycle involving '{}'",
                graph[cycle.node_id()]
            ))
        })?;

        let variables = sorted
            .into_iter()
            .map(|idx| {
                let name = graph[idx].clone();
                let source = sources
                    .remove(&name)
                    .ok_or_else(|| Error::Internal(format!("variable '{}' lost", name)))?;
                Ok((name, source))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            parameters: parameters.to_vec(),
            variables,
        })
    }

    /// Check that every reference in `condition` names a declared
    /// parameter, a declared variable, or a built-in variable.
    pub fn check_condition(&self, condition: &Condition, location: &str) -> Result<()> {
        for reference in condition.expr().references() {
            let known = match reference {
                Reference::Parameter(name) => self.parameters.iter().any(|p| &p.name == name),
                Reference::Variable(name) => {
                    BUILTIN_VARIABLES.contains(&name.as_str())
                        || self.variables.iter().any(|(var, _)| var == name)
                }
            };
            if !known {
                return Err(Error::configuration(format!(
                    "condition of {} references unknown `{}`",
                    location, reference
                )));
            }
        }
        Ok(())
    }

    /// Build the snapshot for one run.
    pub fn resolve(
        &self,
        supplied: &BTreeMap<String, serde_json::Value>,
        trigger: &TriggerContext,
    ) -> Result<Snapshot> {
        if let Some(unknown) = supplied
            .keys()
            .find(|name| !self.parameters.iter().any(|p| &p.name == *name))
        {
            return Err(Error::configuration(format!(
                "parameter '{}' is not declared",
                unknown
            )));
        }

        let mut snapshot = Snapshot::default();
        for param in &self.parameters {
            let raw = supplied
                .get(&param.name)
                .or(param.default.as_ref())
                .ok_or_else(|| {
                    Error::configuration(format!(
                        "parameter '{}' has no default and was not supplied",
                        param.name
                    ))
                })?;
            snapshot
                .parameters
                .insert(param.name.clone(), coerce_parameter(param, raw)?);
        }

        snapshot.variables.extend(trigger.builtin_variables());
        for (name, source) in &self.variables {
            let value = match source {
                VariableSource::Literal(value) => value.clone(),
                VariableSource::Expr(expr) => expr.value(&snapshot).map_err(|e| {
                    Error::configuration(format!("variable '{}': {}", name, e))
                })?,
            };
            debug!(variable = %name, value = %value, "Resolved variable");
            snapshot.variables.insert(name.clone(), value);
        }

        Ok(snapshot)
    }
}

fn coerce_parameter(param: &ParameterDefinition, raw: &serde_json::Value) -> Result<Value> {
    let invalid = |expected: &str| {
        Error::configuration(format!(
            "parameter '{}' expects {}, got {}",
            param.name, expected, raw
        ))
    };
    match param.param_type {
        ParameterType::Boolean => match raw {
            serde_json::Value::Bool(b) => Ok(Value::Bool(*b)),
            serde_json::Value::String(s) if s.eq_ignore_ascii_case("true") => Ok(Value::Bool(true)),
            serde_json::Value::String(s) if s.eq_ignore_ascii_case("false") => {
                Ok(Value::Bool(false))
            }
            _ => Err(invalid("a boolean")),
        },
        ParameterType::String => match raw {
            serde_json::Value::Array(_) | serde_json::Value::Object(_) => Err(invalid("a string")),
            other => Ok(Value::from_json(other)),
        },
        ParameterType::Enum => {
            let text = match raw {
                serde_json::Value::String(s) => s.clone(),
                serde_json::Value::Number(n) => n.to_string(),
                _ => return Err(invalid("one of its declared values")),
            };
            if param.values.contains(&text) {
                Ok(Value::String(text))
            } else {
                Err(invalid(&format!("one of [{}]", param.values.join(", "))))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use foundry_core::snapshot::BuildReason;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn boolean(name: &str, default: Option<bool>) -> ParameterDefinition {
        ParameterDefinition {
            name: name.to_string(),
            display_name: None,
            param_type: ParameterType::Boolean,
            default: default.map(serde_json::Value::Bool),
            values: vec![],
        }
    }

    fn quality() -> ParameterDefinition {
        ParameterDefinition {
            name: "VSCODE_QUALITY".to_string(),
            display_name: None,
            param_type: ParameterType::Enum,
            default: Some(json!("insider")),
            values: vec!["exploration".into(), "insider".into(), "stable".into()],
        }
    }

    fn expr_var(name: &str, expr: &str) -> VariableDefinition {
        VariableDefinition {
            name: name.to_string(),
            value: None,
            expr: Some(expr.to_string()),
        }
    }

    fn trigger() -> TriggerContext {
        TriggerContext::new(BuildReason::Schedule, "main")
    }

    #[test]
    fn test_variables_follow_references_not_position() {
        let resolver = SnapshotResolver::new(
            &[boolean("VSCODE_PUBLISH", Some(true)), quality()],
            &[
                expr_var("VSCODE_RELEASE", "and(variables.VSCODE_SCHEDULED, eq(parameters.VSCODE_QUALITY, 'stable'))"),
                expr_var("VSCODE_SCHEDULED", "eq(variables['Build.Reason'], 'Schedule')"),
            ],
        )
        .unwrap();

        let snapshot = resolver
            .resolve(&BTreeMap::from([("VSCODE_QUALITY".to_string(), json!("stable"))]), &trigger())
            .unwrap();
        assert_eq!(snapshot.variable("VSCODE_SCHEDULED"), Some(&Value::Bool(true)));
        assert_eq!(snapshot.variable("VSCODE_RELEASE"), Some(&Value::Bool(true)));
        assert_eq!(snapshot.variable("Build.SourceBranchName"), Some(&Value::from("main")));
    }

    #[test]
    fn test_undeclared_parameter_reference_fails() {
        let err = SnapshotResolver::new(
            &[],
            &[expr_var("VSCODE_BUILD", "eq(parameters.VSCODE_MISSING, true)")],
        )
        .err()
        .unwrap();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("VSCODE_MISSING"));
    }

    #[test]
    fn test_variable_cycle_fails() {
        let err = SnapshotResolver::new(
            &[],
            &[
                expr_var("A", "variables.B"),
                expr_var("B", "not(variables.A)"),
            ],
        )
        .err()
        .unwrap();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_parameter_validation() {
        let resolver =
            SnapshotResolver::new(&[boolean("VSCODE_BUILD_WIN32", None), quality()], &[]).unwrap();

        let missing = resolver.resolve(&BTreeMap::new(), &trigger());
        assert!(missing.unwrap_err().is_configuration());

        let undeclared = resolver.resolve(
            &BTreeMap::from([
                ("VSCODE_BUILD_WIN32".to_string(), json!(true)),
                ("NOPE".to_string(), json!(true)),
            ]),
            &trigger(),
        );
        assert!(undeclared.unwrap_err().to_string().contains("NOPE"));

        let bad_enum = resolver.resolve(
            &BTreeMap::from([
                ("VSCODE_BUILD_WIN32".to_string(), json!("false")),
                ("VSCODE_QUALITY".to_string(), json!("nightly")),
            ]),
            &trigger(),
        );
        assert!(bad_enum.is_err());

        let ok = resolver
            .resolve(
                &BTreeMap::from([("VSCODE_BUILD_WIN32".to_string(), json!("False"))]),
                &trigger(),
            )
            .unwrap();
        assert_eq!(ok.parameter("VSCODE_BUILD_WIN32"), Some(&Value::Bool(false)));
        assert_eq!(ok.parameter("VSCODE_QUALITY"), Some(&Value::from("insider")));
    }

    #[test]
    fn test_check_condition() {
        let resolver = SnapshotResolver::new(
            &[boolean("VSCODE_BUILD_WEB", Some(false))],
            &[VariableDefinition {
                name: "VSCODE_CIBUILD".to_string(),
                value: Some(json!(false)),
                expr: None,
            }],
        )
        .unwrap();

        let good = Condition::parse(
            "and(parameters.VSCODE_BUILD_WEB, not(variables.VSCODE_CIBUILD), ne(variables['Build.Reason'], 'Manual'))",
        )
        .unwrap();
        assert!(resolver.check_condition(&good, "stage 'Web'").is_ok());

        let bad = Condition::parse("eq(variables.UNKNOWN, true)").unwrap();
        assert!(resolver.check_condition(&bad, "stage 'Web'").is_err());
    }

    #[test]
    fn test_builtin_cannot_be_redefined() {
        let result = SnapshotResolver::new(
            &[],
            &[VariableDefinition {
                name: "Build.Reason".to_string(),
                value: Some(json!("Manual")),
                expr: None,
            }],
        );
        assert!(result.is_err());
    }
}
