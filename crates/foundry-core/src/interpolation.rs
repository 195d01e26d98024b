//! Placeholder substitution.
//!
//! Two forms are supported:
//! - `${{ parameters.NAME }}` inside template bodies, substituted
//!   structurally when a template is instantiated
//! - `$(Name)` macros inside step commands, expanded from snapshot
//!   variables just before a step runs

use crate::expr::Value;
use regex::{Captures, Regex};
use std::collections::BTreeMap;
use std::sync::LazyLock;

static PARAMETER_PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{\{\s*parameters\.([A-Za-z_][A-Za-z0-9_\-]*)\s*\}\}")
        .expect("parameter placeholder pattern is valid")
});

static WHOLE_PARAMETER_PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*\$\{\{\s*parameters\.([A-Za-z_][A-Za-z0-9_\-]*)\s*\}\}\s*$")
        .expect("whole parameter placeholder pattern is valid")
});

static VARIABLE_MACRO: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\(([A-Za-z_][A-Za-z0-9_.\-]*)\)").expect("variable macro pattern is valid")
});

/// Substitute bound template parameters throughout a JSON tree.
///
/// A string that consists of a single placeholder is replaced by the bound
/// value itself, keeping its type. Placeholders embedded in longer strings
/// are replaced by the value's text. Names that are not bound are left
/// untouched so that run-level `parameters.*` references survive.
pub fn substitute_parameters(
    value: &serde_json::Value,
    bindings: &BTreeMap<String, serde_json::Value>,
) -> serde_json::Value {
    match value {
        serde_json::Value::String(text) => substitute_string(text, bindings),
        serde_json::Value::Array(items) => serde_json::Value::Array(
            items
                .iter()
                .map(|item| substitute_parameters(item, bindings))
                .collect(),
        ),
        serde_json::Value::Object(map) => serde_json::Value::Object(
            map.iter()
                .map(|(key, item)| (key.clone(), substitute_parameters(item, bindings)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn substitute_string(
    text: &str,
    bindings: &BTreeMap<String, serde_json::Value>,
) -> serde_json::Value {
    if let Some(caps) = WHOLE_PARAMETER_PLACEHOLDER.captures(text) {
        if let Some(bound) = bindings.get(&caps[1]) {
            return bound.clone();
        }
    }

    let replaced = PARAMETER_PLACEHOLDER.replace_all(text, |caps: &Captures| {
        match bindings.get(&caps[1]) {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => caps[0].to_string(),
        }
    });
    serde_json::Value::String(replaced.into_owned())
}

/// Parameter names referenced by `${{ parameters.NAME }}` placeholders.
pub fn placeholder_names(value: &serde_json::Value) -> Vec<String> {
    let mut names = Vec::new();
    collect_placeholders(value, &mut names);
    names.sort();
    names.dedup();
    names
}

fn collect_placeholders(value: &serde_json::Value, names: &mut Vec<String>) {
    match value {
        serde_json::Value::String(text) => {
            for caps in PARAMETER_PLACEHOLDER.captures_iter(text) {
                names.push(caps[1].to_string());
            }
        }
        serde_json::Value::Array(items) => {
            items.iter().for_each(|item| collect_placeholders(item, names))
        }
        serde_json::Value::Object(map) => {
            map.values().for_each(|item| collect_placeholders(item, names))
        }
        _ => {}
    }
}

/// Expand `$(Name)` macros from variables. Unknown names are left as-is.
pub fn expand_macros(text: &str, variables: &BTreeMap<String, Value>) -> String {
    VARIABLE_MACRO
        .replace_all(text, |caps: &Captures| match variables.get(&caps[1]) {
            Some(value) => value.to_string(),
            None => caps[0].to_string(),
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn bindings(pairs: &[(&str, serde_json::Value)]) -> BTreeMap<String, serde_json::Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_whole_value_keeps_type() {
        let body = json!({
            "name": "build_${{ parameters.arch }}",
            "continue_on_error": "${{ parameters.optional }}",
            "timeout_minutes": "${{ parameters.timeout }}",
        });
        let out = substitute_parameters(
            &body,
            &bindings(&[
                ("arch", json!("arm64")),
                ("optional", json!(true)),
                ("timeout", json!(90)),
            ]),
        );
        assert_eq!(
            out,
            json!({
                "name": "build_arm64",
                "continue_on_error": true,
                "timeout_minutes": 90,
            })
        );
    }

    #[test]
    fn test_unbound_names_survive() {
        let body = json!({ "condition": "${{ parameters.VSCODE_BUILD_WIN32 }}" });
        let out = substitute_parameters(&body, &bindings(&[("arch", json!("x64"))]));
        assert_eq!(out, body);
    }

    #[test]
    fn test_nested_arrays() {
        let body = json!([{ "run": "make ${{parameters.target}} && echo ${{ parameters.target }}" }]);
        let out = substitute_parameters(&body, &bindings(&[("target", json!("cli"))]));
        assert_eq!(out, json!([{ "run": "make cli && echo cli" }]));
    }

    #[test]
    fn test_placeholder_names() {
        let body = json!({ "a": "${{ parameters.x }}", "b": ["${{ parameters.y }}-${{ parameters.x }}"] });
        assert_eq!(placeholder_names(&body), vec!["x".to_string(), "y".to_string()]);
    }

    #[test]
    fn test_expand_macros() {
        let vars = BTreeMap::from([
            ("VSCODE_QUALITY".to_string(), Value::from("insider")),
            ("Build.SourceBranchName".to_string(), Value::from("main")),
        ]);
        assert_eq!(
            expand_macros("publish --quality $(VSCODE_QUALITY) --branch $(Build.SourceBranchName) $(Missing)", &vars),
            "publish --quality insider --branch main $(Missing)"
        );
    }
}
