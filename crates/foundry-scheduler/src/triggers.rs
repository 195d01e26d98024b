//! Trigger matching and schedule evaluation.

use crate::engine::RunRequest;
use chrono::{DateTime, Utc};
use cron::Schedule;
use foundry_core::pipeline::{BranchFilter, PipelineDefinition, ScheduleDefinition};
use foundry_core::snapshot::BuildReason;
use foundry_core::{Error, Result};
use globset::{Glob, GlobBuilder, GlobMatcher};
use regex::Regex;
use std::str::FromStr;
use std::sync::LazyLock;
use tracing::{debug, warn};

static NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d+").expect("number pattern is valid"));

fn short_ref(name: &str) -> &str {
    name.strip_prefix("refs/heads/").unwrap_or(name)
}

fn branch_glob(pattern: &str) -> std::result::Result<Glob, globset::Error> {
    GlobBuilder::new(short_ref(pattern))
        .literal_separator(true)
        .build()
}

fn branch_matcher(pattern: &str) -> Option<GlobMatcher> {
    match branch_glob(pattern) {
        Ok(glob) => Some(glob.compile_matcher()),
        Err(e) => {
            warn!(pattern, error = %e, "Invalid branch pattern, matching literally");
            None
        }
    }
}

/// Match a branch against a glob. `*` stays within one path segment, `**`
/// spans segments, and a lone `*` admits every branch.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern = short_ref(pattern);
    let text = short_ref(text);

    if pattern == "*" || pattern == "**" {
        return true;
    }
    match branch_matcher(pattern) {
        Some(matcher) => matcher.is_match(text),
        None => pattern == text,
    }
}

/// An empty include list admits every branch; exclusions always win.
pub fn branch_filter_matches(filter: &BranchFilter, branch: &str) -> bool {
    let included =
        filter.include.is_empty() || filter.include.iter().any(|p| glob_match(p, branch));
    included && !filter.exclude.iter().any(|p| glob_match(p, branch))
}

/// Whether a push to `branch` starts a CI run of the pipeline.
pub fn ci_matches(pipeline: &PipelineDefinition, branch: &str) -> bool {
    match &pipeline.trigger {
        Some(trigger) => branch_filter_matches(&trigger.branches, branch),
        None => true,
    }
}

/// The first schedule whose branch filter admits `branch`.
pub fn schedule_for<'a>(
    pipeline: &'a PipelineDefinition,
    branch: &str,
) -> Option<&'a ScheduleDefinition> {
    pipeline
        .schedules
        .iter()
        .find(|schedule| branch_filter_matches(&schedule.branches, branch))
}

/// Reject requests the pipeline's triggers do not admit.
///
/// CI runs must pass the CI branch filter. Scheduled runs must match a
/// schedule, whose parameter overrides fill in anything the request leaves
/// unset.
pub fn admit(pipeline: &PipelineDefinition, request: &mut RunRequest) -> Result<()> {
    let branch = request.trigger.branch_name().to_string();
    match request.trigger.reason {
        BuildReason::Manual => Ok(()),
        BuildReason::IndividualCi => {
            if ci_matches(pipeline, &branch) {
                Ok(())
            } else {
                Err(Error::configuration(format!(
                    "the CI trigger of '{}' does not include branch '{}'",
                    pipeline.name, branch
                )))
            }
        }
        BuildReason::Schedule => {
            let schedule = schedule_for(pipeline, &branch).ok_or_else(|| {
                Error::configuration(format!(
                    "no schedule of '{}' builds branch '{}'",
                    pipeline.name, branch
                ))
            })?;
            debug!(branch = %branch, cron = %schedule.cron, "Applying schedule parameters");
            for (name, value) in &schedule.parameters {
                request
                    .parameters
                    .entry(name.clone())
                    .or_insert_with(|| value.clone());
            }
            Ok(())
        }
    }
}

/// Check every branch pattern and cron expression of the pipeline.
pub fn validate(pipeline: &PipelineDefinition) -> Result<()> {
    let filters = pipeline
        .trigger
        .iter()
        .map(|t| &t.branches)
        .chain(pipeline.schedules.iter().map(|s| &s.branches));
    for filter in filters {
        for pattern in filter.include.iter().chain(&filter.exclude) {
            branch_glob(pattern).map_err(|e| {
                Error::configuration(format!("invalid branch pattern '{}': {}", pattern, e))
            })?;
        }
    }
    for schedule in &pipeline.schedules {
        parse_cron(&schedule.cron)?;
    }
    Ok(())
}

/// Parse a cron expression.
///
/// Five-field expressions are given a seconds field and their day-of-week
/// numbers (0 or 7 for Sunday) are moved to the 1-7 range the parser uses.
pub fn parse_cron(expression: &str) -> Result<Schedule> {
    let fields: Vec<&str> = expression.split_whitespace().collect();
    let normalized = if fields.len() == 5 {
        let dow = translate_day_of_week(fields[4]);
        format!("0 {} {} {} {} {}", fields[0], fields[1], fields[2], fields[3], dow)
    } else {
        fields.join(" ")
    };
    Schedule::from_str(&normalized)
        .map_err(|e| Error::configuration(format!("invalid cron '{}': {}", expression, e)))
}

fn translate_day_of_week(field: &str) -> String {
    let (days, step) = match field.split_once('/') {
        Some((days, step)) => (days, Some(step)),
        None => (field, None),
    };
    let days = NUMBER.replace_all(days, |caps: &regex::Captures| {
        let n: u32 = caps[0].parse().unwrap_or(0);
        (n % 7 + 1).to_string()
    });
    match step {
        Some(step) => format!("{}/{}", days, step),
        None => days.into_owned(),
    }
}

/// A future firing of a schedule.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleFiring {
    pub display_name: String,
    pub cron: String,
    pub at: DateTime<Utc>,
    pub branches: BranchFilter,
    /// Fires even when the branch has no new changes.
    pub always: bool,
}

impl ScheduleFiring {
    /// The candidate branches this firing would build.
    pub fn matching<'a>(&self, candidates: &'a [String]) -> Vec<&'a str> {
        candidates
            .iter()
            .map(String::as_str)
            .filter(|b| branch_filter_matches(&self.branches, b))
            .collect()
    }
}

/// The next `count` firings across all schedules, earliest first.
pub fn upcoming(
    schedules: &[ScheduleDefinition],
    after: DateTime<Utc>,
    count: usize,
) -> Result<Vec<ScheduleFiring>> {
    let mut firings = Vec::new();
    for definition in schedules {
        let schedule = parse_cron(&definition.cron)?;
        let display_name = definition
            .display_name
            .clone()
            .unwrap_or_else(|| definition.cron.clone());
        firings.extend(schedule.after(&after).take(count).map(|at| ScheduleFiring {
            display_name: display_name.clone(),
            cron: definition.cron.clone(),
            at,
            branches: definition.branches.clone(),
            always: definition.always,
        }));
    }
    firings.sort_by(|a, b| a.at.cmp(&b.at));
    firings.truncate(count);
    Ok(firings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, TimeZone, Timelike, Weekday};
    use foundry_core::snapshot::TriggerContext;
    use pretty_assertions::assert_eq;

    fn filter(include: &[&str], exclude: &[&str]) -> BranchFilter {
        BranchFilter {
            include: include.iter().map(|s| s.to_string()).collect(),
            exclude: exclude.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_branch_match_glob() {
        assert!(glob_match("main", "refs/heads/main"));
        assert!(glob_match("release/*", "release/1.90"));
        assert!(!glob_match("release/*", "release/1.90/hotfix"));
        assert!(glob_match("release/**", "release/1.90/hotfix"));
        assert!(glob_match("refs/heads/feature-*", "feature-x"));
        assert!(!glob_match("main", "develop"));
    }

    #[test]
    fn test_branch_match_multiple_wildcards() {
        assert!(glob_match("*release*", "my-release-1"));
        assert!(glob_match("release/*-insider-*", "release/1.90-insider-2"));
        assert!(!glob_match("release/*-insider-*", "release/1.90-stable"));
        assert!(!glob_match("*release*", "release/1.90"));
        assert!(glob_match("release/**/hotfix-*", "release/1.90/rc/hotfix-3"));
    }

    #[test]
    fn test_filter_exclusion_wins() {
        let f = filter(&["*"], &["release/*"]);
        assert!(branch_filter_matches(&f, "main"));
        assert!(!branch_filter_matches(&f, "release/1.90"));
        assert!(branch_filter_matches(&filter(&[], &[]), "anything"));
    }

    #[test]
    fn test_day_of_week_translation() {
        assert_eq!(translate_day_of_week("1-5"), "2-6");
        assert_eq!(translate_day_of_week("0,6"), "1,7");
        assert_eq!(translate_day_of_week("*/2"), "*/2");
        assert_eq!(translate_day_of_week("MON-FRI"), "MON-FRI");
    }

    #[test]
    fn test_weekday_schedule() {
        let schedules = vec![ScheduleDefinition {
            cron: "0 5 * * 1-5".to_string(),
            display_name: Some("Nightly".to_string()),
            branches: filter(&["main"], &[]),
            always: true,
            parameters: Default::default(),
        }];
        // Saturday.
        let after = Utc.with_ymd_and_hms(2026, 10, 17, 12, 0, 0).unwrap();
        let firings = upcoming(&schedules, after, 3).unwrap();

        assert_eq!(firings.len(), 3);
        assert_eq!(firings[0].at.weekday(), Weekday::Mon);
        assert_eq!(firings[0].at.hour(), 5);
        assert_eq!(firings[1].at.weekday(), Weekday::Tue);
        assert_eq!(firings[0].display_name, "Nightly");

        assert_eq!(upcoming(&schedules, after, 3).unwrap(), firings);

        let candidates = vec!["main".to_string(), "release/1.0".to_string()];
        assert_eq!(firings[0].matching(&candidates), vec!["main"]);
    }

    fn pipeline(yaml: &str) -> PipelineDefinition {
        serde_yaml::from_str(yaml).unwrap()
    }

    const TRIGGERED: &str = r#"
name: product
trigger:
  branches:
    include: [main, "release/*"]
    exclude: ["release/*-dropped"]
schedules:
  - cron: "0 5 * * 1-5"
    branches: { include: [main] }
    parameters: { quality: insider }
stages: []
"#;

    fn request(reason: BuildReason, branch: &str) -> RunRequest {
        RunRequest::new(TriggerContext::new(reason, branch))
    }

    #[test]
    fn test_ci_request_gated_by_branch_filter() {
        let definition = pipeline(TRIGGERED);

        assert!(admit(&definition, &mut request(BuildReason::IndividualCi, "release/1.90")).is_ok());
        let err = admit(
            &definition,
            &mut request(BuildReason::IndividualCi, "release/1.90-dropped"),
        )
        .unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("release/1.90-dropped"));
        assert!(admit(&definition, &mut request(BuildReason::Manual, "feature/x")).is_ok());
    }

    #[test]
    fn test_scheduled_request_takes_schedule_parameters() {
        let definition = pipeline(TRIGGERED);

        let mut scheduled = request(BuildReason::Schedule, "main");
        admit(&definition, &mut scheduled).unwrap();
        assert_eq!(scheduled.parameters["quality"], serde_json::json!("insider"));

        let mut explicit = request(BuildReason::Schedule, "main")
            .parameter("quality", serde_json::json!("stable"));
        admit(&definition, &mut explicit).unwrap();
        assert_eq!(explicit.parameters["quality"], serde_json::json!("stable"));

        let err = admit(&definition, &mut request(BuildReason::Schedule, "release/1.90"))
            .unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_validate_rejects_bad_patterns() {
        assert!(validate(&pipeline(TRIGGERED)).is_ok());

        let bad_glob = TRIGGERED.replace("\"release/*\"]", "\"release/[\"]");
        assert!(validate(&pipeline(&bad_glob)).unwrap_err().is_configuration());

        let bad_cron = TRIGGERED.replace("0 5 * * 1-5", "every weekday");
        assert!(validate(&pipeline(&bad_cron)).unwrap_err().is_configuration());
    }

    #[test]
    fn test_invalid_cron() {
        assert!(parse_cron("not a cron").unwrap_err().is_configuration());
        assert!(parse_cron("0 0 5 * * *").is_ok());
    }
}
