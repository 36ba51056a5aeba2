//! Partition tests into groups sharing a compatible process environment
//!
//! Every `ENV_VARS` pre-app span records the environment a trace was
//! captured under. Tests whose requirements match exactly share a group and
//! therefore one service lifecycle; tests with no recorded requirements
//! collapse into the `default` group.

use drift_trace::{Span, Test};
use std::collections::BTreeMap;
use tracing::debug;

pub const DEFAULT_GROUP: &str = "default";

#[derive(Debug, Clone)]
pub struct EnvironmentGroup {
    pub name: String,
    pub env_vars: BTreeMap<String, String>,
    pub tests: Vec<Test>,
}

#[derive(Debug, Default)]
pub struct GroupingOutcome {
    pub groups: Vec<EnvironmentGroup>,
    pub warnings: Vec<String>,
}

/// Group `tests` by the env-var requirements recorded in `pre_app_spans`.
/// Zero tests produce zero groups; the caller short-circuits that as a
/// "no tests" success.
pub fn group_by_environment(tests: Vec<Test>, pre_app_spans: &[Span]) -> GroupingOutcome {
    if tests.is_empty() {
        return GroupingOutcome::default();
    }

    // trace_id -> recorded env requirements, merged across ENV_VARS spans.
    let mut env_by_trace: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
    for span in pre_app_spans {
        let Some(vars) = span.env_vars() else { continue };
        env_by_trace.entry(span.trace_id.clone()).or_default().extend(vars);
    }

    let mut by_env: BTreeMap<String, EnvironmentGroup> = BTreeMap::new();
    for mut test in tests {
        let env_vars = env_by_trace
            .get(&test.trace_id)
            .cloned()
            .unwrap_or_default();
        let name = group_name(&env_vars);
        test.environment_key = name.clone();
        by_env
            .entry(name.clone())
            .or_insert_with(|| EnvironmentGroup {
                name,
                env_vars,
                tests: Vec::new(),
            })
            .tests
            .push(test);
    }

    let mut groups: Vec<EnvironmentGroup> = by_env.into_values().collect();
    // Default group first, then lexical: a stable order the reporter and the
    // supervisor lifecycle both follow.
    groups.sort_by(|a, b| {
        (a.name != DEFAULT_GROUP, &a.name).cmp(&(b.name != DEFAULT_GROUP, &b.name))
    });

    let warnings = cross_group_warnings(&groups);
    debug!(groups = groups.len(), warnings = warnings.len(), "environment grouping done");
    GroupingOutcome { groups, warnings }
}

fn group_name(env_vars: &BTreeMap<String, String>) -> String {
    if env_vars.is_empty() {
        return DEFAULT_GROUP.to_string();
    }
    env_vars
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Flag suspicious near-matches between groups: a key present in one group
/// but absent from another otherwise-identical one, and value conflicts on
/// shared keys. Both groups are still produced.
fn cross_group_warnings(groups: &[EnvironmentGroup]) -> Vec<String> {
    let mut warnings = Vec::new();
    for (i, a) in groups.iter().enumerate() {
        for b in groups.iter().skip(i + 1) {
            if a.env_vars.is_empty() || b.env_vars.is_empty() {
                continue;
            }

            let shared_equal = a
                .env_vars
                .iter()
                .filter(|(k, v)| b.env_vars.get(*k) == Some(*v))
                .count();
            let conflicts: Vec<&String> = a
                .env_vars
                .iter()
                .filter(|(k, v)| b.env_vars.get(*k).is_some_and(|other| other != *v))
                .map(|(k, _)| k)
                .collect();

            if !conflicts.is_empty() && shared_equal + conflicts.len() == a.env_vars.len().max(b.env_vars.len()) {
                for key in conflicts {
                    warnings.push(format!(
                        "groups '{}' and '{}' disagree on {key}; running both environments",
                        a.name, b.name
                    ));
                }
                continue;
            }

            if conflicts.is_empty() {
                let missing_in_b: Vec<&String> = a
                    .env_vars
                    .keys()
                    .filter(|k| !b.env_vars.contains_key(*k))
                    .collect();
                let missing_in_a: Vec<&String> = b
                    .env_vars
                    .keys()
                    .filter(|k| !a.env_vars.contains_key(*k))
                    .collect();
                if shared_equal > 0 && (!missing_in_b.is_empty() || !missing_in_a.is_empty()) {
                    for key in missing_in_b {
                        warnings.push(format!(
                            "{key} is recorded for group '{}' but absent from '{}'",
                            a.name, b.name
                        ));
                    }
                    for key in missing_in_a {
                        warnings.push(format!(
                            "{key} is recorded for group '{}' but absent from '{}'",
                            b.name, a.name
                        ));
                    }
                }
            }
        }
    }
    warnings
}
