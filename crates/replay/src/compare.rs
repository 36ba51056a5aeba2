//! Compare a live response against the recorded one
//!
//! Both sides are normalized first (volatile headers, UUIDs, timestamps:
//! the same scrubbing mock matching uses), then walked structurally. Every
//! difference becomes a [`Deviation`] with a dotted field path; a deviation
//! is a first-class finding, not an error, and never aborts the run.

use drift_index::normalize::normalize_value;
use drift_mock_server::UnpatchedCall;
use drift_trace::{Deviation, DeviationKind, DeviationSeverity};
use serde_json::Value;

/// Upper bound on reported deviations per test; a completely different body
/// should read as one failure, not thousands of lines.
const MAX_DEVIATIONS: usize = 50;

pub fn compare_responses(recorded: &Value, live: &Value) -> Vec<Deviation> {
    let recorded = normalize_value(recorded);
    let live = normalize_value(live);
    let mut deviations = Vec::new();

    compare_status(&recorded, &live, &mut deviations);
    compare_headers(&recorded, &live, &mut deviations);

    let recorded_body = recorded.get("body").unwrap_or(&Value::Null);
    let live_body = live.get("body").unwrap_or(&Value::Null);
    diff_value(recorded_body, live_body, "body", &mut deviations);

    deviations.truncate(MAX_DEVIATIONS);
    deviations
}

/// Turn the mock server's per-trace miss log into deviations.
pub fn unpatched_deviations(calls: &[UnpatchedCall]) -> Vec<Deviation> {
    calls
        .iter()
        .map(|call| Deviation {
            kind: DeviationKind::UnpatchedDependency,
            field_path: format!("{}.{}", call.package_name, call.submodule_name),
            expected: Value::String("served from recording".to_string()),
            actual: Value::String(call.reason.clone()),
            severity: DeviationSeverity::High,
        })
        .collect()
}

fn compare_status(recorded: &Value, live: &Value, out: &mut Vec<Deviation>) {
    let recorded_status = recorded.get("status");
    let live_status = live.get("status");
    if let (Some(expected), Some(actual)) = (recorded_status, live_status) {
        if expected != actual {
            out.push(Deviation {
                kind: DeviationKind::Status,
                field_path: "status".to_string(),
                expected: expected.clone(),
                actual: actual.clone(),
                severity: DeviationSeverity::Critical,
            });
        }
    }
}

/// Headers the recording carries must match; extra live headers are noise
/// every proxy and framework adds and are ignored.
fn compare_headers(recorded: &Value, live: &Value, out: &mut Vec<Deviation>) {
    let Some(recorded_headers) = recorded.get("headers").and_then(Value::as_object) else {
        return;
    };
    let live_headers = live.get("headers").and_then(Value::as_object);

    for (name, expected) in recorded_headers {
        let actual = live_headers.and_then(|h| h.get(name));
        match actual {
            Some(actual) if actual == expected => {}
            Some(actual) => out.push(Deviation {
                kind: DeviationKind::Header,
                field_path: format!("headers.{name}"),
                expected: expected.clone(),
                actual: actual.clone(),
                severity: DeviationSeverity::Medium,
            }),
            None => out.push(Deviation {
                kind: DeviationKind::Header,
                field_path: format!("headers.{name}"),
                expected: expected.clone(),
                actual: Value::Null,
                severity: DeviationSeverity::Medium,
            }),
        }
    }
}

fn diff_value(expected: &Value, actual: &Value, path: &str, out: &mut Vec<Deviation>) {
    if out.len() >= MAX_DEVIATIONS {
        return;
    }
    match (expected, actual) {
        (Value::Object(exp), Value::Object(act)) => {
            for (key, exp_inner) in exp {
                let child = format!("{path}.{key}");
                match act.get(key) {
                    Some(act_inner) => diff_value(exp_inner, act_inner, &child, out),
                    None => push_body_deviation(out, &child, exp_inner.clone(), Value::Null, DeviationSeverity::High),
                }
            }
            for (key, act_inner) in act {
                if !exp.contains_key(key) {
                    let child = format!("{path}.{key}");
                    push_body_deviation(out, &child, Value::Null, act_inner.clone(), DeviationSeverity::Low);
                }
            }
        }
        (Value::Array(exp), Value::Array(act)) => {
            if exp.len() != act.len() {
                push_body_deviation(
                    out,
                    &format!("{path}.length"),
                    Value::from(exp.len()),
                    Value::from(act.len()),
                    DeviationSeverity::High,
                );
            }
            for (i, (exp_inner, act_inner)) in exp.iter().zip(act.iter()).enumerate() {
                diff_value(exp_inner, act_inner, &format!("{path}[{i}]"), out);
            }
        }
        (exp, act) if exp == act => {}
        (exp, act) => {
            push_body_deviation(out, path, exp.clone(), act.clone(), DeviationSeverity::High);
        }
    }
}

fn push_body_deviation(
    out: &mut Vec<Deviation>,
    path: &str,
    expected: Value,
    actual: Value,
    severity: DeviationSeverity,
) {
    if out.len() >= MAX_DEVIATIONS {
        return;
    }
    out.push(Deviation {
        kind: DeviationKind::Body,
        field_path: path.to_string(),
        expected,
        actual,
        severity,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_identical_responses_have_no_deviations() {
        let recorded = json!({"status": 200, "body": {"ok": true, "v": 1}});
        assert!(compare_responses(&recorded, &recorded).is_empty());
    }

    #[test]
    fn test_body_field_deviation() {
        let recorded = json!({"status": 200, "body": {"ok": true, "v": 1}});
        let live = json!({"status": 200, "body": {"ok": true, "v": 2}});

        let deviations = compare_responses(&recorded, &live);
        assert_eq!(deviations.len(), 1);
        assert_eq!(deviations[0].kind, DeviationKind::Body);
        assert_eq!(deviations[0].field_path, "body.v");
        assert_eq!(deviations[0].expected, json!(1));
        assert_eq!(deviations[0].actual, json!(2));
    }

    #[test]
    fn test_status_deviation_is_critical() {
        let recorded = json!({"status": 201, "body": null});
        let live = json!({"status": 500, "body": null});

        let deviations = compare_responses(&recorded, &live);
        assert_eq!(deviations.len(), 1);
        assert_eq!(deviations[0].kind, DeviationKind::Status);
        assert_eq!(deviations[0].severity, DeviationSeverity::Critical);
    }

    #[test]
    fn test_volatile_fields_ignored() {
        let recorded = json!({
            "status": 200,
            "headers": {"Date": "Mon, 01 Jan 2026 00:00:00 GMT", "content-type": "application/json"},
            "body": {"id": "7c9e6679-7425-40de-944b-e07fc1f90ae7", "created_at": "2026-01-01T00:00:00Z"}
        });
        let live = json!({
            "status": 200,
            "headers": {"date": "Sat, 01 Aug 2026 10:00:00 GMT", "content-type": "application/json"},
            "body": {"id": "11111111-2222-3333-4444-555555555555", "created_at": "2026-08-01T10:00:00Z"}
        });
        assert!(compare_responses(&recorded, &live).is_empty());
    }

    #[test]
    fn test_missing_recorded_header_flagged_extra_live_ignored() {
        let recorded = json!({"status": 200, "headers": {"x-api-version": "3"}, "body": null});
        let live = json!({"status": 200, "headers": {"server": "nginx"}, "body": null});

        let deviations = compare_responses(&recorded, &live);
        assert_eq!(deviations.len(), 1);
        assert_eq!(deviations[0].field_path, "headers.x-api-version");
        assert_eq!(deviations[0].actual, Value::Null);
    }

    #[test]
    fn test_array_length_and_element_diffs() {
        let recorded = json!({"status": 200, "body": {"rows": [{"id": 1}, {"id": 2}]}});
        let live = json!({"status": 200, "body": {"rows": [{"id": 1}]}});

        let deviations = compare_responses(&recorded, &live);
        assert_eq!(deviations.len(), 1);
        assert_eq!(deviations[0].field_path, "body.rows.length");
    }

    #[test]
    fn test_deviation_cap() {
        let recorded = json!({
            "status": 200,
            "body": (0..200).map(|i| (format!("k{i}"), json!(i))).collect::<serde_json::Map<_, _>>()
        });
        let live = json!({"status": 200, "body": {}});
        assert_eq!(compare_responses(&recorded, &live).len(), MAX_DEVIATIONS);
    }

    #[test]
    fn test_unpatched_deviations_shape() {
        let calls = vec![UnpatchedCall {
            package_name: "redis".to_string(),
            submodule_name: "get".to_string(),
            reason: "no recorded spans for redis.get".to_string(),
        }];
        let deviations = unpatched_deviations(&calls);
        assert_eq!(deviations.len(), 1);
        assert_eq!(deviations[0].kind, DeviationKind::UnpatchedDependency);
        assert_eq!(deviations[0].field_path, "redis.get");
    }
}
