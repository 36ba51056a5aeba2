//! Input normalization: strip per-run noise before matching or comparing
//!
//! Recorded and live payloads differ in ways that carry no signal: volatile
//! headers, generated UUIDs, timestamps, SQL parameter placeholders. Both
//! mock matching and response comparison run on the normalized shape.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};

/// Header names whose values change across runs.
pub const VOLATILE_HEADERS: &[&str] = &[
    "date",
    "authorization",
    "cookie",
    "set-cookie",
    "x-request-id",
    "request-id",
    "traceparent",
    "tracestate",
    "x-amzn-trace-id",
    "etag",
    "age",
];

pub fn is_volatile_header(name: &str) -> bool {
    let lowered = name.to_ascii_lowercase();
    VOLATILE_HEADERS.contains(&lowered.as_str())
}

static UUID_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}")
        .expect("uuid regex")
});

static RFC3339_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\d{4}-\d{2}-\d{2}[Tt ]\d{2}:\d{2}:\d{2}(\.\d+)?([Zz]|[+-]\d{2}:?\d{2})?")
        .expect("timestamp regex")
});

static EPOCH_MS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b1[0-9]{12}\b").expect("epoch regex"));

static SQL_PARAM_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\d+|:[A-Za-z_][A-Za-z0-9_]*|\?").expect("sql param regex"));

static WHITESPACE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("whitespace regex"));

/// Normalize one structured input/output value.
pub fn normalize_value(value: &Value) -> Value {
    normalize_inner(value, false)
}

fn normalize_inner(value: &Value, under_sql_key: bool) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (key, inner) in map {
                let lowered = key.to_ascii_lowercase();
                if lowered == "headers" {
                    out.insert(lowered, normalize_headers(inner));
                    continue;
                }
                // Body keys keep their case; only header names are folded.
                let sql_key = matches!(lowered.as_str(), "sql" | "query" | "statement" | "text");
                out.insert(key.clone(), normalize_inner(inner, sql_key));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| normalize_inner(item, under_sql_key))
                .collect(),
        ),
        Value::String(s) if under_sql_key => Value::String(normalize_sql(s)),
        Value::String(s) => Value::String(scrub_string(s)),
        other => other.clone(),
    }
}

fn normalize_headers(headers: &Value) -> Value {
    match headers {
        Value::Object(map) => {
            let mut out = Map::new();
            for (key, value) in map {
                if is_volatile_header(key) {
                    continue;
                }
                out.insert(
                    key.to_ascii_lowercase(),
                    normalize_inner(value, false),
                );
            }
            Value::Object(out)
        }
        other => normalize_inner(other, false),
    }
}

fn scrub_string(s: &str) -> String {
    let scrubbed = UUID_RE.replace_all(s, "<uuid>");
    let scrubbed = RFC3339_RE.replace_all(&scrubbed, "<timestamp>");
    EPOCH_MS_RE.replace_all(&scrubbed, "<timestamp>").into_owned()
}

/// Collapse whitespace and unify parameter placeholders so `$1`, `?`, and
/// `:id` styles all compare equal.
pub fn normalize_sql(sql: &str) -> String {
    let collapsed = WHITESPACE_RE.replace_all(sql.trim(), " ");
    SQL_PARAM_RE.replace_all(&collapsed, "?").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_volatile_headers_dropped_and_keys_lowercased() {
        let normalized = normalize_value(&json!({
            "method": "GET",
            "Headers": {
                "Date": "Tue, 10 Jan 2026 08:00:00 GMT",
                "Authorization": "Bearer abc",
                "Content-Type": "application/json"
            }
        }));
        let headers = normalized.get("headers").unwrap().as_object().unwrap();
        assert!(!headers.contains_key("date"));
        assert!(!headers.contains_key("authorization"));
        assert_eq!(
            headers.get("content-type").and_then(Value::as_str),
            Some("application/json")
        );
    }

    #[test]
    fn test_uuids_and_timestamps_scrubbed() {
        let normalized = normalize_value(&json!({
            "body": "order 7c9e6679-7425-40de-944b-e07fc1f90ae7 at 2026-01-10T08:00:00Z"
        }));
        assert_eq!(
            normalized.get("body").and_then(Value::as_str),
            Some("order <uuid> at <timestamp>")
        );
    }

    #[test]
    fn test_epoch_millis_scrubbed() {
        let normalized = normalize_value(&json!({"body": "ts=1767945600000 ok"}));
        assert_eq!(
            normalized.get("body").and_then(Value::as_str),
            Some("ts=<timestamp> ok")
        );
    }

    #[test]
    fn test_sql_placeholders_unified() {
        assert_eq!(
            normalize_sql("SELECT *\n  FROM products\n  WHERE id = $1"),
            "SELECT * FROM products WHERE id = ?"
        );
        assert_eq!(
            normalize_sql("SELECT * FROM products WHERE id = :id"),
            "SELECT * FROM products WHERE id = ?"
        );
        assert_eq!(
            normalize_sql("SELECT * FROM products WHERE id = ?"),
            "SELECT * FROM products WHERE id = ?"
        );
    }

    #[test]
    fn test_sql_values_normalized_under_sql_keys() {
        let a = normalize_value(&json!({"sql": "SELECT 1   FROM t WHERE x=$1"}));
        let b = normalize_value(&json!({"sql": "SELECT 1 FROM t WHERE x=?"}));
        assert_eq!(a, b);
    }
}
