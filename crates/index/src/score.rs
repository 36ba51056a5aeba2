//! Similarity scoring between normalized input values
//!
//! Both values are flattened to `path -> leaf` maps. The score is the mean
//! per-path similarity over the union of paths: equal leaves score 1, string
//! leaves score their character-diff ratio, mismatched or missing leaves
//! score 0. Identical values short-circuit to 1.0. The default acceptance
//! threshold is 0.3 (`matching.threshold` in `tusk.toml`).

use serde_json::Value;
use similar::TextDiff;
use std::collections::BTreeMap;

/// Default minimum score for a mock match.
pub const DEFAULT_THRESHOLD: f64 = 0.3;

pub fn score(a: &Value, b: &Value) -> f64 {
    if a == b {
        return 1.0;
    }

    let mut left = BTreeMap::new();
    flatten(a, String::new(), &mut left);
    let mut right = BTreeMap::new();
    flatten(b, String::new(), &mut right);

    if left.is_empty() && right.is_empty() {
        return 1.0;
    }

    let paths: std::collections::BTreeSet<&String> = left.keys().chain(right.keys()).collect();
    let mut total = 0.0;
    for path in &paths {
        total += match (left.get(*path), right.get(*path)) {
            (Some(x), Some(y)) if x == y => 1.0,
            (Some(Leaf::Str(x)), Some(Leaf::Str(y))) => string_similarity(x, y),
            _ => 0.0,
        };
    }
    total / paths.len() as f64
}

fn string_similarity(a: &str, b: &str) -> f64 {
    TextDiff::from_chars(a, b).ratio() as f64
}

#[derive(Debug, PartialEq)]
enum Leaf {
    Str(String),
    Other(String),
}

fn flatten(value: &Value, prefix: String, out: &mut BTreeMap<String, Leaf>) {
    match value {
        Value::Object(map) => {
            for (key, inner) in map {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                flatten(inner, path, out);
            }
        }
        Value::Array(items) => {
            for (i, inner) in items.iter().enumerate() {
                flatten(inner, format!("{prefix}[{i}]"), out);
            }
        }
        Value::String(s) => {
            out.insert(prefix, Leaf::Str(s.clone()));
        }
        other => {
            out.insert(prefix, Leaf::Other(other.to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_identical_values_score_one() {
        let v = json!({"method": "GET", "target": "/orders"});
        assert_eq!(score(&v, &v), 1.0);
    }

    #[test]
    fn test_disjoint_values_score_zero() {
        let a = json!({"method": "GET"});
        let b = json!({"verb": "POST"});
        assert_eq!(score(&a, &b), 0.0);
    }

    #[test]
    fn test_partial_overlap_scores_between() {
        let a = json!({"method": "GET", "target": "/orders", "body": null});
        let b = json!({"method": "GET", "target": "/orders", "body": "x"});
        let s = score(&a, &b);
        assert!(s > 0.5 && s < 1.0, "got {s}");
    }

    #[test]
    fn test_similar_strings_get_partial_credit() {
        let a = json!({"sql": "SELECT * FROM products WHERE id = ?"});
        let b = json!({"sql": "SELECT * FROM products WHERE sku = ?"});
        let s = score(&a, &b);
        assert!(s > 0.7, "got {s}");
        let c = json!({"sql": "DROP TABLE events"});
        assert!(score(&a, &c) < s);
    }

    #[test]
    fn test_score_is_symmetric_enough_for_ordering() {
        let a = json!({"k": "abcdef"});
        let b = json!({"k": "abcdxx"});
        assert!((score(&a, &b) - score(&b, &a)).abs() < 1e-9);
    }
}
