use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Package name under which the SDK records the environment variables a
/// trace was captured with. These spans drive environment grouping.
pub const ENV_VARS_PACKAGE: &str = "ENV_VARS";

/// One recorded operation: the inbound request itself (`is_root_span`) or an
/// outbound call the service made while handling it.
///
/// Spans are immutable once loaded. Deserialization tolerates unknown fields
/// so newer SDKs can add attributes without breaking older drivers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Span {
    pub trace_id: String,
    pub span_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<String>,
    pub package_name: String,
    #[serde(default)]
    pub submodule_name: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub is_root_span: bool,
    #[serde(default)]
    pub is_pre_app_start: bool,
    #[serde(default)]
    pub input_value: Value,
    #[serde(default)]
    pub output_value: Value,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_hash: Option<String>,
}

impl Span {
    /// Globally unique identity within a run.
    pub fn identity(&self) -> (&str, &str) {
        (&self.trace_id, &self.span_id)
    }

    pub fn is_env_vars(&self) -> bool {
        self.package_name == ENV_VARS_PACKAGE
    }

    /// HTTP method of a root span, when recorded.
    pub fn method(&self) -> Option<&str> {
        self.input_value.get("method").and_then(Value::as_str)
    }

    /// Request target of a root span. Recorders have used both `target` and
    /// `path` for this field.
    pub fn path(&self) -> Option<&str> {
        self.input_value
            .get("target")
            .or_else(|| self.input_value.get("path"))
            .and_then(Value::as_str)
    }

    /// Response status of a root span, when recorded.
    pub fn status(&self) -> Option<u16> {
        self.output_value
            .get("status")
            .and_then(Value::as_u64)
            .and_then(|s| u16::try_from(s).ok())
    }

    /// The `{key: value}` map recorded by an ENV_VARS pre-app span.
    pub fn env_vars(&self) -> Option<std::collections::BTreeMap<String, String>> {
        if !self.is_env_vars() {
            return None;
        }
        let obj = self.output_value.as_object()?;
        let mut vars = std::collections::BTreeMap::new();
        for (key, value) in obj {
            match value.as_str() {
                Some(v) => {
                    vars.insert(key.clone(), v.to_string());
                }
                None => {
                    vars.insert(key.clone(), value.to_string());
                }
            }
        }
        Some(vars)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn span_json() -> String {
        json!({
            "trace_id": "trc_1",
            "span_id": "spn_1",
            "package_name": "http",
            "submodule_name": "GET",
            "name": "GET /health",
            "is_root_span": true,
            "input_value": {"method": "GET", "target": "/health"},
            "output_value": {"status": 200},
            "timestamp": "2026-01-10T08:00:00Z",
            "duration_ms": 12,
            "future_field_from_newer_sdk": {"ignored": true}
        })
        .to_string()
    }

    #[test]
    fn test_unknown_fields_tolerated() {
        let span: Span = serde_json::from_str(&span_json()).unwrap();
        assert_eq!(span.method(), Some("GET"));
        assert_eq!(span.path(), Some("/health"));
        assert_eq!(span.status(), Some(200));
        assert!(span.is_root_span);
        assert!(!span.is_pre_app_start);
    }

    #[test]
    fn test_env_vars_extraction() {
        let span: Span = serde_json::from_value(json!({
            "trace_id": "trc_1",
            "span_id": "spn_env",
            "package_name": "ENV_VARS",
            "is_pre_app_start": true,
            "output_value": {"FEATURE_X": "1", "REGION": "us"},
            "timestamp": "2026-01-10T08:00:00Z"
        }))
        .unwrap();

        let vars = span.env_vars().unwrap();
        assert_eq!(vars.get("FEATURE_X").map(String::as_str), Some("1"));
        assert_eq!(vars.get("REGION").map(String::as_str), Some("us"));
    }

    #[test]
    fn test_env_vars_on_other_packages_is_none() {
        let span: Span = serde_json::from_value(json!({
            "trace_id": "trc_1",
            "span_id": "spn_pg",
            "package_name": "pg",
            "output_value": {"rows": []},
            "timestamp": "2026-01-10T08:00:00Z"
        }))
        .unwrap();
        assert!(span.env_vars().is_none());
    }
}
