use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One intercepted outbound call, sent by the SDK while it blocks the
/// service's real dependency call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MockRequest {
    pub trace_id: String,
    pub package_name: String,
    #[serde(default)]
    pub submodule_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_hash: Option<String>,
    #[serde(default)]
    pub input_value: Value,
}

/// Reply to a mock lookup. `found: false` tells the SDK the dependency is
/// unpatched; it reports that back through its telemetry channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MockResponse {
    pub found: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl MockResponse {
    pub fn found(output_value: Value, span_id: impl Into<String>) -> Self {
        Self {
            found: true,
            output_value: Some(output_value),
            span_id: Some(span_id.into()),
            reason: None,
        }
    }

    pub fn miss(reason: impl Into<String>) -> Self {
        Self {
            found: false,
            output_value: None,
            span_id: None,
            reason: Some(reason.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_found_response_shape() {
        let response = MockResponse::found(json!({"status": 200}), "spn_1");
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["found"], json!(true));
        assert_eq!(value["span_id"], json!("spn_1"));
        assert!(value.get("reason").is_none());
    }

    #[test]
    fn test_miss_response_shape() {
        let response = MockResponse::miss("no recorded spans for redis.get");
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["found"], json!(false));
        assert!(value.get("output_value").is_none());
        assert!(value["reason"].as_str().unwrap().contains("redis.get"));
    }
}
