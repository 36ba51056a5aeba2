use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Outcome of replaying one test.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TestResult {
    pub trace_id: String,
    pub passed: bool,
    pub deviations: Vec<Deviation>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub environment: String,
}

impl TestResult {
    pub fn passed(trace_id: impl Into<String>, environment: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            trace_id: trace_id.into(),
            passed: true,
            deviations: Vec::new(),
            duration_ms,
            error: None,
            environment: environment.into(),
        }
    }

    pub fn failed(
        trace_id: impl Into<String>,
        environment: impl Into<String>,
        duration_ms: u64,
        error: impl Into<String>,
    ) -> Self {
        Self {
            trace_id: trace_id.into(),
            passed: false,
            deviations: Vec::new(),
            duration_ms,
            error: Some(error.into()),
            environment: environment.into(),
        }
    }

    pub fn with_deviations(mut self, deviations: Vec<Deviation>) -> Self {
        if !deviations.is_empty() {
            self.passed = false;
        }
        self.deviations = deviations;
        self
    }
}

/// A structurally meaningful difference between the recorded and replayed
/// response, ignoring fields deemed volatile.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Deviation {
    pub kind: DeviationKind,
    /// Dotted path into the response, e.g. `body.v` or `status`.
    pub field_path: String,
    pub expected: Value,
    pub actual: Value,
    pub severity: DeviationSeverity,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeviationKind {
    Status,
    Header,
    Body,
    UnpatchedDependency,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum DeviationSeverity {
    Low,
    Medium,
    High,
    Critical,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_deviations_flip_passed() {
        let result = TestResult::passed("trc_1", "default", 10).with_deviations(vec![Deviation {
            kind: DeviationKind::Body,
            field_path: "body.v".to_string(),
            expected: json!(1),
            actual: json!(2),
            severity: DeviationSeverity::High,
        }]);
        assert!(!result.passed);
        assert_eq!(result.deviations.len(), 1);
    }

    #[test]
    fn test_result_serde_round_trip() {
        let result = TestResult::failed("trc_1", "default", 30_000, "cancelled");
        let json = serde_json::to_string(&result).unwrap();
        let back: TestResult = serde_json::from_str(&json).unwrap();
        assert_eq!(back, result);
        // Re-serializing is byte-stable.
        assert_eq!(serde_json::to_string(&back).unwrap(), json);
    }
}
