//! Cloud API payload shapes
//!
//! The driver talks to the cloud over HTTPS with JSON bodies; the HTTP
//! content-length is the frame. Typed failure codes ride in [`ApiFailure`].

use drift_common::ci::CiMetadata;
use drift_trace::{Span, TestResult};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PAGE_SIZE: u32 = 25;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateDriftRunRequest {
    pub service_id: String,
    pub cli_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_sha: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_number: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_check_run_id: Option<String>,
}

impl CreateDriftRunRequest {
    pub fn new(service_id: impl Into<String>, cli_version: impl Into<String>, ci: &CiMetadata) -> Self {
        Self {
            service_id: service_id.into(),
            cli_version: cli_version.into(),
            provider: ci.provider.map(|p| p.as_str().to_string()),
            commit_sha: ci.commit_sha.clone(),
            branch: ci.branch.clone(),
            pr_number: ci.pr_number,
            external_check_run_id: ci.external_check_run_id.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateDriftRunResponse {
    pub run_id: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Success,
    Failure,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateCiStatusRequest {
    pub run_id: String,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetAllTraceTestsRequest {
    pub service_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
    pub page_size: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetDriftRunTraceTestsRequest {
    pub run_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
    pub page_size: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetTraceTestRequest {
    pub test_id: String,
}

/// One cloud-managed trace test: the recorded spans travel with it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudTraceTest {
    pub id: String,
    pub trace_id: String,
    pub spans: Vec<Span>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceTestPage {
    pub tests: Vec<CloudTraceTest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
    #[serde(default)]
    pub total: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetPreAppStartSpansRequest {
    pub service_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
    pub page_size: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreAppSpanPage {
    pub spans: Vec<Span>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadTestResultRequest {
    pub run_id: String,
    pub display_name: String,
    pub result: TestResult,
}

/// Error body returned by the cloud on non-2xx responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiFailure {
    pub code: String,
    pub message: String,
}

impl ApiFailure {
    pub const NO_SEAT: &'static str = "NO_SEAT";
    pub const PAUSED_BY_LABEL: &'static str = "PAUSED_BY_LABEL";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_status_wire_casing() {
        assert_eq!(serde_json::to_string(&RunStatus::Success).unwrap(), "\"SUCCESS\"");
        assert_eq!(serde_json::to_string(&RunStatus::Failure).unwrap(), "\"FAILURE\"");
    }

    #[test]
    fn test_page_tolerates_missing_cursor() {
        let page: TraceTestPage = serde_json::from_str("{\"tests\": []}").unwrap();
        assert!(page.next_cursor.is_none());
        assert!(page.tests.is_empty());
    }
}
