//! Cloud API client for the Tusk Drift replay driver
//!
//! JSON over HTTPS against the drift cloud. Every call retries 502/503/504
//! and transient transport failures with exponential backoff and full
//! jitter, and every sleep is cancellation-aware. Endpoints that page
//! (trace tests, pre-app spans) loop on the cursor until exhausted and
//! report progress through a caller-supplied observer.

pub mod retry;

use drift_trace::Span;
use drift_wire::cloud::{
    ApiFailure, CloudTraceTest, CreateDriftRunRequest, CreateDriftRunResponse,
    GetAllTraceTestsRequest, GetDriftRunTraceTestsRequest, GetPreAppStartSpansRequest,
    GetTraceTestRequest, PreAppSpanPage, RunStatus, TraceTestPage, UpdateCiStatusRequest,
    UploadTestResultRequest, DEFAULT_PAGE_SIZE,
};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

pub use retry::{retry_with_backoff, RetryConfig};

/// Transport timeout for one HTTP call.
pub const DEFAULT_TRANSPORT_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("no replay seat available for this service")]
    NoSeat,
    #[error("drift runs are paused for this service by label")]
    PausedByLabel,
    #[error("cloud API returned {status}: {message}")]
    Status { status: u16, message: String },
    #[error("cloud API transport error: {0}")]
    Transport(#[source] reqwest::Error),
    #[error("failed to decode cloud API response: {0}")]
    Decode(#[source] reqwest::Error),
    #[error("cancelled")]
    Cancelled,
}

impl ApiError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Status { status, .. } => matches!(status, 502 | 503 | 504),
            Self::Transport(err) => err.is_timeout() || err.is_connect() || err.is_request(),
            _ => false,
        }
    }
}

/// Progress callback for paginated fetches: `(fetched_so_far, total_if_known)`.
pub type ProgressFn<'a> = &'a mut dyn FnMut(usize, Option<u64>);

pub struct ApiClient {
    http: reqwest::Client,
    base_url: Url,
    api_key: String,
    retry: RetryConfig,
}

impl ApiClient {
    pub fn new(base_url: &str, api_key: impl Into<String>) -> anyhow::Result<Self> {
        Self::with_retry(base_url, api_key, RetryConfig::default())
    }

    pub fn with_retry(
        base_url: &str,
        api_key: impl Into<String>,
        retry: RetryConfig,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(DEFAULT_TRANSPORT_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            base_url: Url::parse(base_url)?,
            api_key: api_key.into(),
            retry,
        })
    }

    pub async fn create_drift_run(
        &self,
        request: &CreateDriftRunRequest,
        cancel: &CancellationToken,
    ) -> Result<CreateDriftRunResponse, ApiError> {
        self.post("api/drift-runs/create", request, cancel).await
    }

    pub async fn update_ci_status(
        &self,
        run_id: &str,
        status: RunStatus,
        message: Option<String>,
        cancel: &CancellationToken,
    ) -> Result<(), ApiError> {
        let request = UpdateCiStatusRequest {
            run_id: run_id.to_string(),
            status,
            message,
        };
        let _: serde_json::Value = self.post("api/drift-runs/ci-status", &request, cancel).await?;
        Ok(())
    }

    /// Fetch one cloud trace test, bypassing pagination.
    pub async fn get_trace_test(
        &self,
        test_id: &str,
        cancel: &CancellationToken,
    ) -> Result<CloudTraceTest, ApiError> {
        let request = GetTraceTestRequest {
            test_id: test_id.to_string(),
        };
        self.post("api/trace-tests/get", &request, cancel).await
    }

    /// Fetch the whole suite for a service, following cursors until the
    /// cloud reports no more pages.
    pub async fn get_all_trace_tests(
        &self,
        service_id: &str,
        cancel: &CancellationToken,
        progress: ProgressFn<'_>,
    ) -> Result<Vec<CloudTraceTest>, ApiError> {
        let mut tests = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let request = GetAllTraceTestsRequest {
                service_id: service_id.to_string(),
                cursor: cursor.clone(),
                page_size: DEFAULT_PAGE_SIZE,
            };
            let page: TraceTestPage = self.post("api/trace-tests/list", &request, cancel).await?;
            tests.extend(page.tests);
            progress(tests.len(), page.total);
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => return Ok(tests),
            }
        }
    }

    /// Fetch the tests selected for one drift run.
    pub async fn get_drift_run_trace_tests(
        &self,
        run_id: &str,
        cancel: &CancellationToken,
        progress: ProgressFn<'_>,
    ) -> Result<Vec<CloudTraceTest>, ApiError> {
        let mut tests = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let request = GetDriftRunTraceTestsRequest {
                run_id: run_id.to_string(),
                cursor: cursor.clone(),
                page_size: DEFAULT_PAGE_SIZE,
            };
            let page: TraceTestPage = self
                .post("api/drift-runs/trace-tests", &request, cancel)
                .await?;
            tests.extend(page.tests);
            progress(tests.len(), page.total);
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => return Ok(tests),
            }
        }
    }

    pub async fn get_pre_app_start_spans(
        &self,
        service_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<Span>, ApiError> {
        let mut spans = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let request = GetPreAppStartSpansRequest {
                service_id: service_id.to_string(),
                cursor: cursor.clone(),
                page_size: DEFAULT_PAGE_SIZE,
            };
            let page: PreAppSpanPage = self
                .post("api/pre-app-spans/list", &request, cancel)
                .await?;
            spans.extend(page.spans);
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => return Ok(spans),
            }
        }
    }

    /// Upload one completed test result. Called from the worker that
    /// produced it; the caller treats failures as log-and-continue.
    pub async fn upload_test_result(
        &self,
        request: &UploadTestResultRequest,
        cancel: &CancellationToken,
    ) -> Result<(), ApiError> {
        let _: serde_json::Value = self
            .post("api/drift-runs/test-results", request, cancel)
            .await?;
        Ok(())
    }

    async fn post<Req, Resp>(
        &self,
        path: &str,
        request: &Req,
        cancel: &CancellationToken,
    ) -> Result<Resp, ApiError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let url = self
            .base_url
            .join(path)
            .map_err(|err| ApiError::Status {
                status: 0,
                message: format!("invalid endpoint path {path}: {err}"),
            })?;

        retry_with_backoff(&self.retry, cancel, || {
            let url = url.clone();
            async move {
                debug!(%url, "cloud API call");
                let send = self
                    .http
                    .post(url)
                    .bearer_auth(&self.api_key)
                    .json(request)
                    .send();
                let response = tokio::select! {
                    _ = cancel.cancelled() => return Err(ApiError::Cancelled),
                    response = send => response.map_err(ApiError::Transport)?,
                };
                Self::parse_response(response).await
            }
        })
        .await
    }

    async fn parse_response<Resp: DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<Resp, ApiError> {
        let status = response.status();
        if status.is_success() {
            return response.json().await.map_err(ApiError::Decode);
        }

        let status_code = status.as_u16();
        let body = response.text().await.unwrap_or_default();
        if let Ok(failure) = serde_json::from_str::<ApiFailure>(&body) {
            match failure.code.as_str() {
                ApiFailure::NO_SEAT => return Err(ApiError::NoSeat),
                ApiFailure::PAUSED_BY_LABEL => return Err(ApiError::PausedByLabel),
                _ => {
                    return Err(ApiError::Status {
                        status: status_code,
                        message: format!("{}: {}", failure.code, failure.message),
                    })
                }
            }
        }

        if status == StatusCode::BAD_GATEWAY
            || status == StatusCode::SERVICE_UNAVAILABLE
            || status == StatusCode::GATEWAY_TIMEOUT
        {
            warn!(status = status_code, "cloud API temporarily unavailable");
        }
        Err(ApiError::Status {
            status: status_code,
            message: truncate(&body, 200),
        })
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        for status in [502, 503, 504] {
            assert!(ApiError::Status {
                status,
                message: String::new()
            }
            .is_retryable());
        }
        for status in [400, 401, 404, 500] {
            assert!(!ApiError::Status {
                status,
                message: String::new()
            }
            .is_retryable());
        }
        assert!(!ApiError::NoSeat.is_retryable());
        assert!(!ApiError::Cancelled.is_retryable());
    }

    #[test]
    fn test_truncate_bounds_error_bodies() {
        let long = "x".repeat(500);
        assert_eq!(truncate(&long, 200).len(), 203);
        assert_eq!(truncate("short", 200), "short");
        // Multi-byte characters never split mid-boundary.
        let emoji = "é".repeat(300);
        let truncated = truncate(&emoji, 201);
        assert!(truncated.ends_with("..."));
    }

    #[test]
    fn test_client_rejects_bad_base_url() {
        assert!(ApiClient::new("not a url", "key").is_err());
    }
}
