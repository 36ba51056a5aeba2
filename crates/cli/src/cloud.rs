//! Cloud-backed trace store: fetch tests and pre-app spans, convert to the
//! local model

use crate::options::CloudOptions;
use anyhow::{Context, Result};
use drift_api_client::ApiClient;
use drift_replay::ProgressObserver;
use drift_trace::{LoadedSuite, Span, Test, TestOrigin};
use drift_wire::cloud::CloudTraceTest;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

pub fn client_for(options: &CloudOptions) -> Result<Arc<ApiClient>> {
    Ok(Arc::new(ApiClient::new(
        &options.api_url,
        options.api_key.clone(),
    )?))
}

/// Fetch the suite from the cloud. For a single-test run the rest of the
/// suite's spans are still fetched so cross-trace lookups can be served.
pub async fn load_suite(
    client: &ApiClient,
    options: &CloudOptions,
    run_id: Option<&str>,
    cancel: &CancellationToken,
    progress: &dyn ProgressObserver,
) -> Result<(LoadedSuite, Vec<Span>)> {
    let mut report = |current: usize, total: Option<u64>| {
        progress.update(current, total, "fetching trace tests");
    };

    let mut extra_suite_spans = Vec::new();
    let cloud_tests = if let Some(test_id) = &options.trace_test_id {
        let single = client
            .get_trace_test(test_id, cancel)
            .await
            .context("failed to fetch trace test")?;
        // Single-test runs still index the rest of the suite, so lookups
        // that recorded against sibling traces can be served.
        let rest = client
            .get_all_trace_tests(&options.service_id, cancel, &mut report)
            .await
            .context("failed to fetch suite spans")?;
        for test in rest {
            if test.trace_id != single.trace_id {
                extra_suite_spans.extend(test.spans.into_iter().filter(|s| !s.is_root_span));
            }
        }
        vec![single]
    } else if let Some(run_id) = run_id {
        client
            .get_drift_run_trace_tests(run_id, cancel, &mut report)
            .await
            .context("failed to fetch drift run trace tests")?
    } else {
        client
            .get_all_trace_tests(&options.service_id, cancel, &mut report)
            .await
            .context("failed to fetch trace tests")?
    };
    progress.clear();

    let pre_app_spans = client
        .get_pre_app_start_spans(&options.service_id, cancel)
        .await
        .context("failed to fetch pre-app spans")?;

    let mut suite = LoadedSuite {
        pre_app_spans,
        ..Default::default()
    };
    for cloud_test in cloud_tests {
        match convert(cloud_test) {
            Ok(test) => suite.tests.push(test),
            Err(err) => {
                warn!(error = %err, "skipping malformed cloud trace test");
                suite.warnings.push(err.to_string());
            }
        }
    }
    Ok((suite, extra_suite_spans))
}

fn convert(cloud_test: CloudTraceTest) -> Result<Test> {
    let mut root = None;
    let mut dependency_spans = Vec::new();
    for span in cloud_test.spans {
        if span.is_root_span && root.is_none() {
            root = Some(span);
        } else if !span.is_pre_app_start {
            dependency_spans.push(span);
        }
    }
    let root = root.with_context(|| {
        format!("cloud trace test {} has no root span", cloud_test.id)
    })?;
    Ok(Test::from_trace(
        cloud_test.trace_id,
        root,
        dependency_spans,
        TestOrigin::Cloud {
            test_id: cloud_test.id,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_convert_splits_root_and_dependencies() {
        let spans: Vec<Span> = vec![
            serde_json::from_value(json!({
                "trace_id": "trc_1",
                "span_id": "spn_root",
                "package_name": "http",
                "submodule_name": "GET",
                "is_root_span": true,
                "input_value": {"method": "GET", "target": "/x"},
                "output_value": {"status": 200},
                "timestamp": "2026-01-10T08:00:00Z"
            }))
            .unwrap(),
            serde_json::from_value(json!({
                "trace_id": "trc_1",
                "span_id": "spn_pg",
                "package_name": "pg",
                "submodule_name": "query",
                "input_value": {"sql": "SELECT 1"},
                "output_value": {"rows": []},
                "timestamp": "2026-01-10T08:00:01Z"
            }))
            .unwrap(),
        ];

        let test = convert(CloudTraceTest {
            id: "tt_1".to_string(),
            trace_id: "trc_1".to_string(),
            spans,
        })
        .unwrap();
        assert_eq!(test.root.span_id, "spn_root");
        assert_eq!(test.dependency_spans.len(), 1);
        assert_eq!(
            test.origin,
            TestOrigin::Cloud { test_id: "tt_1".to_string() }
        );
    }

    #[test]
    fn test_convert_without_root_fails() {
        let err = convert(CloudTraceTest {
            id: "tt_2".to_string(),
            trace_id: "trc_2".to_string(),
            spans: Vec::new(),
        })
        .unwrap_err();
        assert!(err.to_string().contains("no root span"));
    }
}
