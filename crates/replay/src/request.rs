//! Root request reconstruction and loopback dispatch
//!
//! The recorded root span's `input_value` carries method, target, headers,
//! query, and body. Replay reissues exactly that request against the
//! service's loopback port; the live response is captured in the same
//! `{status, headers, body}` shape as the recorded `output_value` so the
//! comparison walks one structure.

use anyhow::{anyhow, Context, Result};
use drift_trace::Span;
use serde_json::{Map, Value};
use std::collections::HashMap;
use url::Url;

#[derive(Debug, Clone)]
pub struct RootRequest {
    pub method: String,
    pub url: Url,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
}

/// Build the root request from a recorded root span.
pub fn reconstruct_root_request(root: &Span, service_port: u16) -> Result<RootRequest> {
    let method = root
        .method()
        .ok_or_else(|| anyhow!("root span records no HTTP method"))?
        .to_uppercase();
    let target = root
        .path()
        .ok_or_else(|| anyhow!("root span records no request target"))?;

    let mut url = Url::parse(&format!("http://127.0.0.1:{service_port}/"))
        .context("failed to build loopback base url")?;
    url = url
        .join(target.trim_start_matches('/'))
        .with_context(|| format!("recorded target {target:?} is not a valid path"))?;

    if let Some(query) = root.input_value.get("query").and_then(Value::as_object) {
        if url.query().is_none() && !query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in query {
                match value.as_str() {
                    Some(v) => pairs.append_pair(key, v),
                    None => pairs.append_pair(key, &value.to_string()),
                };
            }
        }
    }

    let mut headers = Vec::new();
    if let Some(recorded) = root.input_value.get("headers").and_then(Value::as_object) {
        for (name, value) in recorded {
            if is_skipped_request_header(name) {
                continue;
            }
            match value.as_str() {
                Some(v) => headers.push((name.clone(), v.to_string())),
                None => headers.push((name.clone(), value.to_string())),
            }
        }
    }

    let body = match root.input_value.get("body") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone().into_bytes()),
        Some(other) => {
            if !headers
                .iter()
                .any(|(name, _)| name.eq_ignore_ascii_case("content-type"))
            {
                headers.push(("content-type".to_string(), "application/json".to_string()));
            }
            Some(serde_json::to_vec(other)?)
        }
    };

    Ok(RootRequest {
        method,
        url,
        headers,
        body,
    })
}

/// Headers the transport owns during replay.
fn is_skipped_request_header(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "host" | "content-length" | "connection" | "transfer-encoding"
    )
}

/// Issue the request and capture the response as a comparable value.
pub async fn issue(client: &reqwest::Client, request: &RootRequest) -> Result<Value> {
    let method = reqwest::Method::from_bytes(request.method.as_bytes())
        .with_context(|| format!("invalid HTTP method {:?}", request.method))?;

    let mut builder = client.request(method, request.url.clone());
    for (name, value) in &request.headers {
        builder = builder.header(name, value);
    }
    if let Some(body) = &request.body {
        builder = builder.body(body.clone());
    }

    let response = builder
        .send()
        .await
        .with_context(|| format!("request to {} failed", request.url))?;

    let status = response.status().as_u16();
    let mut headers = Map::new();
    for (name, value) in response.headers() {
        let entry = headers
            .entry(name.as_str().to_ascii_lowercase())
            .or_insert_with(|| Value::String(String::new()));
        let rendered = value.to_str().unwrap_or("<binary>");
        match entry {
            Value::String(existing) if existing.is_empty() => *existing = rendered.to_string(),
            Value::String(existing) => {
                existing.push_str(", ");
                existing.push_str(rendered);
            }
            _ => {}
        }
    }

    let bytes = response.bytes().await.context("failed to read response body")?;
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
    };

    Ok(serde_json::json!({
        "status": status,
        "headers": Value::Object(headers),
        "body": body,
    }))
}

/// The environment the supervisor hands the service so the in-process SDK
/// replays instead of recording and can reach the mock server.
pub fn replay_env(
    mock_host: &str,
    mock_port: u16,
    group_env: &std::collections::BTreeMap<String, String>,
) -> HashMap<String, String> {
    let group: HashMap<String, String> = group_env
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    // Fixed replay-mode indicators win over anything the recording carried.
    let fixed: HashMap<String, String> = [
        (
            drift_common::DRIFT_MODE_ENV.to_string(),
            drift_common::DRIFT_MODE_REPLAY.to_string(),
        ),
        (drift_common::MOCK_HOST_ENV.to_string(), mock_host.to_string()),
        (drift_common::MOCK_PORT_ENV.to_string(), mock_port.to_string()),
    ]
    .into_iter()
    .collect();
    drift_common::merge_env(&[&group, &fixed])
}
