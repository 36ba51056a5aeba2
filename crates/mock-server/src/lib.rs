//! IPC mock server the SDK queries for each intercepted outbound call
//!
//! One length-prefixed request/response pair per interaction. Connections
//! are handled concurrently; requests on one connection are handled in
//! arrival order, which preserves per-trace ordering because the SDK
//! serializes requests within a trace. The server never exits on a client
//! error: malformed frames and handler panics both degrade to misses.

use anyhow::{Context, Result};
use drift_index::{MatchOutcome, MatchQuery, SpanIndex};
use drift_wire::{decode_frame, encode_frame, frame_codec, MockRequest, MockResponse};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A mock lookup that found no recorded span. Drained per trace after the
/// test completes and reported as an `unpatched_dependency` deviation.
#[derive(Debug, Clone)]
pub struct UnpatchedCall {
    pub package_name: String,
    pub submodule_name: String,
    pub reason: String,
}

#[derive(Default)]
struct MissLog {
    by_trace: HashMap<String, Vec<UnpatchedCall>>,
}

pub struct MockServer {
    index: Arc<SpanIndex>,
    misses: Arc<Mutex<MissLog>>,
    cancel: CancellationToken,
    local_addr: SocketAddr,
    accept_task: JoinHandle<()>,
}

impl MockServer {
    /// Bind and start serving. Must be up before the supervisor starts the
    /// service: the SDK connects during pre-app init.
    pub async fn bind(
        addr: SocketAddr,
        index: Arc<SpanIndex>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind mock server on {addr}"))?;
        let local_addr = listener.local_addr().unwrap_or(addr);
        info!(address = %local_addr, "mock server listening");

        let misses = Arc::new(Mutex::new(MissLog::default()));
        let accept_task = tokio::spawn(accept_loop(
            listener,
            index.clone(),
            misses.clone(),
            cancel.clone(),
        ));

        Ok(Self {
            index,
            misses,
            cancel,
            local_addr,
            accept_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Unpatched calls recorded so far for a trace, without draining them.
    /// The executor reads these while building the test's deviations, before
    /// the post-callback cleanup.
    pub fn unpatched_calls(&self, trace_id: &str) -> Vec<UnpatchedCall> {
        self.misses
            .lock()
            .by_trace
            .get(trace_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Release per-trace state after a test: the index's MatchContext and
    /// the recorded unpatched calls, which are returned to the caller.
    pub fn cleanup_trace(&self, trace_id: &str) -> Vec<UnpatchedCall> {
        self.index.reset_trace(trace_id);
        self.misses
            .lock()
            .by_trace
            .remove(trace_id)
            .unwrap_or_default()
    }

    /// Stop accepting, drain in-flight connections, and return.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(err) = self.accept_task.await {
            warn!("mock server accept loop panicked: {err}");
        }
        info!("mock server shut down");
    }
}

async fn accept_loop(
    listener: TcpListener,
    index: Arc<SpanIndex>,
    misses: Arc<Mutex<MissLog>>,
    cancel: CancellationToken,
) {
    let mut sessions: JoinSet<()> = JoinSet::new();
    let mut counter: u64 = 0;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("mock server accept loop shutting down");
                break;
            }
            maybe_res = sessions.join_next(), if !sessions.is_empty() => {
                if let Some(Err(join_err)) = maybe_res {
                    warn!("mock connection task panicked: {join_err}");
                }
            }
            accept_res = listener.accept() => {
                match accept_res {
                    Ok((stream, peer)) => {
                        counter = counter.wrapping_add(1);
                        let index = index.clone();
                        let misses = misses.clone();
                        let cancel = cancel.clone();
                        sessions.spawn(async move {
                            if let Err(err) = serve_connection(stream, index, misses, cancel, counter).await {
                                warn!(peer = %peer, error = %err, "mock connection ended with error");
                            }
                        });
                    }
                    Err(err) => {
                        warn!(error = %err, "failed to accept mock connection");
                        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
                    }
                }
            }
        }
    }

    while let Some(res) = sessions.join_next().await {
        if let Err(join_err) = res {
            warn!("mock connection task panicked: {join_err}");
        }
    }
}

async fn serve_connection(
    stream: TcpStream,
    index: Arc<SpanIndex>,
    misses: Arc<Mutex<MissLog>>,
    cancel: CancellationToken,
    conn_id: u64,
) -> Result<()> {
    let mut framed = Framed::new(stream, frame_codec());

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = framed.next() => frame,
        };
        let frame = match frame {
            Some(Ok(frame)) => frame,
            Some(Err(err)) => {
                warn!(conn = conn_id, error = %err, "framing error on mock connection");
                break;
            }
            None => break,
        };

        let response = match decode_frame::<MockRequest>(&frame) {
            Ok(request) => handle_request(&index, &misses, request),
            Err(err) => {
                warn!(conn = conn_id, error = %err, "malformed mock request");
                MockResponse::miss("malformed")
            }
        };

        let payload = encode_frame(&response).context("failed to encode mock response")?;
        framed.send(payload).await.context("failed to send mock response")?;
    }

    Ok(())
}

/// Resolve one request against the index. A panic anywhere in matching is
/// contained here and answered as a miss so the connection keeps serving.
fn handle_request(
    index: &SpanIndex,
    misses: &Mutex<MissLog>,
    request: MockRequest,
) -> MockResponse {
    let query = MatchQuery {
        trace_id: request.trace_id.clone(),
        package_name: request.package_name.clone(),
        submodule_name: request.submodule_name.clone(),
        schema_hash: request.schema_hash.clone(),
        input_value: request.input_value,
    };

    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| index.match_span(&query)));

    match outcome {
        Ok(MatchOutcome::Found(entry)) => {
            debug!(
                trace_id = %request.trace_id,
                span_id = %entry.span.span_id,
                "serving mock"
            );
            MockResponse::found(entry.span.output_value.clone(), entry.span.span_id.clone())
        }
        Ok(MatchOutcome::NotFound { reason }) => {
            debug!(trace_id = %request.trace_id, reason = %reason, "mock miss");
            misses
                .lock()
                .by_trace
                .entry(request.trace_id)
                .or_default()
                .push(UnpatchedCall {
                    package_name: request.package_name,
                    submodule_name: request.submodule_name,
                    reason: reason.clone(),
                });
            MockResponse::miss(reason)
        }
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            warn!(trace_id = %request.trace_id, panic = %message, "mock handler panicked");
            MockResponse::miss(format!("internal error: {message}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drift_trace::Span;
    use serde_json::json;

    fn span(trace: &str, span_id: &str, package: &str, submodule: &str) -> Span {
        serde_json::from_value(json!({
            "trace_id": trace,
            "span_id": span_id,
            "package_name": package,
            "submodule_name": submodule,
            "input_value": {"sql": "SELECT * FROM products WHERE id = $1"},
            "output_value": {"rows": [{"id": 1}]},
            "timestamp": "2026-01-10T08:00:00Z"
        }))
        .unwrap()
    }

    async fn start_server() -> (MockServer, SocketAddr) {
        let index = Arc::new(SpanIndex::with_default_threshold());
        index.add_spans([span("trc_1", "spn_pg", "pg", "query")]);
        let server = MockServer::bind(
            "127.0.0.1:0".parse().unwrap(),
            index,
            CancellationToken::new(),
        )
        .await
        .unwrap();
        let addr = server.local_addr();
        (server, addr)
    }

    async fn roundtrip(addr: SocketAddr, request: &MockRequest) -> MockResponse {
        let stream = TcpStream::connect(addr).await.unwrap();
        let mut framed = Framed::new(stream, frame_codec());
        framed.send(encode_frame(request).unwrap()).await.unwrap();
        let frame = framed.next().await.unwrap().unwrap();
        decode_frame(&frame).unwrap()
    }

    fn pg_request(trace: &str) -> MockRequest {
        MockRequest {
            trace_id: trace.to_string(),
            package_name: "pg".to_string(),
            submodule_name: "query".to_string(),
            schema_hash: None,
            input_value: json!({"sql": "SELECT * FROM products WHERE id = ?"}),
        }
    }

    #[tokio::test]
    async fn test_found_then_consumed() {
        let (server, addr) = start_server().await;

        let first = roundtrip(addr, &pg_request("trc_1")).await;
        assert!(first.found);
        assert_eq!(first.span_id.as_deref(), Some("spn_pg"));

        let second = roundtrip(addr, &pg_request("trc_1")).await;
        assert!(!second.found);

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_miss_recorded_and_drained_by_cleanup() {
        let (server, addr) = start_server().await;

        let request = MockRequest {
            trace_id: "trc_1".to_string(),
            package_name: "redis".to_string(),
            submodule_name: "get".to_string(),
            schema_hash: None,
            input_value: json!({"key": "session"}),
        };
        let response = roundtrip(addr, &request).await;
        assert!(!response.found);

        let unpatched = server.cleanup_trace("trc_1");
        assert_eq!(unpatched.len(), 1);
        assert_eq!(unpatched[0].package_name, "redis");
        // Drained: a second cleanup returns nothing.
        assert!(server.cleanup_trace("trc_1").is_empty());

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_malformed_frame_gets_miss_and_connection_survives() {
        let (server, addr) = start_server().await;

        let stream = TcpStream::connect(addr).await.unwrap();
        let mut framed = Framed::new(stream, frame_codec());
        framed.send(bytes::Bytes::from_static(b"not json")).await.unwrap();
        let frame = framed.next().await.unwrap().unwrap();
        let response: MockResponse = decode_frame(&frame).unwrap();
        assert!(!response.found);
        assert_eq!(response.reason.as_deref(), Some("malformed"));

        // Same connection still serves real requests.
        framed
            .send(encode_frame(&pg_request("trc_1")).unwrap())
            .await
            .unwrap();
        let frame = framed.next().await.unwrap().unwrap();
        let response: MockResponse = decode_frame(&frame).unwrap();
        assert!(response.found);

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_cleanup_makes_spans_servable_again() {
        let (server, addr) = start_server().await;

        assert!(roundtrip(addr, &pg_request("trc_1")).await.found);
        assert!(!roundtrip(addr, &pg_request("trc_1")).await.found);

        server.cleanup_trace("trc_1");
        assert!(roundtrip(addr, &pg_request("trc_1")).await.found);

        server.shutdown().await;
    }
}
