//! In-memory span index answering mock-match queries
//!
//! The index holds the union of suite spans (pre-app spans first, then
//! per-trace spans) and serves the mock server's lookups. Matching is
//! deterministic: candidates are narrowed by package/submodule and schema
//! hash, ranked by scope (pre-app, then same-trace, then other suite spans),
//! scored by normalized similarity, and tie-broken by insertion order.
//! Consumption is at-most-once per trace; a pre-app span may be served to
//! many traces but only once to each.

pub mod normalize;
pub mod score;

use drift_trace::Span;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

pub use score::DEFAULT_THRESHOLD;

const STRIPE_COUNT: usize = 16;

/// One mock lookup from the SDK.
#[derive(Debug, Clone)]
pub struct MatchQuery {
    pub trace_id: String,
    pub package_name: String,
    pub submodule_name: String,
    pub schema_hash: Option<String>,
    pub input_value: Value,
}

/// Result of a lookup. A miss carries the reason the SDK will report as an
/// unpatched dependency.
#[derive(Debug, Clone)]
pub enum MatchOutcome {
    Found(Arc<IndexedSpan>),
    NotFound { reason: String },
}

/// A span plus its cached normalized input.
#[derive(Debug)]
pub struct IndexedSpan {
    pub span: Span,
    normalized_input: Value,
}

#[derive(Default)]
struct Inner {
    spans: Vec<Arc<IndexedSpan>>,
    by_identity: HashMap<(String, String), usize>,
    by_key: HashMap<(String, String), Vec<usize>>,
}

/// Per-trace consumption state. Created on the first lookup for a trace,
/// dropped by `reset_trace` after the test completes.
#[derive(Default)]
struct MatchContext {
    consumed: HashSet<usize>,
}

pub struct SpanIndex {
    threshold: f64,
    inner: RwLock<Inner>,
    stripes: Vec<Mutex<HashMap<String, MatchContext>>>,
}

impl SpanIndex {
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold,
            inner: RwLock::new(Inner::default()),
            stripes: (0..STRIPE_COUNT).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    pub fn with_default_threshold() -> Self {
        Self::new(DEFAULT_THRESHOLD)
    }

    /// Idempotent insertion preserving first-insertion order. Duplicate
    /// `(trace_id, span_id)` pairs are ignored.
    pub fn add_spans(&self, spans: impl IntoIterator<Item = Span>) {
        let mut inner = self.inner.write();
        for span in spans {
            let identity = (span.trace_id.clone(), span.span_id.clone());
            if inner.by_identity.contains_key(&identity) {
                continue;
            }
            let idx = inner.spans.len();
            let key = (span.package_name.clone(), span.submodule_name.clone());
            let normalized_input = normalize::normalize_value(&span.input_value);
            inner.spans.push(Arc::new(IndexedSpan {
                span,
                normalized_input,
            }));
            inner.by_identity.insert(identity, idx);
            inner.by_key.entry(key).or_default().push(idx);
        }
    }

    /// Replace the whole suite-wide set. Used at group transitions, when no
    /// lookups are in flight; any stale per-trace state goes with it.
    pub fn replace_spans(&self, spans: impl IntoIterator<Item = Span>) {
        {
            let mut inner = self.inner.write();
            *inner = Inner::default();
        }
        for stripe in &self.stripes {
            stripe.lock().clear();
        }
        self.add_spans(spans);
    }

    pub fn len(&self) -> usize {
        self.inner.read().spans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Find the best unconsumed span for the query and mark it consumed
    /// within the query's trace.
    ///
    /// The per-trace stripe lock covers candidate ranking and the
    /// consumption record only; the wire response is built by the caller
    /// after this returns, outside every lock.
    pub fn match_span(&self, query: &MatchQuery) -> MatchOutcome {
        let key = (query.package_name.clone(), query.submodule_name.clone());
        let candidates: Vec<(usize, Arc<IndexedSpan>)> = {
            let inner = self.inner.read();
            match inner.by_key.get(&key) {
                Some(indices) => indices
                    .iter()
                    .map(|&idx| (idx, inner.spans[idx].clone()))
                    .collect(),
                None => Vec::new(),
            }
        };

        if candidates.is_empty() {
            return MatchOutcome::NotFound {
                reason: format!(
                    "no recorded spans for {}.{}",
                    query.package_name, query.submodule_name
                ),
            };
        }

        let candidates: Vec<_> = match &query.schema_hash {
            Some(hash) => {
                let filtered: Vec<_> = candidates
                    .into_iter()
                    .filter(|(_, entry)| entry.span.schema_hash.as_deref() == Some(hash.as_str()))
                    .collect();
                if filtered.is_empty() {
                    return MatchOutcome::NotFound {
                        reason: format!(
                            "no {}.{} span matches schema hash {}",
                            query.package_name, query.submodule_name, hash
                        ),
                    };
                }
                filtered
            }
            None => candidates,
        };

        let normalized_query = normalize::normalize_value(&query.input_value);

        let stripe = &self.stripes[stripe_of(&query.trace_id)];
        let mut contexts = stripe.lock();
        let context = contexts.entry(query.trace_id.clone()).or_default();

        let mut all_consumed = true;
        let mut best: Option<(u8, f64, usize, &Arc<IndexedSpan>)> = None;
        for (idx, entry) in &candidates {
            if context.consumed.contains(idx) {
                continue;
            }
            all_consumed = false;
            let scope = scope_rank(&entry.span, &query.trace_id);
            let score = score::score(&normalized_query, &entry.normalized_input);
            if score < self.threshold {
                continue;
            }
            let better = match &best {
                None => true,
                Some((best_scope, best_score, best_idx, _)) => {
                    (scope, -score, *idx) < (*best_scope, -*best_score, *best_idx)
                }
            };
            if better {
                best = Some((scope, score, *idx, entry));
            }
        }

        match best {
            Some((scope, score, idx, entry)) => {
                context.consumed.insert(idx);
                debug!(
                    trace_id = %query.trace_id,
                    span_id = %entry.span.span_id,
                    scope,
                    score,
                    "matched mock span"
                );
                MatchOutcome::Found(entry.clone())
            }
            None if all_consumed => MatchOutcome::NotFound {
                reason: format!(
                    "all {}.{} spans already consumed for this trace",
                    query.package_name, query.submodule_name
                ),
            },
            None => MatchOutcome::NotFound {
                reason: format!(
                    "best {}.{} candidate scored below threshold {}",
                    query.package_name, query.submodule_name, self.threshold
                ),
            },
        }
    }

    /// Discard consumption state for a trace.
    pub fn reset_trace(&self, trace_id: &str) {
        self.stripes[stripe_of(trace_id)].lock().remove(trace_id);
    }
}

fn stripe_of(trace_id: &str) -> usize {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    trace_id.hash(&mut hasher);
    (hasher.finish() as usize) % STRIPE_COUNT
}

/// Pre-app spans outrank same-trace spans, which outrank the rest of the
/// suite.
fn scope_rank(span: &Span, query_trace: &str) -> u8 {
    if span.is_pre_app_start {
        0
    } else if span.trace_id == query_trace {
        1
    } else {
        2
    }
}

/// Stable fingerprint over the *structure* of an input value (paths and leaf
/// types, not leaf contents). Matches what the SDK records as `schema_hash`.
pub fn schema_fingerprint(value: &Value) -> String {
    let mut paths = Vec::new();
    collect_shape(value, String::new(), &mut paths);
    paths.sort();
    let mut hasher = Sha256::new();
    for path in paths {
        hasher.update(path.as_bytes());
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}

fn collect_shape(value: &Value, prefix: String, out: &mut Vec<String>) {
    match value {
        Value::Object(map) => {
            for (key, inner) in map {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                collect_shape(inner, path, out);
            }
        }
        Value::Array(items) => match items.first() {
            Some(first) => collect_shape(first, format!("{prefix}[]"), out),
            None => out.push(format!("{prefix}[]:empty")),
        },
        Value::String(_) => out.push(format!("{prefix}:string")),
        Value::Number(_) => out.push(format!("{prefix}:number")),
        Value::Bool(_) => out.push(format!("{prefix}:bool")),
        Value::Null => out.push(format!("{prefix}:null")),
    }
}
