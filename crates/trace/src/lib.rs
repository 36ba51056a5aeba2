//! Trace data model and trace store for the Tusk Drift replay driver
//!
//! A trace is the complete recording of one inbound request: a single root
//! span (the request itself) plus the outbound calls the service made while
//! handling it. This crate owns the span/test/result model, the local
//! line-delimited JSON trace store, and the filter expression language used
//! by `drift run --filter` and `drift list --filter`.

pub mod filter;
pub mod result;
pub mod span;
pub mod store;

pub use filter::Filter;
pub use result::{Deviation, DeviationKind, DeviationSeverity, TestResult};
pub use span::{Span, ENV_VARS_PACKAGE};
pub use store::{load_trace_dir, load_trace_file, LoadedSuite};
pub use test::{Test, TestOrigin};
