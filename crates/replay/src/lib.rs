//! Replay executor: drive recorded tests against a fresh service instance
//!
//! This crate owns the driver's hot path. Tests are partitioned into
//! environment groups; each group gets a mock server and one supervised
//! service lifecycle; a bounded worker pool re-issues every root request,
//! compares the live response against the recording, and streams results to
//! the reporter and, in CI mode, the cloud.

pub mod compare;
pub mod executor;
pub mod groups;
pub mod report;
pub mod request;
pub mod results;

pub use executor::{ExecutorError, GroupRuntime, OnTestCompleted, ReplayExecutor};
pub use groups::{group_by_environment, EnvironmentGroup, GroupingOutcome};
pub use report::{
    CloudSink, NullProgress, OutputFormat, ProgressObserver, Reporter, RunSummary,
    StderrProgress, UploadStats,
};
