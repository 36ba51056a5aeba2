//! Result sink: terminal reporting, progress, and cloud streaming uploads
//!
//! The reporter is the only component that writes to stdout; progress goes
//! to stderr. Workers complete tests concurrently, so the CLI shares the
//! reporter behind a lock and the upload stats live behind one here.

use drift_api_client::{ApiClient, ApiError};
use drift_trace::TestResult;
use drift_wire::cloud::{RunStatus, UploadTestResultRequest};
use parking_lot::Mutex;
use serde_json::json;
use std::io::Write;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => Err(anyhow::anyhow!("unsupported output format: {other}")),
        }
    }
}

/// Aggregate counts for the final summary and the CI status message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub errored: usize,
}

impl RunSummary {
    pub fn record(&mut self, result: &TestResult) {
        self.total += 1;
        if result.passed {
            self.passed += 1;
        } else {
            self.failed += 1;
            if result.error.is_some() {
                self.errored += 1;
            }
        }
    }

    pub fn all_passed(&self) -> bool {
        self.failed == 0
    }

    pub fn ci_message(&self) -> String {
        format!("{}/{} tests passed", self.passed, self.total)
    }
}

pub struct Reporter {
    format: OutputFormat,
    quiet: bool,
    verbose: bool,
    /// `--print` one-shot mode: a single JSON object instead of an array.
    print_single: bool,
    out: Box<dyn Write + Send>,
    collected: Vec<serde_json::Value>,
    summary: RunSummary,
}

impl Reporter {
    pub fn new(format: OutputFormat, quiet: bool, verbose: bool, print_single: bool) -> Self {
        Self::with_writer(format, quiet, verbose, print_single, Box::new(std::io::stdout()))
    }

    pub fn with_writer(
        format: OutputFormat,
        quiet: bool,
        verbose: bool,
        print_single: bool,
        out: Box<dyn Write + Send>,
    ) -> Self {
        Self {
            format,
            quiet,
            verbose,
            print_single,
            out,
            collected: Vec::new(),
            summary: RunSummary::default(),
        }
    }

    /// Report one completed test. Called from workers in completion order;
    /// lines carry the test's identity, never its position.
    pub fn report_test(&mut self, display_name: &str, result: &TestResult) {
        self.summary.record(result);

        match self.format {
            OutputFormat::Json => {
                self.collected.push(result_json(display_name, result));
            }
            OutputFormat::Text => {
                if self.quiet && result.passed {
                    return;
                }
                let verdict = if result.passed { "PASS" } else { "FAIL" };
                let mut line = format!(
                    "{verdict}  {display_name} [{}] ({}ms)",
                    result.environment, result.duration_ms
                );
                if let Some(error) = &result.error {
                    line.push_str(&format!(" - error: {error}"));
                } else if !result.deviations.is_empty() {
                    line.push_str(&format!(" - {} deviation(s)", result.deviations.len()));
                }
                let _ = writeln!(self.out, "{line}");
                if self.verbose {
                    for deviation in &result.deviations {
                        let _ = writeln!(
                            self.out,
                            "      {}: expected {}, got {}",
                            deviation.field_path, deviation.expected, deviation.actual
                        );
                    }
                }
            }
        }
    }

    /// Print the terminal summary (text) or the buffered JSON document, and
    /// return the aggregate counts.
    pub fn finish(&mut self) -> RunSummary {
        match self.format {
            OutputFormat::Json => {
                let document = if self.print_single {
                    self.collected
                        .first()
                        .cloned()
                        .unwrap_or(serde_json::Value::Null)
                } else {
                    serde_json::Value::Array(self.collected.clone())
                };
                let _ = writeln!(
                    self.out,
                    "{}",
                    serde_json::to_string_pretty(&document).unwrap_or_else(|_| "null".to_string())
                );
            }
            OutputFormat::Text => {
                let summary = &self.summary;
                let _ = writeln!(self.out);
                let _ = writeln!(
                    self.out,
                    "{} total, {} passed, {} failed{}",
                    summary.total,
                    summary.passed,
                    summary.failed,
                    if summary.errored > 0 {
                        format!(" ({} with errors)", summary.errored)
                    } else {
                        String::new()
                    }
                );
            }
        }
        let _ = self.out.flush();
        self.summary
    }
}

fn result_json(display_name: &str, result: &TestResult) -> serde_json::Value {
    let mut value = serde_json::to_value(result).unwrap_or(serde_json::Value::Null);
    if let Some(obj) = value.as_object_mut() {
        obj.insert("display_name".to_string(), json!(display_name));
    }
    value
}

/// Observer for long fetches and runs: `(current, total, message)`.
pub trait ProgressObserver: Send + Sync {
    fn update(&self, current: usize, total: Option<u64>, message: &str);
    fn clear(&self) {}
}

/// Headless progress: a rewriting stderr line on a tty, silent otherwise.
pub struct StderrProgress {
    tty: bool,
}

impl StderrProgress {
    pub fn new() -> Self {
        Self {
            tty: atty::is(atty::Stream::Stderr),
        }
    }
}

impl Default for StderrProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressObserver for StderrProgress {
    fn update(&self, current: usize, total: Option<u64>, message: &str) {
        if !self.tty {
            return;
        }
        match total {
            Some(total) => eprint!("\r{message} ({current}/{total})    "),
            None => eprint!("\r{message} ({current})    "),
        }
        let _ = std::io::stderr().flush();
    }

    fn clear(&self) {
        if self.tty {
            eprint!("\r{:60}\r", "");
            let _ = std::io::stderr().flush();
        }
    }
}

pub struct NullProgress;

impl ProgressObserver for NullProgress {
    fn update(&self, _current: usize, _total: Option<u64>, _message: &str) {}
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UploadStats {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// Streams each completed result to the cloud and finalizes the run's CI
/// status. Upload failures are logged, never fatal to the test.
pub struct CloudSink {
    client: Arc<ApiClient>,
    run_id: String,
    cancel: CancellationToken,
    stats: Mutex<UploadStats>,
}

impl CloudSink {
    pub fn new(client: Arc<ApiClient>, run_id: String, cancel: CancellationToken) -> Self {
        Self {
            client,
            run_id,
            cancel,
            stats: Mutex::new(UploadStats::default()),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub async fn upload(&self, display_name: &str, result: &TestResult) {
        self.stats.lock().attempted += 1;
        let request = UploadTestResultRequest {
            run_id: self.run_id.clone(),
            display_name: display_name.to_string(),
            result: result.clone(),
        };
        match self.client.upload_test_result(&request, &self.cancel).await {
            Ok(()) => {
                self.stats.lock().succeeded += 1;
            }
            Err(err) => {
                self.stats.lock().failed += 1;
                warn!(trace_id = %result.trace_id, error = %err, "failed to upload test result");
            }
        }
    }

    pub fn stats(&self) -> UploadStats {
        *self.stats.lock()
    }

    /// Terminal CI status: SUCCESS when execution completed (deviations do
    /// not fail a CI run), FAILURE when interrupted or broken.
    pub async fn finalize(
        &self,
        summary: &RunSummary,
        interrupted: bool,
    ) -> Result<(), ApiError> {
        let (status, message) = if interrupted {
            (RunStatus::Failure, "interrupted".to_string())
        } else {
            (RunStatus::Success, summary.ci_message())
        };
        info!(run_id = %self.run_id, ?status, %message, "finalizing CI status");
        // Finalization must go out even after cancellation; use a fresh
        // token so the interrupt that triggered it cannot starve it.
        let token = if interrupted {
            CancellationToken::new()
        } else {
            self.cancel.clone()
        };
        self.client
            .update_ci_status(&self.run_id, status, Some(message), &token)
            .await
    }
}
