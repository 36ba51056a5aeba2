//! Bounded-concurrency replay driver
//!
//! For each environment group: load the group's spans into the index, start
//! the mock server, bring the service up, run the group's tests through a
//! worker pool, then tear everything down before the next group. Per-test
//! failures (transport, timeout, crash, panic) become failed results; only
//! infrastructure failures abort, and a startup failure aborts its group
//! alone.

use crate::compare::{compare_responses, unpatched_deviations};
use crate::groups::EnvironmentGroup;
use crate::request::{issue, reconstruct_root_request, replay_env};
use crate::results::write_result_file;
use drift_common::DriftConfig;
use drift_index::SpanIndex;
use drift_mock_server::MockServer;
use drift_supervisor::{ServiceSupervisor, SupervisorConfig, SupervisorState};
use drift_trace::{Span, Test, TestResult};
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Invoked exactly once per test, from the worker that ran it. May be called
/// concurrently from several workers; implementations own their locking.
pub type OnTestCompleted =
    Arc<dyn Fn(TestResult, Test) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("failed to start mock server: {0}")]
    MockServer(#[source] anyhow::Error),
}

/// One group's live infrastructure: the mock endpoint and the supervised
/// service. Built per group, torn down before the next one starts.
pub struct GroupRuntime {
    pub environment: String,
    mock: Arc<MockServer>,
    supervisor: Arc<ServiceSupervisor>,
}

pub struct ReplayExecutor {
    config: DriftConfig,
    concurrency: usize,
    test_timeout: Duration,
    results_dir: Option<PathBuf>,
    enable_service_logs: bool,
    service_log_path: Option<PathBuf>,
    on_test_completed: Option<OnTestCompleted>,
    suite_spans: Mutex<Vec<Span>>,
    index: Arc<SpanIndex>,
    http: reqwest::Client,
    cancel: CancellationToken,
}

impl ReplayExecutor {
    pub fn new(config: DriftConfig, cancel: CancellationToken) -> Self {
        let index = Arc::new(SpanIndex::new(config.matching.threshold));
        let test_timeout = config.timeouts.test_timeout;
        Self {
            config,
            concurrency: 1,
            test_timeout,
            results_dir: None,
            enable_service_logs: false,
            service_log_path: None,
            on_test_completed: None,
            suite_spans: Mutex::new(Vec::new()),
            index,
            http: reqwest::Client::new(),
            cancel,
        }
    }

    pub fn set_concurrency(&mut self, concurrency: usize) {
        self.concurrency = concurrency.max(1);
    }

    pub fn set_test_timeout(&mut self, timeout: Duration) {
        self.test_timeout = timeout;
    }

    pub fn set_results_dir(&mut self, dir: Option<PathBuf>) {
        self.results_dir = dir;
    }

    pub fn set_enable_service_logs(&mut self, enabled: bool) {
        self.enable_service_logs = enabled;
    }

    pub fn set_service_log_path(&mut self, path: PathBuf) {
        self.service_log_path = Some(path);
    }

    pub fn set_on_test_completed(&mut self, callback: OnTestCompleted) {
        self.on_test_completed = Some(callback);
    }

    /// Replace the suite-wide span set (pre-app spans first; their position
    /// is what gives them tie-breaking priority in the index).
    pub fn set_suite_spans(&self, spans: Vec<Span>) {
        *self.suite_spans.lock() = spans;
    }

    /// Cooperative cancellation: stop assigning work, interrupt in-flight
    /// tests, record them as cancelled.
    pub fn cancel_tests(&self) {
        self.cancel.cancel();
    }

    /// Run every group: per group, prepare spans, start the mock server and
    /// the service with the group's env vars, drive the tests, tear down,
    /// aggregate. A group whose service never becomes ready is reported as
    /// skipped and the next group proceeds.
    pub async fn replay_by_environment(
        &self,
        groups: Vec<EnvironmentGroup>,
    ) -> Result<Vec<TestResult>, ExecutorError> {
        let mut all_results = Vec::new();

        for group in groups {
            if self.cancel.is_cancelled() {
                for test in &group.tests {
                    let result =
                        TestResult::failed(&test.trace_id, &group.name, 0, "cancelled");
                    self.complete_test(result.clone(), test.clone()).await;
                    all_results.push(result);
                }
                continue;
            }

            info!(group = %group.name, tests = group.tests.len(), "starting environment group");
            let runtime = match self.start_group(&group).await {
                Ok(runtime) => runtime,
                Err(StartGroupError::Mock(err)) => return Err(ExecutorError::MockServer(err)),
                Err(StartGroupError::Startup { supervisor, error }) => {
                    warn!(
                        group = %group.name,
                        error = %error,
                        help = %supervisor.startup_failure_help(),
                        "service startup failed; skipping group"
                    );
                    for test in &group.tests {
                        let result = TestResult::failed(
                            &test.trace_id,
                            &group.name,
                            0,
                            format!("skipped: service startup failed: {error}"),
                        );
                        self.complete_test(result.clone(), test.clone()).await;
                        all_results.push(result);
                    }
                    continue;
                }
            };

            let results = self.run_tests(&runtime, &group.tests).await;
            all_results.extend(results);

            runtime.supervisor.stop_environment().await;
            match Arc::try_unwrap(runtime.mock) {
                Ok(mock) => mock.shutdown().await,
                Err(_) => warn!("mock server still referenced at group teardown"),
            }
        }

        Ok(all_results)
    }

    /// Run the supplied tests under the current group runtime. Returns one
    /// result per test, in input order, after the last worker exits.
    pub async fn run_tests(&self, runtime: &GroupRuntime, tests: &[Test]) -> Vec<TestResult> {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut workers: JoinSet<(usize, TestResult)> = JoinSet::new();

        for (idx, test) in tests.iter().enumerate() {
            let test = test.clone();
            let semaphore = semaphore.clone();
            let cancel = self.cancel.clone();
            let http = self.http.clone();
            let mock = runtime.mock.clone();
            let supervisor = runtime.supervisor.clone();
            let environment = runtime.environment.clone();
            let timeout = self.test_timeout;
            let service_port = self.config.service.port;
            let results_dir = self.results_dir.clone();
            let callback = self.on_test_completed.clone();

            workers.spawn(async move {
                let worker = run_one_test(
                    &test,
                    &environment,
                    &http,
                    &mock,
                    &supervisor,
                    &semaphore,
                    &cancel,
                    timeout,
                    service_port,
                );
                let result = match std::panic::AssertUnwindSafe(worker).catch_unwind().await {
                    Ok(result) => result,
                    Err(panic) => {
                        let message = panic
                            .downcast_ref::<&str>()
                            .map(|s| s.to_string())
                            .or_else(|| panic.downcast_ref::<String>().cloned())
                            .unwrap_or_else(|| "unknown panic".to_string());
                        warn!(trace_id = %test.trace_id, panic = %message, "worker panicked");
                        TestResult::failed(
                            &test.trace_id,
                            &environment,
                            0,
                            format!("internal: worker panicked: {message}"),
                        )
                    }
                };

                if let Some(dir) = &results_dir {
                    if let Err(err) = write_result_file(dir, &result) {
                        warn!(trace_id = %result.trace_id, error = %err, "failed to write result file");
                    }
                }
                if let Some(callback) = &callback {
                    callback(result.clone(), test.clone()).await;
                }
                mock.cleanup_trace(&test.trace_id);

                (idx, result)
            });
        }

        let mut slots: Vec<Option<TestResult>> = vec![None; tests.len()];
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok((idx, result)) => slots[idx] = Some(result),
                Err(join_err) => warn!("worker task failed to join: {join_err}"),
            }
        }

        // Every scheduled test reports a result, even if its worker was lost.
        slots
            .into_iter()
            .enumerate()
            .map(|(idx, slot)| {
                slot.unwrap_or_else(|| {
                    TestResult::failed(
                        &tests[idx].trace_id,
                        &runtime.environment,
                        0,
                        "internal: worker lost",
                    )
                })
            })
            .collect()
    }

    async fn start_group(&self, group: &EnvironmentGroup) -> Result<GroupRuntime, StartGroupError> {
        let mut spans = self.suite_spans.lock().clone();
        for test in &group.tests {
            spans.extend(test.dependency_spans.iter().cloned());
        }
        self.index.replace_spans(spans);

        let mock_addr = SocketAddr::from((self.config.mock.host, self.config.mock.port));
        let mock = MockServer::bind(mock_addr, self.index.clone(), self.cancel.child_token())
            .await
            .map_err(StartGroupError::Mock)?;
        let mock = Arc::new(mock);

        let supervisor = Arc::new(ServiceSupervisor::new(SupervisorConfig {
            start_command: self.config.service.start_command.clone(),
            readiness_command: self.config.service.readiness_command.clone(),
            stop_command: self.config.service.stop_command.clone(),
            readiness_timeout: self.config.timeouts.readiness_timeout,
            readiness_interval: self.config.timeouts.readiness_interval,
            stop_grace: self.config.timeouts.stop_grace,
            log_path: self
                .enable_service_logs
                .then(|| self.service_log_path.clone())
                .flatten(),
        }));

        let env = replay_env(
            &self.config.mock.host.to_string(),
            mock.local_addr().port(),
            &group.env_vars,
        );
        if let Err(error) = supervisor.start_environment(&env, &self.cancel).await {
            let mock = Arc::try_unwrap(mock).unwrap_or_else(|_| unreachable!("mock not shared yet"));
            mock.shutdown().await;
            return Err(StartGroupError::Startup { supervisor, error });
        }

        Ok(GroupRuntime {
            environment: group.name.clone(),
            mock,
            supervisor,
        })
    }

    async fn complete_test(&self, result: TestResult, test: Test) {
        if let Some(dir) = self.results_dir.as_ref() {
            if let Err(err) = write_result_file(dir, &result) {
                warn!(trace_id = %result.trace_id, error = %err, "failed to write result file");
            }
        }
        if let Some(callback) = &self.on_test_completed {
            callback(result, test).await;
        }
    }
}

enum StartGroupError {
    Mock(anyhow::Error),
    Startup {
        supervisor: Arc<ServiceSupervisor>,
        error: drift_supervisor::StartupError,
    },
}

#[allow(clippy::too_many_arguments)]
async fn run_one_test(
    test: &Test,
    environment: &str,
    http: &reqwest::Client,
    mock: &MockServer,
    supervisor: &ServiceSupervisor,
    semaphore: &Semaphore,
    cancel: &CancellationToken,
    timeout: Duration,
    service_port: u16,
) -> TestResult {
    // Concurrency slot first; a cancelled run never starts queued tests.
    let _permit = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            return TestResult::failed(&test.trace_id, environment, 0, "cancelled");
        }
        permit = semaphore.acquire() => match permit {
            Ok(permit) => permit,
            Err(_) => return TestResult::failed(&test.trace_id, environment, 0, "cancelled"),
        },
    };

    if supervisor.state() == SupervisorState::Crashed {
        return TestResult::failed(&test.trace_id, environment, 0, "service crashed");
    }

    let request = match reconstruct_root_request(&test.root, service_port) {
        Ok(request) => request,
        Err(err) => {
            return TestResult::failed(
                &test.trace_id,
                environment,
                0,
                format!("invalid root span: {err}"),
            )
        }
    };

    debug!(trace_id = %test.trace_id, method = %request.method, url = %request.url, "replaying root request");
    let start = Instant::now();
    let mut crashed = supervisor.crashed();

    let live = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            return TestResult::failed(
                &test.trace_id,
                environment,
                start.elapsed().as_millis() as u64,
                "cancelled",
            );
        }
        _ = crashed.wait_for(|crashed| *crashed) => {
            return TestResult::failed(
                &test.trace_id,
                environment,
                start.elapsed().as_millis() as u64,
                "service crashed",
            );
        }
        outcome = tokio::time::timeout(timeout, issue(http, &request)) => match outcome {
            Err(_) => {
                return TestResult::failed(
                    &test.trace_id,
                    environment,
                    start.elapsed().as_millis() as u64,
                    format!("test timed out after {timeout:?}"),
                );
            }
            Ok(Err(err)) => {
                return TestResult::failed(
                    &test.trace_id,
                    environment,
                    start.elapsed().as_millis() as u64,
                    format!("transport error: {err:#}"),
                );
            }
            Ok(Ok(live)) => live,
        },
    };

    let duration_ms = start.elapsed().as_millis() as u64;
    let mut deviations = compare_responses(&test.root.output_value, &live);
    deviations.extend(unpatched_deviations(&mock.unpatched_calls(&test.trace_id)));

    let mut result = TestResult::passed(&test.trace_id, environment, duration_ms);
    if !deviations.is_empty() {
        result = result.with_deviations(deviations);
    }
    result
}
