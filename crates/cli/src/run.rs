//! The `drift run` command: load, group, replay, report, finalize

use crate::cleanup::CleanupStack;
use crate::cloud;
use crate::commands::RunArgs;
use crate::logging;
use crate::options::RunOptions;
use anyhow::{Context, Result};
use drift_api_client::ApiError;
use drift_replay::{
    group_by_environment, CloudSink, NullProgress, ProgressObserver, Reporter, ReplayExecutor,
    StderrProgress,
};
use drift_trace::{load_trace_dir, load_trace_file, Filter};
use drift_wire::cloud::CreateDriftRunRequest;
use futures::FutureExt;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Exit code for an interrupted run, mirroring shell convention for SIGINT.
const EXIT_INTERRUPTED: i32 = 130;

pub async fn run(args: RunArgs) -> Result<i32> {
    let options = RunOptions::from_args(&args)?;
    let guard = logging::init(
        Some(&options.log_dir),
        options.verbose,
        options.suppress_stderr_logs(),
    )?;

    let cancel = CancellationToken::new();
    install_signal_handler(cancel.clone());

    let progress: Arc<dyn ProgressObserver> = if options.suppress_stderr_logs() {
        Arc::new(NullProgress)
    } else {
        Arc::new(StderrProgress::new())
    };
    let mut cleanup = CleanupStack::new();
    {
        let progress = progress.clone();
        cleanup.push("clear progress", async move { progress.clear() }.boxed());
    }

    let outcome = run_inner(&options, &cancel, progress.clone()).await;
    cleanup.run().await;
    drop(guard);
    outcome
}

async fn run_inner(
    options: &RunOptions,
    cancel: &CancellationToken,
    progress: Arc<dyn ProgressObserver>,
) -> Result<i32> {
    // Load the suite: cloud or local, behind the same shape.
    let (mut suite, extra_suite_spans, sink) = match &options.cloud {
        Some(cloud_opts) => {
            let client = cloud::client_for(cloud_opts)?;
            let run_id = if cloud_opts.ci {
                let request = CreateDriftRunRequest::new(
                    &cloud_opts.service_id,
                    env!("CARGO_PKG_VERSION"),
                    &cloud_opts.ci_metadata,
                );
                match client.create_drift_run(&request, cancel).await {
                    Ok(response) => Some(response.run_id),
                    Err(err @ (ApiError::NoSeat | ApiError::PausedByLabel)) => {
                        warn!("cannot start drift run: {err}");
                        return Ok(1);
                    }
                    Err(err) => return Err(err).context("failed to create drift run"),
                }
            } else {
                None
            };

            let (suite, extra) = cloud::load_suite(
                &client,
                cloud_opts,
                run_id.as_deref(),
                cancel,
                progress.as_ref(),
            )
            .await?;
            let sink = run_id
                .map(|id| Arc::new(CloudSink::new(client.clone(), id, cancel.clone())));
            (suite, extra, sink)
        }
        None => {
            let suite = match &options.trace_file {
                Some(file) => load_trace_file(file)?,
                None => load_trace_dir(&options.trace_dir)?,
            };
            (suite, Vec::new(), None)
        }
    };

    for warning in &suite.warnings {
        warn!("{warning}");
    }
    if suite.skipped_lines > 0 {
        warn!("skipped {} malformed trace line(s)", suite.skipped_lines);
    }

    if let Some(trace_id) = &options.trace_id {
        suite.tests.retain(|test| &test.trace_id == trace_id);
    }
    if let Some(expr) = &options.filter {
        let filter = Filter::compile(expr)
            .with_context(|| format!("invalid --filter expression {expr:?}"))?;
        suite.tests.retain(|test| filter.matches(test));
    }

    let reporter = Arc::new(Mutex::new(Reporter::new(
        options.output_format,
        options.quiet,
        options.verbose,
        options.print,
    )));

    if suite.tests.is_empty() {
        info!("no tests to replay");
        let summary = reporter.lock().finish();
        if let Some(sink) = &sink {
            if let Err(err) = sink.finalize(&summary, false).await {
                warn!(error = %err, "failed to finalize CI status");
                return Ok(1);
            }
        }
        return Ok(0);
    }

    let grouping = group_by_environment(suite.tests, &suite.pre_app_spans);
    for warning in &grouping.warnings {
        warn!("{warning}");
    }
    info!(
        tests = grouping.groups.iter().map(|g| g.tests.len()).sum::<usize>(),
        groups = grouping.groups.len(),
        "starting replay"
    );

    let mut executor = ReplayExecutor::new(options.config.clone(), cancel.clone());
    executor.set_concurrency(options.concurrency);
    if let Some(timeout) = options.test_timeout {
        executor.set_test_timeout(timeout);
    }
    executor.set_results_dir(options.results_dir.clone());
    executor.set_enable_service_logs(options.enable_service_logs);
    executor.set_service_log_path(options.log_dir.join(format!(
        "{}-service.log",
        options.started_at.format("%Y%m%dT%H%M%SZ")
    )));

    // Suite-wide span set: pre-app spans first so they win matching ties,
    // then (for single-test cloud runs) the rest of the suite.
    let mut suite_spans = suite.pre_app_spans.clone();
    suite_spans.extend(extra_suite_spans);
    executor.set_suite_spans(suite_spans);

    {
        let reporter = reporter.clone();
        let sink = sink.clone();
        executor.set_on_test_completed(Arc::new(move |result, test| {
            let reporter = reporter.clone();
            let sink = sink.clone();
            async move {
                reporter.lock().report_test(&test.display_name, &result);
                if let Some(sink) = sink {
                    sink.upload(&test.display_name, &result).await;
                }
            }
            .boxed()
        }));
    }

    let results = executor
        .replay_by_environment(grouping.groups)
        .await
        .context("replay aborted")?;
    info!(results = results.len(), "replay finished");

    let summary = reporter.lock().finish();
    let interrupted = cancel.is_cancelled();

    let mut finalize_failed = false;
    if let Some(sink) = &sink {
        let stats = sink.stats();
        if stats.failed > 0 {
            warn!(
                failed = stats.failed,
                attempted = stats.attempted,
                "some result uploads failed"
            );
        }
        if let Err(err) = sink.finalize(&summary, interrupted).await {
            warn!(error = %err, "failed to finalize CI status");
            finalize_failed = true;
        }
    }

    if interrupted {
        warn!("run interrupted");
        return Ok(EXIT_INTERRUPTED);
    }
    if finalize_failed {
        return Ok(1);
    }
    // CI exit code ignores deviations: the run itself succeeded and every
    // result made it upstream. Local runs report failures in the code.
    if sink.is_some() {
        return Ok(0);
    }
    Ok(if summary.all_passed() { 0 } else { 1 })
}

fn install_signal_handler(cancel: CancellationToken) {
    if let Err(err) = ctrlc::set_handler(move || {
        warn!("interrupt received, cancelling run");
        cancel.cancel();
    }) {
        warn!("failed to install signal handler: {err}");
    }
}
