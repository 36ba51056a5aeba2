//! The `drift list` command: show the tests a run would consider

use crate::commands::ListArgs;
use crate::logging;
use anyhow::{Context, Result};
use drift_replay::OutputFormat;
use drift_trace::{load_trace_dir, load_trace_file, Filter, Test, TestOrigin};
use serde_json::json;
use std::io::Write;
use tracing::warn;

pub async fn list(args: ListArgs) -> Result<i32> {
    let format: OutputFormat = args.output_format.parse()?;
    let guard = logging::init(None, false, format == OutputFormat::Json)?;

    let suite = match &args.trace_file {
        Some(file) => load_trace_file(file)?,
        None => {
            let dir = match &args.trace_dir {
                Some(dir) => dir.clone(),
                None => drift_common::paths::traces_dir()?,
            };
            load_trace_dir(&dir)?
        }
    };
    for warning in &suite.warnings {
        warn!("{warning}");
    }

    let mut tests = suite.tests;
    if let Some(expr) = &args.filter {
        let filter = Filter::compile(expr)
            .with_context(|| format!("invalid --filter expression {expr:?}"))?;
        tests.retain(|test| filter.matches(test));
    }

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    match format {
        OutputFormat::Json => {
            let document: Vec<_> = tests.iter().map(test_json).collect();
            writeln!(out, "{}", serde_json::to_string_pretty(&document)?)?;
        }
        OutputFormat::Text => {
            if tests.is_empty() {
                writeln!(out, "no recorded tests found")?;
            } else {
                writeln!(
                    out,
                    "{:<26} {:<7} {:<32} {:>6} {:>9}",
                    "TRACE ID", "METHOD", "PATH", "STATUS", "DURATION"
                )?;
                for test in &tests {
                    writeln!(
                        out,
                        "{:<26} {:<7} {:<32} {:>6} {:>7}ms",
                        test.trace_id,
                        test.method,
                        test.path,
                        test.status.map(|s| s.to_string()).unwrap_or_else(|| "-".to_string()),
                        test.duration_ms
                    )?;
                }
                writeln!(out, "\n{} test(s)", tests.len())?;
            }
        }
    }

    drop(guard);
    Ok(0)
}

fn test_json(test: &Test) -> serde_json::Value {
    json!({
        "trace_id": test.trace_id,
        "display_name": test.display_name,
        "method": test.method,
        "path": test.path,
        "status": test.status,
        "duration_ms": test.duration_ms,
        "source": match &test.origin {
            TestOrigin::File { path } => json!({"kind": "file", "path": path}),
            TestOrigin::Cloud { test_id } => json!({"kind": "cloud", "test_id": test_id}),
        },
    })
}
