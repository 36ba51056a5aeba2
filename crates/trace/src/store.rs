//! Local trace store: line-delimited JSON files, one trace per file

use crate::span::Span;
use crate::test::{Test, TestOrigin};
use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use tracing::{debug, warn};

/// Everything a run needs from the trace directory.
#[derive(Debug, Default)]
pub struct LoadedSuite {
    pub tests: Vec<Test>,
    /// Spans captured before the service's request handling was live,
    /// deduplicated by `(trace_id, span_id)`. Served with priority during
    /// replay startup.
    pub pre_app_spans: Vec<Span>,
    /// Malformed lines skipped across all files.
    pub skipped_lines: usize,
    pub warnings: Vec<String>,
}

impl LoadedSuite {
    fn push_pre_app(&mut self, span: Span) {
        let exists = self
            .pre_app_spans
            .iter()
            .any(|s| s.identity() == span.identity());
        if !exists {
            self.pre_app_spans.push(span);
        }
    }
}

/// Load every trace file in `dir`. Files that cannot be read at all are
/// warnings, not fatal; an unreadable directory is fatal.
pub fn load_trace_dir(dir: &Path) -> Result<LoadedSuite> {
    let mut suite = LoadedSuite::default();

    let entries = fs::read_dir(dir)
        .with_context(|| format!("failed to read trace directory {}", dir.display()))?;
    let mut paths: Vec<_> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("jsonl") | Some("json")
            )
        })
        .collect();
    paths.sort();

    for path in paths {
        if let Err(err) = load_file_into(&path, &mut suite) {
            warn!(file = %path.display(), error = %err, "skipping unreadable trace file");
            suite
                .warnings
                .push(format!("skipped {}: {err}", path.display()));
        }
    }

    debug!(
        tests = suite.tests.len(),
        pre_app = suite.pre_app_spans.len(),
        skipped_lines = suite.skipped_lines,
        "loaded trace directory"
    );
    Ok(suite)
}

/// Load a single trace file.
pub fn load_trace_file(path: &Path) -> Result<LoadedSuite> {
    let mut suite = LoadedSuite::default();
    load_file_into(path, &mut suite)?;
    Ok(suite)
}

fn load_file_into(path: &Path, suite: &mut LoadedSuite) -> Result<()> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read trace file {}", path.display()))?;

    let mut root: Option<Span> = None;
    let mut dependency_spans: Vec<Span> = Vec::new();
    let mut trace_id: Option<String> = None;

    for (line_no, line) in raw.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let span: Span = match serde_json::from_str(line) {
            Ok(span) => span,
            Err(err) => {
                warn!(
                    file = %path.display(),
                    line = line_no + 1,
                    error = %err,
                    "skipping malformed trace line"
                );
                suite.skipped_lines += 1;
                continue;
            }
        };

        if trace_id.is_none() && !span.is_pre_app_start {
            trace_id = Some(span.trace_id.clone());
        }

        if span.is_pre_app_start {
            suite.push_pre_app(span);
        } else if span.is_root_span {
            match &root {
                None => root = Some(span),
                Some(existing) => {
                    warn!(
                        file = %path.display(),
                        trace_id = %existing.trace_id,
                        rejected_span = %span.span_id,
                        "duplicate root span rejected; first root wins"
                    );
                    suite.warnings.push(format!(
                        "{}: duplicate root span {} rejected",
                        path.display(),
                        span.span_id
                    ));
                }
            }
        } else {
            dependency_spans.push(span);
        }
    }

    let Some(root) = root else {
        anyhow::bail!("trace file has no root span");
    };
    let trace_id = trace_id.unwrap_or_else(|| root.trace_id.clone());

    if suite.tests.iter().any(|t| t.trace_id == trace_id) {
        warn!(file = %path.display(), trace_id = %trace_id, "duplicate trace id rejected");
        suite
            .warnings
            .push(format!("{}: duplicate trace {trace_id} rejected", path.display()));
        return Ok(());
    }

    suite.tests.push(Test::from_trace(
        trace_id,
        root,
        dependency_spans,
        TestOrigin::File {
            path: path.to_path_buf(),
        },
    ));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;
    use tempfile::tempdir;

    fn write_trace(dir: &Path, name: &str, lines: &[serde_json::Value]) {
        let mut file = fs::File::create(dir.join(name)).unwrap();
        for line in lines {
            writeln!(file, "{line}").unwrap();
        }
    }

    fn root_line(trace: &str) -> serde_json::Value {
        json!({
            "trace_id": trace,
            "span_id": format!("{trace}-root"),
            "package_name": "http",
            "submodule_name": "GET",
            "is_root_span": true,
            "input_value": {"method": "GET", "target": "/health"},
            "output_value": {"status": 200},
            "timestamp": "2026-01-10T08:00:00Z"
        })
    }

    #[test]
    fn test_load_dir_with_dependencies_and_pre_app() {
        let dir = tempdir().unwrap();
        write_trace(
            dir.path(),
            "trc_a.jsonl",
            &[
                root_line("trc_a"),
                json!({
                    "trace_id": "trc_a",
                    "span_id": "trc_a-pg",
                    "package_name": "pg",
                    "submodule_name": "query",
                    "input_value": {"sql": "SELECT 1"},
                    "output_value": {"rows": []},
                    "timestamp": "2026-01-10T08:00:01Z"
                }),
                json!({
                    "trace_id": "trc_a",
                    "span_id": "trc_a-env",
                    "package_name": "ENV_VARS",
                    "is_pre_app_start": true,
                    "output_value": {"FEATURE_X": "1"},
                    "timestamp": "2026-01-10T07:59:59Z"
                }),
            ],
        );

        let suite = load_trace_dir(dir.path()).unwrap();
        assert_eq!(suite.tests.len(), 1);
        assert_eq!(suite.tests[0].dependency_spans.len(), 1);
        assert_eq!(suite.pre_app_spans.len(), 1);
        assert_eq!(suite.skipped_lines, 0);
    }

    #[test]
    fn test_malformed_lines_skipped_and_counted() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("trc_b.jsonl");
        let mut file = fs::File::create(&path).unwrap();
        writeln!(file, "{}", root_line("trc_b")).unwrap();
        writeln!(file, "this is not json").unwrap();
        writeln!(file, "{{\"also\": \"not a span\"}}").unwrap();

        let suite = load_trace_file(&path).unwrap();
        assert_eq!(suite.tests.len(), 1);
        assert_eq!(suite.skipped_lines, 2);
    }

    #[test]
    fn test_duplicate_root_first_wins() {
        let dir = tempdir().unwrap();
        let mut second = root_line("trc_c");
        second["span_id"] = json!("trc_c-root-2");
        second["input_value"] = json!({"method": "GET", "target": "/other"});
        write_trace(dir.path(), "trc_c.jsonl", &[root_line("trc_c"), second]);

        let suite = load_trace_dir(dir.path()).unwrap();
        assert_eq!(suite.tests.len(), 1);
        assert_eq!(suite.tests[0].root.span_id, "trc_c-root");
        assert_eq!(suite.warnings.len(), 1);
    }

    #[test]
    fn test_file_without_root_is_a_warning_in_dir_load() {
        let dir = tempdir().unwrap();
        write_trace(
            dir.path(),
            "trc_d.jsonl",
            &[json!({
                "trace_id": "trc_d",
                "span_id": "trc_d-pg",
                "package_name": "pg",
                "input_value": {},
                "output_value": {},
                "timestamp": "2026-01-10T08:00:00Z"
            })],
        );

        let suite = load_trace_dir(dir.path()).unwrap();
        assert!(suite.tests.is_empty());
        assert_eq!(suite.warnings.len(), 1);
    }

    #[test]
    fn test_duplicate_trace_across_files_rejected() {
        let dir = tempdir().unwrap();
        write_trace(dir.path(), "a_trc_e.jsonl", &[root_line("trc_e")]);
        write_trace(dir.path(), "b_trc_e.jsonl", &[root_line("trc_e")]);

        let suite = load_trace_dir(dir.path()).unwrap();
        assert_eq!(suite.tests.len(), 1);
        assert!(suite.warnings.iter().any(|w| w.contains("duplicate trace")));
    }
}
