//! Structured result files, written atomically
//!
//! One file per test under the run's results directory. Write goes to a
//! temp file in the same directory first, then renames into place, so a
//! crashed or cancelled run never leaves a half-written result behind.

use anyhow::{Context, Result};
use drift_trace::TestResult;
use std::io::Write;
use std::path::{Path, PathBuf};

pub fn result_file_path(dir: &Path, trace_id: &str) -> PathBuf {
    dir.join(format!("{trace_id}.json"))
}

pub fn write_result_file(dir: &Path, result: &TestResult) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create results directory {}", dir.display()))?;

    let final_path = result_file_path(dir, &result.trace_id);
    let mut temp = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("failed to create temp file in {}", dir.display()))?;
    serde_json::to_writer_pretty(&mut temp, result).context("failed to serialize test result")?;
    temp.write_all(b"\n")?;
    temp.persist(&final_path)
        .with_context(|| format!("failed to write result file {}", final_path.display()))?;
    Ok(final_path)
}

pub fn read_result_file(path: &Path) -> Result<TestResult> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read result file {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse result file {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use drift_trace::{Deviation, DeviationKind, DeviationSeverity};
    use serde_json::json;
    use tempfile::tempdir;

    fn sample_result() -> TestResult {
        TestResult::passed("trc_1", "default", 42).with_deviations(vec![Deviation {
            kind: DeviationKind::Body,
            field_path: "body.v".to_string(),
            expected: json!(1),
            actual: json!(2),
            severity: DeviationSeverity::High,
        }])
    }

    #[test]
    fn test_write_then_read_round_trip() {
        let dir = tempdir().unwrap();
        let result = sample_result();

        let path = write_result_file(dir.path(), &result).unwrap();
        assert_eq!(path, dir.path().join("trc_1.json"));
        let back = read_result_file(&path).unwrap();
        assert_eq!(back, result);
    }

    #[test]
    fn test_reserialization_is_byte_identical() {
        let dir = tempdir().unwrap();
        let result = sample_result();

        let path = write_result_file(dir.path(), &result).unwrap();
        let first = std::fs::read(&path).unwrap();

        let back = read_result_file(&path).unwrap();
        write_result_file(dir.path(), &back).unwrap();
        let second = std::fs::read(&path).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_rewrite_replaces_atomically() {
        let dir = tempdir().unwrap();
        write_result_file(dir.path(), &sample_result()).unwrap();

        let updated = TestResult::failed("trc_1", "default", 100, "service crashed");
        let path = write_result_file(dir.path(), &updated).unwrap();
        assert_eq!(read_result_file(&path).unwrap(), updated);
        // Only the final file remains; no temp droppings.
        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }
}
