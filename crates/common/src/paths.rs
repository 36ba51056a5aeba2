use anyhow::Result;
use chrono::{DateTime, Utc};
use std::path::PathBuf;

pub const TUSK_DIR_NAME: &str = ".tusk";
pub const TRACES_SUBDIR: &str = "traces";
pub const RESULTS_SUBDIR: &str = "results";
pub const LOGS_SUBDIR: &str = "logs";
pub const CONFIG_FILE_NAME: &str = "tusk.toml";

/// Root of the per-project Tusk state directory.
///
/// `TUSK_DIR` overrides the default `./.tusk` (used by tests and monorepo
/// setups where the service lives away from the invocation directory).
pub fn tusk_dir() -> Result<PathBuf> {
    if let Ok(override_dir) = std::env::var("TUSK_DIR") {
        let trimmed = override_dir.trim();
        if !trimmed.is_empty() {
            return Ok(PathBuf::from(trimmed));
        }
    }
    Ok(std::env::current_dir()?.join(TUSK_DIR_NAME))
}

pub fn traces_dir() -> Result<PathBuf> {
    Ok(tusk_dir()?.join(TRACES_SUBDIR))
}

/// Results directory for one run, keyed by the run's start timestamp.
pub fn results_dir(started_at: DateTime<Utc>) -> Result<PathBuf> {
    Ok(tusk_dir()?
        .join(RESULTS_SUBDIR)
        .join(started_at.format("%Y%m%dT%H%M%SZ").to_string()))
}

pub fn logs_dir() -> Result<PathBuf> {
    Ok(tusk_dir()?.join(LOGS_SUBDIR))
}

pub fn config_file() -> Result<PathBuf> {
    Ok(std::env::current_dir()?.join(CONFIG_FILE_NAME))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_results_dir_is_timestamped() {
        let ts = DateTime::parse_from_rfc3339("2026-03-01T12:30:45Z")
            .unwrap()
            .with_timezone(&Utc);
        let dir = results_dir(ts).unwrap();
        assert!(dir.ends_with("results/20260301T123045Z"));
    }

    #[test]
    fn test_tusk_dir_override() {
        std::env::set_var("TUSK_DIR", "/tmp/tusk-test-home");
        let dir = tusk_dir().unwrap();
        std::env::remove_var("TUSK_DIR");
        assert_eq!(dir, PathBuf::from("/tmp/tusk-test-home"));
    }
}
