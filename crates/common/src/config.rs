use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

const MOCK_PORT_OVERRIDE_ENV: &str = "TUSK_MOCK_PORT";
const MATCH_THRESHOLD_OVERRIDE_ENV: &str = "TUSK_MATCH_THRESHOLD";

const DEFAULT_MOCK_PORT: u16 = 9001;
const DEFAULT_MATCH_THRESHOLD: f64 = 0.3;
const DEFAULT_TEST_TIMEOUT_SECS: u64 = 30;
const DEFAULT_READINESS_TIMEOUT_SECS: u64 = 60;
const DEFAULT_READINESS_INTERVAL_MS: u64 = 250;
const DEFAULT_STOP_GRACE_SECS: u64 = 10;

/// Resolved driver configuration: `tusk.toml` merged with env overrides.
///
/// Only the CLI layer constructs this; everything downstream receives it (or
/// a slice of it) explicitly.
#[derive(Debug, Clone)]
pub struct DriftConfig {
    pub service: ServiceConfig,
    pub mock: MockConfig,
    pub matching: MatchingConfig,
    pub timeouts: TimeoutConfig,
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Shell command that starts the service under test.
    pub start_command: String,
    /// Shell command polled until exit 0 to declare the service ready.
    pub readiness_command: String,
    /// Optional shell command to stop the service; falls back to signals.
    pub stop_command: Option<String>,
    /// Loopback port the service listens on.
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct MockConfig {
    pub host: Ipv4Addr,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct MatchingConfig {
    /// Minimum normalized similarity for a mock match; below it the lookup
    /// reports NotFound and the SDK treats the call as unpatched.
    pub threshold: f64,
}

#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    pub test_timeout: Duration,
    pub readiness_timeout: Duration,
    pub readiness_interval: Duration,
    pub stop_grace: Duration,
}

impl DriftConfig {
    /// Load from an explicit path, or from `tusk.toml` in the working
    /// directory when `path` is `None`. A missing file is an error: the
    /// driver cannot start a service it was never told about.
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let path = match path {
            Some(p) => p,
            None => crate::paths::config_file()?,
        };
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let file: FileConfig = toml::from_str(&raw)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Self::resolve(file)
    }

    pub fn from_str_for_tests(raw: &str) -> Result<Self> {
        Self::resolve(toml::from_str(raw)?)
    }

    fn resolve(file: FileConfig) -> Result<Self> {
        let service = file
            .service
            .ok_or_else(|| anyhow!("config is missing the [service] section"))?;
        let start_command = non_empty(service.start, "service.start")?;
        let readiness_command = non_empty(service.readiness, "service.readiness")?;

        let mock_port = match env_override(MOCK_PORT_OVERRIDE_ENV)? {
            Some(raw) => raw
                .parse::<u16>()
                .with_context(|| format!("{MOCK_PORT_OVERRIDE_ENV} is not a valid port: {raw}"))?,
            None => file.mock.port.unwrap_or(DEFAULT_MOCK_PORT),
        };

        let threshold = match env_override(MATCH_THRESHOLD_OVERRIDE_ENV)? {
            Some(raw) => raw.parse::<f64>().with_context(|| {
                format!("{MATCH_THRESHOLD_OVERRIDE_ENV} is not a number: {raw}")
            })?,
            None => file.matching.threshold.unwrap_or(DEFAULT_MATCH_THRESHOLD),
        };
        if !(0.0..=1.0).contains(&threshold) {
            anyhow::bail!("match threshold must be within 0.0..=1.0, got {threshold}");
        }

        Ok(Self {
            service: ServiceConfig {
                start_command,
                readiness_command,
                stop_command: service.stop.filter(|s| !s.trim().is_empty()),
                port: service.port.unwrap_or(3000),
            },
            mock: MockConfig {
                host: file.mock.host.unwrap_or(Ipv4Addr::LOCALHOST),
                port: mock_port,
            },
            matching: MatchingConfig { threshold },
            timeouts: TimeoutConfig {
                test_timeout: Duration::from_secs(
                    file.timeouts.test_secs.unwrap_or(DEFAULT_TEST_TIMEOUT_SECS),
                ),
                readiness_timeout: Duration::from_secs(
                    file.timeouts
                        .readiness_secs
                        .unwrap_or(DEFAULT_READINESS_TIMEOUT_SECS),
                ),
                readiness_interval: Duration::from_millis(
                    file.timeouts
                        .readiness_interval_ms
                        .unwrap_or(DEFAULT_READINESS_INTERVAL_MS),
                ),
                stop_grace: Duration::from_secs(
                    file.timeouts.stop_grace_secs.unwrap_or(DEFAULT_STOP_GRACE_SECS),
                ),
            },
        })
    }

}

fn non_empty(value: Option<String>, field: &str) -> Result<String> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(anyhow!("config field {field} is required")),
    }
}

fn env_override(name: &str) -> Result<Option<String>> {
    match std::env::var(name) {
        Ok(raw) => {
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                anyhow::bail!("{name} is set but empty");
            }
            Ok(Some(trimmed.to_string()))
        }
        Err(_) => Ok(None),
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    service: Option<FileService>,
    mock: FileMock,
    matching: FileMatching,
    timeouts: FileTimeouts,
}

#[derive(Debug, Deserialize)]
struct FileService {
    start: Option<String>,
    readiness: Option<String>,
    stop: Option<String>,
    port: Option<u16>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileMock {
    host: Option<Ipv4Addr>,
    port: Option<u16>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileMatching {
    threshold: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileTimeouts {
    test_secs: Option<u64>,
    readiness_secs: Option<u64>,
    readiness_interval_ms: Option<u64>,
    stop_grace_secs: Option<u64>,
}
