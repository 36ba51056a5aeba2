use crate::commands::RunArgs;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use drift_common::{CiMetadata, DriftConfig};
use drift_replay::OutputFormat;
use std::path::PathBuf;
use std::time::Duration;

pub const API_URL_ENV: &str = "TUSK_API_URL";
pub const API_KEY_ENV: &str = "TUSK_API_KEY";
pub const SERVICE_ID_ENV: &str = "TUSK_SERVICE_ID";
const DEFAULT_API_URL: &str = "https://api.usetusk.ai/";

/// Everything the run path needs, resolved once from flags, environment,
/// and `tusk.toml`. Nothing below the CLI reads globals.
pub struct RunOptions {
    pub config: DriftConfig,
    pub started_at: DateTime<Utc>,
    pub trace_dir: PathBuf,
    pub trace_file: Option<PathBuf>,
    pub trace_id: Option<String>,
    pub filter: Option<String>,
    pub concurrency: usize,
    pub test_timeout: Option<Duration>,
    pub output_format: OutputFormat,
    pub quiet: bool,
    pub verbose: bool,
    pub print: bool,
    pub results_dir: Option<PathBuf>,
    pub enable_service_logs: bool,
    pub log_dir: PathBuf,
    pub cloud: Option<CloudOptions>,
}

pub struct CloudOptions {
    pub api_url: String,
    pub api_key: String,
    pub service_id: String,
    pub ci: bool,
    pub ci_metadata: CiMetadata,
    pub trace_test_id: Option<String>,
    pub all_trace_tests: bool,
}

impl RunOptions {
    pub fn from_args(args: &RunArgs) -> Result<Self> {
        let config = DriftConfig::load(args.config.clone())?;
        let started_at = Utc::now();

        let output_format: OutputFormat = args.output_format.parse()?;

        let trace_dir = match &args.trace_dir {
            Some(dir) => dir.clone(),
            None => drift_common::paths::traces_dir()?,
        };

        let results_dir = if args.save_results || args.results_dir.is_some() {
            Some(match &args.results_dir {
                Some(dir) => dir.clone(),
                None => drift_common::paths::results_dir(started_at)?,
            })
        } else {
            None
        };

        let cloud = if args.cloud {
            let api_key = std::env::var(API_KEY_ENV)
                .with_context(|| format!("--cloud requires {API_KEY_ENV} to be set"))?;
            let api_url =
                std::env::var(API_URL_ENV).unwrap_or_else(|_| DEFAULT_API_URL.to_string());
            let service_id = args
                .service_id
                .clone()
                .or_else(|| std::env::var(SERVICE_ID_ENV).ok())
                .with_context(|| {
                    format!("--cloud requires --service-id or {SERVICE_ID_ENV}")
                })?;
            let ci_metadata = CiMetadata::detect()?.with_overrides(
                args.commit_sha.clone(),
                args.branch.clone(),
                args.pr_number,
                args.external_check_run_id.clone(),
            );
            Some(CloudOptions {
                api_url,
                api_key,
                service_id,
                ci: args.ci,
                ci_metadata,
                trace_test_id: args.trace_test_id.clone(),
                all_trace_tests: args.all_cloud_trace_tests,
            })
        } else {
            None
        };

        Ok(Self {
            config,
            started_at,
            trace_dir,
            trace_file: args.trace_file.clone(),
            trace_id: args.trace_id.clone(),
            filter: args.filter.clone(),
            concurrency: args.concurrency.max(1),
            test_timeout: args.timeout.map(Duration::from_secs),
            output_format,
            quiet: args.quiet,
            verbose: args.verbose,
            print: args.print,
            results_dir,
            enable_service_logs: args.enable_service_logs,
            log_dir: drift_common::paths::logs_dir()?,
            cloud,
        })
    }

    /// JSON output owns stdout, and `--quiet` asks for silence: both
    /// suppress the stderr log layer.
    pub fn suppress_stderr_logs(&self) -> bool {
        self.quiet || self.print
    }
}
