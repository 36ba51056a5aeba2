use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "drift",
    about = "Replay recorded traces against a fresh instance of your service",
    version,
    disable_help_subcommand = true
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Replay recorded tests and report deviations
    Run(RunArgs),
    /// List the tests a run would consider, without executing anything
    List(ListArgs),
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Directory of recorded trace files (default: .tusk/traces)
    #[arg(long)]
    pub trace_dir: Option<PathBuf>,

    /// Replay a single local trace file
    #[arg(long, conflicts_with = "trace_dir")]
    pub trace_file: Option<PathBuf>,

    /// Replay only the trace with this id
    #[arg(long)]
    pub trace_id: Option<String>,

    /// Filter expression over root spans, e.g. 'method=GET status=200..299'
    #[arg(long)]
    pub filter: Option<String>,

    /// Parallel test workers
    #[arg(long, default_value_t = 1)]
    pub concurrency: usize,

    /// Per-test timeout in seconds (overrides tusk.toml)
    #[arg(long)]
    pub timeout: Option<u64>,

    /// One-shot mode: print a single JSON result object
    #[arg(long)]
    pub print: bool,

    /// Output format for test results
    #[arg(long, value_name = "FORMAT", default_value = "text")]
    pub output_format: String,

    /// Only report failures and the final summary
    #[arg(long)]
    pub quiet: bool,

    /// Include per-deviation detail in test output
    #[arg(long, conflicts_with = "quiet")]
    pub verbose: bool,

    /// Write one structured result file per test
    #[arg(long)]
    pub save_results: bool,

    /// Where result files go (default: .tusk/results/<timestamp>)
    #[arg(long)]
    pub results_dir: Option<PathBuf>,

    /// Capture service stdout/stderr to the run's log directory
    #[arg(long)]
    pub enable_service_logs: bool,

    /// Load tests from the cloud instead of local trace files
    #[arg(long)]
    pub cloud: bool,

    /// CI mode: create a drift run, stream results, finalize its status
    #[arg(long, requires = "cloud")]
    pub ci: bool,

    /// Replay a single cloud trace test
    #[arg(long, requires = "cloud")]
    pub trace_test_id: Option<String>,

    /// Replay every trace test recorded for the service
    #[arg(long, requires = "cloud")]
    pub all_cloud_trace_tests: bool,

    /// Cloud service id (falls back to TUSK_SERVICE_ID)
    #[arg(long)]
    pub service_id: Option<String>,

    /// Commit to attribute the run to (CI env vars fill this in when unset)
    #[arg(long)]
    pub commit_sha: Option<String>,

    /// Pull/merge request number
    #[arg(long)]
    pub pr_number: Option<u64>,

    /// Branch name
    #[arg(long)]
    pub branch: Option<String>,

    /// Check run to attach the CI status to
    #[arg(long)]
    pub external_check_run_id: Option<String>,

    /// Path to tusk.toml (default: ./tusk.toml)
    #[arg(long)]
    pub config: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct ListArgs {
    /// Directory of recorded trace files (default: .tusk/traces)
    #[arg(long)]
    pub trace_dir: Option<PathBuf>,

    /// List a single local trace file
    #[arg(long, conflicts_with = "trace_dir")]
    pub trace_file: Option<PathBuf>,

    /// Filter expression over root spans
    #[arg(long)]
    pub filter: Option<String>,

    /// Output format
    #[arg(long, value_name = "FORMAT", default_value = "text")]
    pub output_format: String,
}
