//! `drift` command-line entry points
//!
//! The CLI layer is the only code that reads flags and environment; it
//! assembles explicit options for everything below it, wires cancellation
//! and cleanup, and turns run outcomes into process exit codes.

mod cleanup;
mod cloud;
mod commands;
mod list;
mod logging;
mod options;
mod run;

use clap::Parser;
use commands::{Cli, Commands};

pub fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    let exit_code = runtime.block_on(async {
        match cli.command {
            Commands::Run(args) => run::run(args).await,
            Commands::List(args) => list::list(args).await,
        }
    })?;

    // The logging worker guard has been dropped by now, so buffered log
    // lines are on disk before the process dies.
    std::process::exit(exit_code)
}
