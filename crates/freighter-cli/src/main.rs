//! Freighter CLI - Main entry point

use clap::Parser;
use freighter_cli::{commands, Cli, Commands};
use freighter_common::logging::{init_logging, LogConfig, LogLevel};
use std::process;
use tracing::error;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_config = LogConfig::from_env().unwrap_or_else(|_| LogConfig::new());
    let log_config = if cli.verbose {
        log_config.with_level(LogLevel::Debug)
    } else {
        log_config
    };

    // The CLI still works if logging fails to come up.
    let _ = init_logging(&log_config);

    let result = match &cli.command {
        Commands::Run {
            config,
            workers,
            dry_run,
        } => commands::run(config, *workers, *dry_run).await,
        Commands::Validate { config } => commands::validate(config),
    };

    if let Err(e) = result {
        error!(error = %e, "command failed");
        eprintln!("Error: {e}");
        process::exit(1);
    }
}
