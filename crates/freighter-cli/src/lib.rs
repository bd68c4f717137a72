//! Freighter CLI Library
//!
//! Command-line front end for the transport pipeline: loads a YAML
//! configuration, connects the configured storage backends, and runs the
//! pipeline.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

pub mod commands;
pub mod config;
pub mod error;

pub use error::{CliError, Result};

/// Freighter: transport web-API data into your storage
#[derive(Debug, Parser)]
#[command(name = "freighter", version, about)]
pub struct Cli {
    /// Enable verbose (debug-level) logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the transport described by a config file
    Run {
        /// Path to the YAML config file
        #[arg(short, long, env = "FREIGHTER_CONFIG")]
        config: PathBuf,

        /// Override the worker count
        #[arg(long)]
        workers: Option<usize>,

        /// Parse and flatten only; no network or storage I/O
        #[arg(long)]
        dry_run: bool,
    },

    /// Validate a config file without running it
    Validate {
        /// Path to the YAML config file
        #[arg(short, long, env = "FREIGHTER_CONFIG")]
        config: PathBuf,
    },
}
