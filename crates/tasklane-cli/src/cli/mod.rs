//! CLI command definitions for the `tasklane` binary.

pub mod config;
pub mod crawl;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Run step pipelines on the tasklane engine.
#[derive(Parser)]
#[command(name = "tasklane", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Suppress all output except errors.
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Export task and step spans as OpenTelemetry traces on stdout.
    #[arg(long, global = true)]
    pub otel: bool,

    /// Configuration file (defaults to ./tasklane.toml).
    #[arg(long, global = true, env = "TASKLANE_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a simulated web crawl as a tree of page tasks.
    Crawl {
        /// Number of seed pages.
        #[arg(long, default_value_t = 3)]
        seeds: usize,

        /// Link depth to follow from each seed.
        #[arg(long, default_value_t = 2)]
        depth: u32,

        /// Links discovered per page.
        #[arg(long, default_value_t = 2)]
        fanout: usize,

        /// Fail the first fetch of every Nth page (0 disables).
        #[arg(long, default_value_t = 3)]
        flaky_every: u64,

        /// Override the configured parallel limit.
        #[arg(long)]
        parallel: Option<usize>,

        /// Fail pages whose fetch still times out after the last retry.
        #[arg(long)]
        strict: bool,

        /// Output machine-readable JSON instead of a table.
        #[arg(long)]
        json: bool,
    },

    /// Print the effective configuration as TOML.
    Config,
}
