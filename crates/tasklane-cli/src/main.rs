//! tasklane CLI entry point.
//!
//! Binary name: `tasklane`
//!
//! Parses CLI arguments, sets up tracing, loads the engine configuration and
//! dispatches to the command handler.

mod cli;

use clap::Parser;

use cli::crawl::CrawlOptions;
use cli::{Cli, Commands};
use tasklane_infra::config::{load_config, resolve_config_path};
use tasklane_observe::tracing_setup::{init_tracing, shutdown_tracing, verbosity_filter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_tracing(verbosity_filter(cli.verbose, cli.quiet), cli.otel)
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;

    let config_path = resolve_config_path(cli.config.as_deref());

    let result = match cli.command {
        Commands::Crawl {
            seeds,
            depth,
            fanout,
            flaky_every,
            parallel,
            strict,
            json,
        } => {
            let config = load_config(&config_path).await;
            let options = CrawlOptions {
                seeds,
                depth,
                fanout,
                flaky_every,
                parallel,
                strict,
            };
            cli::crawl::run_crawl(&config, &options, json).await
        }

        Commands::Config => cli::config::show_config(&config_path).await,
    };

    shutdown_tracing();
    result
}
