//! aslrun entry point.
//!
//! Binary name: `aslrun`
//!
//! Parses CLI arguments, sets up tracing, loads the optional config file,
//! then dispatches to the `run` or `validate` handler. Exits non-zero when a
//! definition is invalid or any execution did not succeed.

mod cli;

use clap::Parser;

use aslrun_observe::tracing_setup::{self, TracingOptions};
use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_setup::init_tracing(&TracingOptions {
        filter: tracing_setup::default_filter(cli.verbose, cli.quiet).to_string(),
        json: cli.json,
        enable_otel: cli.otel,
    })
    .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;

    let config = aslrun_infra::config::load_config(cli.config.as_deref()).await;

    let outcome = match cli.command {
        Commands::Run(args) => cli::run::handle_run(args, &config, cli.json, cli.quiet).await,
        Commands::Validate(args) => cli::validate::handle_validate(args, &config, cli.json).await,
    };

    tracing_setup::shutdown_tracing();

    if !outcome? {
        std::process::exit(1);
    }
    Ok(())
}
