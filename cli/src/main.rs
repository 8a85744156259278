// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # Elastic Agent CLI
//!
//! The `elastic` binary runs one node of an elastic distributed job.
//!
//! ## Commands
//!
//! - `elastic run -- ENTRYPOINT [ARGS...]` - Rendezvous with peers and supervise local workers
//! - `elastic status` - Show the active rendezvous record
//! - `elastic close` - Mark the job as done
//! - `elastic config validate FILE` - Check an agent configuration file

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use elastic_agent::commands::{self, ConfigCommand, RunArgs};

/// Elastic Agent - Fault-tolerant worker groups for distributed jobs
#[derive(Parser)]
#[command(name = "elastic")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to agent configuration file
    #[arg(
        short,
        long,
        global = true,
        env = "ELASTIC_CONFIG_PATH",
        value_name = "FILE"
    )]
    config: Option<PathBuf>,

    /// Rendezvous URL, e.g. etcd://host:2379/run-id?min_workers=2&max_workers=4
    #[arg(long, global = true, env = "ELASTIC_RDZV_URL", value_name = "URL")]
    rdzv_url: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "ELASTIC_LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Rendezvous and supervise this node's workers
    #[command(name = "run")]
    Run(RunArgs),

    /// Show the active rendezvous record
    #[command(name = "status")]
    Status,

    /// Mark the job as done so no node joins again
    #[command(name = "close")]
    Close,

    /// Configuration management
    #[command(name = "config")]
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_level)?;

    match cli.command {
        Commands::Run(args) => commands::run::execute(args, cli.config, cli.rdzv_url).await,
        Commands::Status => commands::status::execute(cli.config, cli.rdzv_url).await,
        Commands::Close => commands::close::execute(cli.config, cli.rdzv_url).await,
        Commands::Config { command } => commands::config::handle_command(command, cli.config),
    }
}

/// Initialize tracing subscriber for logging
fn init_logging(level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .context("Failed to create log filter")?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();

    Ok(())
}
