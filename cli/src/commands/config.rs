// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Configuration management commands
//!
//! Commands: validate

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::path::PathBuf;

use elastic_core::AgentConfig;

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Validate configuration file
    Validate {
        /// Path to config file (default: --config)
        #[arg(value_name = "FILE")]
        file: Option<PathBuf>,
    },
}

pub fn handle_command(command: ConfigCommand, config_override: Option<PathBuf>) -> Result<()> {
    match command {
        ConfigCommand::Validate { file } => validate(file.or(config_override)),
    }
}

fn validate(config_path: Option<PathBuf>) -> Result<()> {
    let path = config_path.context("No configuration file given")?;
    println!("Validating configuration {}...", path.display());

    let config = AgentConfig::from_yaml_file(&path).context("Failed to load configuration")?;
    config
        .validate()
        .context("Configuration validation failed")?;

    println!("{}", "✓ Configuration is valid".green());
    println!("  Role: {}", config.role);
    println!("  Workers per node: {}", config.nproc_per_node);
    println!("  Max restarts: {}", config.max_restarts);
    println!(
        "  Monitor interval: {}",
        humantime::format_duration(config.monitor_interval)
    );
    match &config.rdzv_url {
        Some(url) => println!("  Rendezvous: {}", url),
        None => println!("  Rendezvous: {}", "(not set)".dimmed()),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_validate_accepts_good_file_and_rejects_bad_one() {
        let mut good = tempfile::NamedTempFile::new().unwrap();
        writeln!(good, "nproc_per_node: 2\nmonitor_interval: 1s").unwrap();
        assert!(validate(Some(good.path().to_path_buf())).is_ok());

        let mut bad = tempfile::NamedTempFile::new().unwrap();
        writeln!(bad, "nproc_per_node: 0").unwrap();
        assert!(validate(Some(bad.path().to_path_buf())).is_err());

        assert!(validate(None).is_err());
    }
}
