// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Command implementations for the elastic CLI

pub mod close;
pub mod config;
pub mod run;
pub mod status;

pub use self::config::ConfigCommand;
pub use self::run::RunArgs;

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use elastic_core::AgentConfig;
use elastic_rendezvous::RendezvousCoordinator;

/// Load the agent configuration file if one was given, else defaults.
/// A `--rdzv-url` flag overrides the file.
pub fn load_config(path: Option<&Path>, rdzv_url: Option<String>) -> Result<AgentConfig> {
    let mut config = match path {
        Some(path) => AgentConfig::from_yaml_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => AgentConfig::default(),
    };
    if rdzv_url.is_some() {
        config.rdzv_url = rdzv_url;
    }
    Ok(config)
}

/// Connect to the rendezvous named by the configuration.
pub async fn connect(config_path: Option<PathBuf>, rdzv_url: Option<String>) -> Result<RendezvousCoordinator> {
    let config = load_config(config_path.as_deref(), rdzv_url)?;
    let url = config
        .rdzv_url
        .as_deref()
        .context("No rendezvous URL: pass --rdzv-url or set rdzv_url in the config file")?;
    elastic_rendezvous::connect(url)
        .await
        .with_context(|| format!("Failed to connect to rendezvous at {url}"))
}
