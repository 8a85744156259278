// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use anyhow::{Context, Result};
use colored::Colorize;
use std::path::PathBuf;

use elastic_rendezvous::{RendezvousState, RendezvousStatus};

pub async fn execute(config_path: Option<PathBuf>, rdzv_url: Option<String>) -> Result<()> {
    let coordinator = super::connect(config_path, rdzv_url).await?;
    let config = coordinator.config();

    println!("{}", "Rendezvous:".bold());
    println!("  Run ID: {}", config.run_id);
    println!("  Store: {}", config.endpoint.base_url());
    println!("  Workers: {}..={}", config.min_workers, config.max_workers);
    println!();

    let state = coordinator
        .active_state()
        .await
        .context("Failed to read rendezvous state")?;
    let Some(state) = state else {
        println!("{}", "No active rendezvous".dimmed());
        return Ok(());
    };

    let status = state.status();
    let label = match status {
        RendezvousStatus::Final => status.to_string().green(),
        RendezvousStatus::Closed => status.to_string().red(),
        _ => status.to_string().yellow(),
    };
    println!("  Status: {}", label);
    if let Some(version) = state.version() {
        println!("  Version: {}", version);
    }
    if !state.participants().is_empty() {
        println!("  Participants: {}", state.participants().len());
    }
    match &state {
        RendezvousState::Frozen { keep_alives, .. } => {
            println!("  Confirmed: {}", keep_alives.len());
        }
        RendezvousState::Final {
            keep_alives,
            num_workers_waiting,
            ..
        } => {
            println!("  Confirmed: {}", keep_alives.len());
            println!("  Waiting: {}", num_workers_waiting);
        }
        _ => {}
    }

    Ok(())
}
