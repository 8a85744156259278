// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use anyhow::{Context, Result};
use colored::Colorize;
use std::path::PathBuf;

pub async fn execute(config_path: Option<PathBuf>, rdzv_url: Option<String>) -> Result<()> {
    let coordinator = super::connect(config_path, rdzv_url).await?;
    coordinator
        .set_closed()
        .await
        .context("Failed to close rendezvous")?;

    println!(
        "{} Rendezvous for run {} closed",
        "✓".green(),
        coordinator.config().run_id.bold()
    );
    Ok(())
}
