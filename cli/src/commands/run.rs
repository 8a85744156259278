// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! `elastic run`: supervise this node's worker group until it succeeds or
//! runs out of restarts.

use anyhow::{bail, Context, Result};
use clap::Args;
use colored::Colorize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use elastic_core::{
    AgentConfig, AgentError, LocalProcessRuntime, Supervisor, WorkerFailure, WorkerOutput,
};
use elastic_rendezvous::{EtcdV2Store, RendezvousCoordinator};

use super::load_config;

#[derive(Args, Debug, Default)]
pub struct RunArgs {
    /// Workers started on this node
    #[arg(long, env = "ELASTIC_NPROC_PER_NODE")]
    pub nproc_per_node: Option<u32>,

    /// Restarts allowed before the worker group is declared failed
    #[arg(long, env = "ELASTIC_MAX_RESTARTS")]
    pub max_restarts: Option<u32>,

    /// How often workers are checked, e.g. 5s or 500ms
    #[arg(long, env = "ELASTIC_MONITOR_INTERVAL", value_parser = humantime::parse_duration)]
    pub monitor_interval: Option<Duration>,

    /// Role name of this worker group
    #[arg(long, env = "ELASTIC_ROLE")]
    pub role: Option<String>,

    /// Host advertised to peers when this node is group rank 0 (default: host name)
    #[arg(long, env = "ELASTIC_MASTER_ADDR")]
    pub master_addr: Option<String>,

    /// Fixed port for the shared endpoint (default: a free port)
    #[arg(long, env = "ELASTIC_MASTER_PORT")]
    pub master_port: Option<u16>,

    /// Serve Prometheus metrics on this address
    #[arg(long, env = "ELASTIC_METRICS_ADDR", value_name = "ADDR")]
    pub metrics_addr: Option<SocketAddr>,

    /// Worker program and its arguments
    #[arg(last = true, value_name = "ENTRYPOINT")]
    pub command: Vec<String>,
}

impl RunArgs {
    /// Overlay command line values on the file configuration.
    pub fn apply(self, config: &mut AgentConfig) {
        if let Some(nproc) = self.nproc_per_node {
            config.nproc_per_node = nproc;
        }
        if let Some(max_restarts) = self.max_restarts {
            config.max_restarts = max_restarts;
        }
        if let Some(interval) = self.monitor_interval {
            config.monitor_interval = interval;
        }
        if let Some(role) = self.role {
            config.role = role;
        }
        if self.master_addr.is_some() {
            config.master_addr = self.master_addr;
        }
        if self.master_port.is_some() {
            config.master_port = self.master_port;
        }
        let mut command = self.command.into_iter();
        if let Some(entrypoint) = command.next() {
            config.entrypoint = Some(entrypoint);
            config.args = command.collect();
        }
    }
}

pub async fn execute(
    args: RunArgs,
    config_path: Option<PathBuf>,
    rdzv_url: Option<String>,
) -> Result<()> {
    let mut config = load_config(config_path.as_deref(), rdzv_url)?;
    if let Some(addr) = args.metrics_addr {
        install_metrics_exporter(addr)?;
    }
    args.apply(&mut config);
    config.validate().context("Configuration validation failed")?;

    let rdzv_config = config.rendezvous_config()?;
    let store = EtcdV2Store::new(&rdzv_config.endpoint)?;
    let coordinator = Arc::new(
        RendezvousCoordinator::connect(Arc::new(store), rdzv_config)
            .await
            .context("Failed to connect to rendezvous")?,
    );

    let spec = config.worker_spec(coordinator.clone())?;
    let mut supervisor = Supervisor::new(spec, Arc::new(LocalProcessRuntime::new()))?;

    match supervisor.run().await {
        Ok(outputs) => {
            println!("{}", "✓ All workers finished successfully".green());
            print_outputs(&outputs);
            if let Err(e) = coordinator.set_closed().await {
                warn!("Failed to close rendezvous: {}", e);
            } else {
                info!("Rendezvous closed");
            }
            Ok(())
        }
        Err(AgentError::WorkerGroupFailure {
            role,
            message,
            failures,
        }) => {
            eprintln!("{} [{}] {}", "✗".red(), role, message);
            print_failures(&failures);
            bail!("Worker group {role} failed");
        }
        Err(e) => Err(e).context("Worker group supervision failed"),
    }
}

fn install_metrics_exporter(addr: SocketAddr) -> Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")?;
    info!("Serving metrics on http://{}/metrics", addr);
    Ok(())
}

fn print_outputs(outputs: &HashMap<u32, WorkerOutput>) {
    let mut ranks: Vec<_> = outputs.keys().copied().collect();
    ranks.sort_unstable();
    for rank in ranks {
        println!("  rank {}: {}", rank, outputs[&rank]);
    }
}

fn print_failures(failures: &HashMap<u32, WorkerFailure>) {
    let mut ranks: Vec<_> = failures.keys().copied().collect();
    ranks.sort_unstable();
    for rank in ranks {
        let failure = &failures[&rank];
        let code = failure
            .exit_code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "-".to_string());
        eprintln!(
            "  rank {} (local_rank {}, exit code {}): {}",
            rank,
            failure.local_rank,
            code,
            failure.message.dimmed()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_file_values() {
        let mut config = AgentConfig {
            nproc_per_node: 4,
            entrypoint: Some("python".to_string()),
            args: vec!["old.py".to_string()],
            ..AgentConfig::default()
        };
        RunArgs {
            max_restarts: Some(0),
            master_addr: Some("10.0.0.7".to_string()),
            monitor_interval: Some(Duration::from_millis(250)),
            command: vec!["torchrun".to_string(), "train.py".to_string()],
            ..RunArgs::default()
        }
        .apply(&mut config);

        assert_eq!(config.nproc_per_node, 4);
        assert_eq!(config.max_restarts, 0);
        assert_eq!(config.master_addr.as_deref(), Some("10.0.0.7"));
        assert_eq!(config.monitor_interval, Duration::from_millis(250));
        assert_eq!(config.entrypoint.as_deref(), Some("torchrun"));
        assert_eq!(config.args, vec!["train.py".to_string()]);
    }

    #[test]
    fn test_empty_command_keeps_file_entrypoint() {
        let mut config = AgentConfig {
            entrypoint: Some("python".to_string()),
            args: vec!["train.py".to_string()],
            ..AgentConfig::default()
        };
        RunArgs::default().apply(&mut config);
        assert_eq!(config.entrypoint.as_deref(), Some("python"));
        assert_eq!(config.args, vec!["train.py".to_string()]);
    }
}
