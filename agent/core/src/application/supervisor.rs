// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Worker Group Supervisor
//!
//! Drives the node's [`WorkerGroup`] through its lifecycle: rendezvous, start,
//! monitor every `monitor_interval`, restart within budget, give up.
//!
//! ## Monitor Decision Table
//! | Observed state | Action |
//! |----------------|--------|
//! | `Succeeded` | return the per-rank results |
//! | `Unhealthy` / `Failed`, budget left | spend one restart, stop, re-rendezvous, start |
//! | `Unhealthy` / `Failed`, budget spent | stop, mark `Failed`, raise group failure |
//! | `Healthy`, late joiners waiting | stop, re-rendezvous, start (budget untouched) |
//! | `Healthy` | keep monitoring |
//! | anything else | fatal, no recovery |
//!
//! A rendezvous, start or stop that fails midway leaves the group `Unknown`
//! and the error propagates; the node is expected to be restarted from
//! outside.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info};

use elastic_rendezvous::KeyValueStore;

use crate::domain::error::AgentError;
use crate::domain::runtime::WorkerRuntime;
use crate::domain::worker::{
    WorkerEnv, WorkerGroup, WorkerOutput, WorkerSpec, WorkerState, ENV_MASTER_ADDR,
    ENV_MASTER_PORT,
};

pub const METRIC_REMAINING_RESTARTS: &str = "elastic_agent_remaining_restarts";
pub const METRIC_WORKER_GROUP_STATE: &str = "elastic_agent_worker_group_state_total";

pub struct Supervisor {
    runtime: Arc<dyn WorkerRuntime>,
    group: WorkerGroup,
    remaining_restarts: u32,
}

impl Supervisor {
    pub fn new(spec: WorkerSpec, runtime: Arc<dyn WorkerRuntime>) -> Result<Self, AgentError> {
        spec.validate()?;
        let remaining_restarts = spec.max_restarts;
        Ok(Self {
            runtime,
            group: WorkerGroup::new(spec),
            remaining_restarts,
        })
    }

    pub fn worker_group(&self) -> &WorkerGroup {
        &self.group
    }

    pub fn remaining_restarts(&self) -> u32 {
        self.remaining_restarts
    }

    pub fn restart_count(&self) -> u32 {
        self.group.spec.max_restarts - self.remaining_restarts
    }

    /// Run the worker group to completion.
    ///
    /// # Returns
    /// * global rank -> worker output, once every worker succeeded
    ///
    /// # Errors
    /// * `AgentError::WorkerGroupFailure` when the restart budget is spent
    /// * `AgentError::UnknownState` when the group ends up in a state that
    ///   cannot be recovered here
    /// * rendezvous / runtime errors, with the group left `Unknown`
    pub async fn run(&mut self) -> Result<HashMap<u32, WorkerOutput>, AgentError> {
        let role = self.group.spec.role.clone();
        let monitor_interval = self.group.spec.monitor_interval;
        let max_restarts = self.group.spec.max_restarts;
        let rdzv_handler = self.group.spec.rdzv_handler.clone();

        info!(
            "[{}] starting workers for entrypoint: {}",
            role, self.group.spec.entrypoint
        );
        self.initialize_workers().await?;

        loop {
            tokio::time::sleep(monitor_interval).await;

            let monitored = self.runtime.monitor_workers(&self.group).await;
            let result = self.mark_unknown_on_err(monitored)?;
            let state = result.state;
            self.group.state = state;
            self.record_metrics(state);

            match state {
                WorkerState::Succeeded => {
                    info!("[{}] All workers successfully finished.", role);
                    return Ok(result.return_values);
                }
                WorkerState::Unhealthy | WorkerState::Failed => {
                    if self.remaining_restarts > 0 {
                        info!(
                            "[{}] Worker group {}. {}/{} attempts left; will restart worker group",
                            role, state, self.remaining_restarts, max_restarts
                        );
                        self.remaining_restarts -= 1;
                        self.restart_workers().await?;
                    } else {
                        self.stop_workers().await?;
                        self.group.state = WorkerState::Failed;
                        error!(
                            "[{}] Worker group {} with no restarts left",
                            role, state
                        );
                        return Err(AgentError::WorkerGroupFailure {
                            role,
                            message: format!("exceeded max_restarts={max_restarts}"),
                            failures: result.failures,
                        });
                    }
                }
                WorkerState::Healthy => {
                    let waiting = rdzv_handler.num_nodes_waiting().await;
                    let num_nodes_waiting = self.mark_unknown_on_err(waiting)?;
                    if num_nodes_waiting > 0 {
                        info!(
                            "[{}] Detected {} new nodes from group_rank={}; will restart worker group",
                            role,
                            num_nodes_waiting,
                            self.group.group_rank.unwrap_or_default()
                        );
                        self.restart_workers().await?;
                    }
                }
                WorkerState::Unknown | WorkerState::Init | WorkerState::Stopped => {
                    error!("[{}] Worker group in {} state", role, state);
                    return Err(AgentError::UnknownState { role, state });
                }
            }
        }
    }

    async fn initialize_workers(&mut self) -> Result<(), AgentError> {
        let role = self.group.spec.role.clone();

        info!("[{}] Rendezvous'ing worker group", role);
        let endpoint = self.rendezvous().await;
        let (master_addr, master_port) = self.mark_unknown_on_err(endpoint)?;

        info!("[{}] Starting worker group", role);
        let envs = self.worker_envs(&master_addr, master_port);
        let started = self.runtime.start_workers(&self.group, &envs).await;
        let worker_ids = self.mark_unknown_on_err(started)?;
        for (local_rank, id) in worker_ids {
            if let Some(worker) = self.group.workers.get_mut(local_rank as usize) {
                worker.id = Some(id);
            }
        }

        // Actual health is established by the next monitor step.
        self.group.state = WorkerState::Healthy;
        Ok(())
    }

    async fn restart_workers(&mut self) -> Result<(), AgentError> {
        info!("[{}] Stopping worker group", self.group.spec.role);
        self.stop_workers().await?;
        self.group.state = WorkerState::Stopped;
        self.initialize_workers().await
    }

    async fn stop_workers(&mut self) -> Result<(), AgentError> {
        let stopped = self.runtime.stop_workers(&self.group).await;
        self.mark_unknown_on_err(stopped)?;
        Ok(())
    }

    /// Join the next rendezvous and assign ranks. Returns the shared endpoint.
    async fn rendezvous(&mut self) -> Result<(String, u16), AgentError> {
        let spec = &self.group.spec;
        let stride = spec.local_world_size;
        let outcome = spec.rdzv_handler.next_rendezvous().await?;
        let world_size = outcome.world_size * stride;

        if outcome.rank == 0 {
            set_master_addr_port(
                outcome.store.as_ref(),
                spec.master_addr.as_deref(),
                spec.master_port,
            )
            .await?;
        }

        let mut assigned_global_ranks = Vec::with_capacity(self.group.workers.len());
        for worker in &mut self.group.workers {
            let global_rank = outcome.rank * stride + worker.local_rank;
            worker.global_rank = Some(global_rank);
            worker.world_size = Some(world_size);
            assigned_global_ranks.push(global_rank);
        }

        let (master_addr, master_port) = get_master_addr_port(outcome.store.as_ref()).await?;
        info!(
            "[{}] Rendezvous complete for workers. Result: restart_count={} group_rank={} \
             group_world_size={} rank stride={} assigned global_ranks={:?} \
             master_addr={} master_port={}",
            self.group.spec.role,
            self.restart_count(),
            outcome.rank,
            outcome.world_size,
            stride,
            assigned_global_ranks,
            master_addr,
            master_port
        );

        self.group.store = Some(outcome.store);
        self.group.group_rank = Some(outcome.rank);
        self.group.group_world_size = Some(outcome.world_size);
        Ok((master_addr, master_port))
    }

    fn worker_envs(&self, master_addr: &str, master_port: u16) -> Vec<WorkerEnv> {
        let spec = &self.group.spec;
        self.group
            .workers
            .iter()
            .map(|worker| WorkerEnv {
                local_rank: worker.local_rank,
                rank: worker.global_rank.unwrap_or_default(),
                group_rank: self.group.group_rank.unwrap_or_default(),
                local_world_size: spec.local_world_size,
                world_size: worker.world_size.unwrap_or_default(),
                master_addr: master_addr.to_string(),
                master_port,
                restart_count: self.restart_count(),
                max_restarts: spec.max_restarts,
            })
            .collect()
    }

    fn mark_unknown_on_err<T, E>(&mut self, result: Result<T, E>) -> Result<T, E> {
        if result.is_err() {
            self.group.state = WorkerState::Unknown;
        }
        result
    }

    fn record_metrics(&self, state: WorkerState) {
        let role = self.group.spec.role.clone();
        metrics::gauge!(METRIC_REMAINING_RESTARTS, "role" => role.clone())
            .set(f64::from(self.remaining_restarts));
        metrics::counter!(METRIC_WORKER_GROUP_STATE, "role" => role, "state" => state.as_str())
            .increment(1);
    }
}

/// Publish this node as the shared endpoint. Only group rank 0 does this.
///
/// The advertised host is `master_addr` when configured, else the OS host
/// name as-is. Peers must be able to resolve that name; clusters whose
/// nodes only know each other by a qualified name or an address configure
/// `master_addr` explicitly.
async fn set_master_addr_port(
    store: &dyn KeyValueStore,
    master_addr: Option<&str>,
    master_port: Option<u16>,
) -> Result<(), AgentError> {
    let port = match master_port {
        Some(port) => port,
        None => free_port().await?,
    };
    let host = match master_addr {
        Some(addr) => addr.to_string(),
        None => hostname::get()
            .map_err(|e| AgentError::InvalidEndpoint(format!("cannot resolve hostname: {e}")))?
            .to_string_lossy()
            .into_owned(),
    };

    store.set(ENV_MASTER_ADDR, host.as_bytes()).await?;
    store.set(ENV_MASTER_PORT, port.to_string().as_bytes()).await?;
    Ok(())
}

async fn get_master_addr_port(store: &dyn KeyValueStore) -> Result<(String, u16), AgentError> {
    let addr = String::from_utf8(store.get(ENV_MASTER_ADDR).await?)
        .map_err(|e| AgentError::InvalidEndpoint(format!("{ENV_MASTER_ADDR} is not UTF-8: {e}")))?;
    let raw_port = store.get(ENV_MASTER_PORT).await?;
    let port = std::str::from_utf8(&raw_port)
        .ok()
        .and_then(|p| p.parse().ok())
        .ok_or_else(|| {
            AgentError::InvalidEndpoint(format!(
                "{ENV_MASTER_PORT} is not a port number: {:?}",
                String::from_utf8_lossy(&raw_port)
            ))
        })?;
    Ok((addr, port))
}

/// Ask the OS for a currently unused local port.
async fn free_port() -> Result<u16, AgentError> {
    let listener = tokio::net::TcpListener::bind(("localhost", 0))
        .await
        .map_err(|e| AgentError::InvalidEndpoint(format!("no free local port: {e}")))?;
    let addr = listener
        .local_addr()
        .map_err(|e| AgentError::InvalidEndpoint(format!("no free local port: {e}")))?;
    Ok(addr.port())
}
