// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Worker Group Domain Model
//!
//! A node supervises exactly one [`WorkerGroup`]: `local_world_size` workers
//! started from the same [`WorkerSpec`]. The group changes state as a unit.
//!
//! ## Rank Assignment
//!
//! | Field | Scope | Stable across re-rendezvous |
//! |-------|-------|-----------------------------|
//! | `local_rank` | this node | yes |
//! | `group_rank` | node within the job | no |
//! | `global_rank` | worker within the job (`group_rank * local_world_size + local_rank`) | no |

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use elastic_rendezvous::{KeyValueStore, RendezvousHandler};

use crate::domain::error::AgentError;

pub const DEFAULT_ROLE: &str = "default";

/// Return value of one worker. The local process runtime reports exit codes.
pub type WorkerOutput = serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerId(pub String);

impl WorkerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Blueprint of the workers of one role. Identical on every node.
#[derive(Clone)]
pub struct WorkerSpec {
    pub role: String,
    /// Number of workers started on this node
    pub local_world_size: u32,
    /// Program started once per local rank
    pub entrypoint: String,
    pub args: Vec<String>,
    pub rdzv_handler: Arc<dyn RendezvousHandler>,
    /// Restart budget shared by all failure causes except membership growth
    pub max_restarts: u32,
    pub monitor_interval: Duration,
    /// Host advertised as the shared endpoint; the OS host name when `None`
    pub master_addr: Option<String>,
    /// Fixed port for the shared endpoint; a free port is picked when `None`
    pub master_port: Option<u16>,
}

impl WorkerSpec {
    pub fn validate(&self) -> Result<(), AgentError> {
        if self.local_world_size == 0 {
            return Err(AgentError::InvalidSpec(
                "local_world_size must be greater than 0".to_string(),
            ));
        }
        if self.monitor_interval.is_zero() {
            return Err(AgentError::InvalidSpec(
                "monitor_interval must be greater than 0".to_string(),
            ));
        }
        if self.entrypoint.trim().is_empty() {
            return Err(AgentError::InvalidSpec("entrypoint cannot be empty".to_string()));
        }
        if self.master_addr.as_deref().is_some_and(|a| a.trim().is_empty()) {
            return Err(AgentError::InvalidSpec("master_addr cannot be empty".to_string()));
        }
        Ok(())
    }
}

impl fmt::Debug for WorkerSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerSpec")
            .field("role", &self.role)
            .field("local_world_size", &self.local_world_size)
            .field("entrypoint", &self.entrypoint)
            .field("args", &self.args)
            .field("max_restarts", &self.max_restarts)
            .field("monitor_interval", &self.monitor_interval)
            .field("master_addr", &self.master_addr)
            .field("master_port", &self.master_port)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Worker {
    /// Assigned by the runtime once started
    pub id: Option<WorkerId>,
    pub local_rank: u32,
    pub global_rank: Option<u32>,
    pub world_size: Option<u32>,
}

impl Worker {
    pub fn new(local_rank: u32) -> Self {
        Self {
            id: None,
            local_rank,
            global_rank: None,
            world_size: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    /// A lifecycle action was only partially applied
    Unknown,
    Init,
    Healthy,
    Unhealthy,
    Stopped,
    Succeeded,
    Failed,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Unknown => "unknown",
            WorkerState::Init => "init",
            WorkerState::Healthy => "healthy",
            WorkerState::Unhealthy => "unhealthy",
            WorkerState::Stopped => "stopped",
            WorkerState::Succeeded => "succeeded",
            WorkerState::Failed => "failed",
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub struct WorkerGroup {
    pub spec: WorkerSpec,
    pub workers: Vec<Worker>,
    /// Key-value exchange of the current rendezvous version
    pub store: Option<Arc<dyn KeyValueStore>>,
    pub group_rank: Option<u32>,
    pub group_world_size: Option<u32>,
    pub state: WorkerState,
}

impl WorkerGroup {
    pub fn new(spec: WorkerSpec) -> Self {
        let workers = (0..spec.local_world_size).map(Worker::new).collect();
        Self {
            spec,
            workers,
            store: None,
            group_rank: None,
            group_world_size: None,
            state: WorkerState::Init,
        }
    }
}

impl fmt::Debug for WorkerGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerGroup")
            .field("spec", &self.spec)
            .field("workers", &self.workers)
            .field("group_rank", &self.group_rank)
            .field("group_world_size", &self.group_world_size)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

/// Why a single worker is considered failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerFailure {
    pub local_rank: u32,
    pub exit_code: Option<i32>,
    pub message: String,
}

impl fmt::Display for WorkerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "local_rank {}: {}", self.local_rank, self.message)
    }
}

/// Observation of a worker group. Maps are keyed by global rank.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorResult {
    pub state: WorkerState,
    pub return_values: HashMap<u32, WorkerOutput>,
    pub failures: HashMap<u32, WorkerFailure>,
}

impl MonitorResult {
    pub fn new(state: WorkerState) -> Self {
        Self {
            state,
            return_values: HashMap::new(),
            failures: HashMap::new(),
        }
    }

    pub fn succeeded(return_values: HashMap<u32, WorkerOutput>) -> Self {
        Self {
            state: WorkerState::Succeeded,
            return_values,
            failures: HashMap::new(),
        }
    }

    pub fn failed(failures: HashMap<u32, WorkerFailure>) -> Self {
        Self {
            state: WorkerState::Failed,
            return_values: HashMap::new(),
            failures,
        }
    }
}

pub const ENV_LOCAL_RANK: &str = "LOCAL_RANK";
pub const ENV_RANK: &str = "RANK";
pub const ENV_GROUP_RANK: &str = "GROUP_RANK";
pub const ENV_LOCAL_WORLD_SIZE: &str = "LOCAL_WORLD_SIZE";
pub const ENV_WORLD_SIZE: &str = "WORLD_SIZE";
pub const ENV_MASTER_ADDR: &str = "MASTER_ADDR";
pub const ENV_MASTER_PORT: &str = "MASTER_PORT";
pub const ENV_RESTART_COUNT: &str = "TORCHELASTIC_RESTART_COUNT";
pub const ENV_MAX_RESTARTS: &str = "TORCHELASTIC_MAX_RESTARTS";

/// Everything a worker process is told about its place in the job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerEnv {
    pub local_rank: u32,
    pub rank: u32,
    pub group_rank: u32,
    pub local_world_size: u32,
    pub world_size: u32,
    pub master_addr: String,
    pub master_port: u16,
    pub restart_count: u32,
    pub max_restarts: u32,
}

impl WorkerEnv {
    pub fn to_env_vars(&self) -> Vec<(&'static str, String)> {
        vec![
            (ENV_LOCAL_RANK, self.local_rank.to_string()),
            (ENV_RANK, self.rank.to_string()),
            (ENV_GROUP_RANK, self.group_rank.to_string()),
            (ENV_LOCAL_WORLD_SIZE, self.local_world_size.to_string()),
            (ENV_WORLD_SIZE, self.world_size.to_string()),
            (ENV_MASTER_ADDR, self.master_addr.clone()),
            (ENV_MASTER_PORT, self.master_port.to_string()),
            (ENV_RESTART_COUNT, self.restart_count.to_string()),
            (ENV_MAX_RESTARTS, self.max_restarts.to_string()),
        ]
    }
}
