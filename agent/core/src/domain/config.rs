// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Agent Configuration
//
// Optional YAML file describing how one node runs its workers:
//
//   role: trainer
//   nproc_per_node: 4
//   max_restarts: 3
//   monitor_interval: 5s
//   master_addr: node-0.cluster.internal
//   master_port: 29500
//   rdzv_url: etcd://etcd.internal:2379/job-42?min_workers=2&max_workers=8
//   entrypoint: python
//   args: ["train.py", "--epochs", "90"]
//
// Command line flags override individual fields.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use elastic_rendezvous::domain::config::ConfigError as UrlError;
use elastic_rendezvous::{RendezvousConfig, RendezvousHandler};

use crate::domain::worker::{WorkerSpec, DEFAULT_ROLE};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error(transparent)]
    InvalidUrl(#[from] UrlError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
    #[serde(default = "default_role")]
    pub role: String,

    /// Workers started on this node
    #[serde(default = "default_nproc_per_node")]
    pub nproc_per_node: u32,

    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,

    #[serde(default = "default_monitor_interval", with = "humantime_serde")]
    pub monitor_interval: Duration,

    /// Host advertised to peers by group rank 0; the OS host name when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master_addr: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master_port: Option<u16>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rdzv_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
}

fn default_role() -> String {
    DEFAULT_ROLE.to_string()
}

fn default_nproc_per_node() -> u32 {
    1
}

fn default_max_restarts() -> u32 {
    3
}

fn default_monitor_interval() -> Duration {
    Duration::from_secs(5)
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            role: default_role(),
            nproc_per_node: default_nproc_per_node(),
            max_restarts: default_max_restarts(),
            monitor_interval: default_monitor_interval(),
            master_addr: None,
            master_port: None,
            rdzv_url: None,
            entrypoint: None,
            args: Vec::new(),
        }
    }
}

impl AgentConfig {
    pub fn from_yaml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(raw)?)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.role.trim().is_empty() {
            return Err(ConfigError::Invalid("role cannot be empty".to_string()));
        }
        if self.nproc_per_node == 0 {
            return Err(ConfigError::Invalid(
                "nproc_per_node must be greater than 0".to_string(),
            ));
        }
        if self.monitor_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "monitor_interval must be greater than 0".to_string(),
            ));
        }
        if let Some(url) = &self.rdzv_url {
            RendezvousConfig::from_url(url)?;
        }
        if self.master_addr.as_deref().is_some_and(|a| a.trim().is_empty()) {
            return Err(ConfigError::Invalid("master_addr cannot be empty".to_string()));
        }
        if self.entrypoint.as_deref().is_some_and(|e| e.trim().is_empty()) {
            return Err(ConfigError::Invalid("entrypoint cannot be empty".to_string()));
        }
        Ok(())
    }

    /// Parsed rendezvous configuration.
    pub fn rendezvous_config(&self) -> Result<RendezvousConfig, ConfigError> {
        let url = self
            .rdzv_url
            .as_deref()
            .ok_or_else(|| ConfigError::Invalid("rdzv_url is required".to_string()))?;
        Ok(RendezvousConfig::from_url(url)?)
    }

    /// Worker spec for this node, rendezvousing through `rdzv_handler`.
    pub fn worker_spec(
        &self,
        rdzv_handler: Arc<dyn RendezvousHandler>,
    ) -> Result<WorkerSpec, ConfigError> {
        self.validate()?;
        let entrypoint = self
            .entrypoint
            .clone()
            .ok_or_else(|| ConfigError::Invalid("entrypoint is required".to_string()))?;
        Ok(WorkerSpec {
            role: self.role.clone(),
            local_world_size: self.nproc_per_node,
            entrypoint,
            args: self.args.clone(),
            rdzv_handler,
            max_restarts: self.max_restarts,
            monitor_interval: self.monitor_interval,
            master_addr: self.master_addr.clone(),
            master_port: self.master_port,
        })
    }
}
