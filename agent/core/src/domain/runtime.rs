// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;

use crate::domain::worker::{MonitorResult, WorkerEnv, WorkerGroup, WorkerId};

/// Places worker processes somewhere and reports on them.
///
/// The supervisor never touches processes directly; alternative placement
/// strategies implement this trait.
#[async_trait]
pub trait WorkerRuntime: Send + Sync {
    /// Start one worker per entry of `envs` (indexed by local rank).
    ///
    /// # Returns
    /// * local rank -> runtime-specific worker id
    async fn start_workers(
        &self,
        group: &WorkerGroup,
        envs: &[WorkerEnv],
    ) -> Result<HashMap<u32, WorkerId>, RuntimeError>;

    /// Stop every worker of the group. Workers that already exited are fine.
    async fn stop_workers(&self, group: &WorkerGroup) -> Result<(), RuntimeError>;

    /// Observe the group without blocking.
    async fn monitor_workers(&self, group: &WorkerGroup) -> Result<MonitorResult, RuntimeError>;
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Failed to spawn worker: {0}")]
    SpawnFailed(String),

    #[error("Failed to terminate worker: {0}")]
    TerminationFailed(String),

    #[error("Failed to monitor workers: {0}")]
    MonitorFailed(String),
}
