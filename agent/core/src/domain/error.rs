// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use std::collections::HashMap;
use thiserror::Error;

use elastic_rendezvous::{KvError, RendezvousError};

use crate::domain::runtime::RuntimeError;
use crate::domain::worker::{WorkerFailure, WorkerState};

#[derive(Debug, Error)]
pub enum AgentError {
    /// Workers kept failing after the restart budget was spent.
    /// `failures` is keyed by global rank.
    #[error("[{role}] {message}")]
    WorkerGroupFailure {
        role: String,
        message: String,
        failures: HashMap<u32, WorkerFailure>,
    },

    #[error("[{role}] Worker group in {state} state")]
    UnknownState { role: String, state: WorkerState },

    #[error("Rendezvous failed: {0}")]
    Rendezvous(#[from] RendezvousError),

    #[error("Key-value exchange failed: {0}")]
    Exchange(#[from] KvError),

    #[error("Worker runtime failed: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("Invalid worker spec: {0}")]
    InvalidSpec(String),

    #[error("Invalid shared endpoint: {0}")]
    InvalidEndpoint(String),
}

impl AgentError {
    /// Per-rank failures when the group itself failed.
    pub fn worker_failures(&self) -> Option<&HashMap<u32, WorkerFailure>> {
        match self {
            AgentError::WorkerGroupFailure { failures, .. } => Some(failures),
            _ => None,
        }
    }
}
