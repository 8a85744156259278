// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Elastic Agent Core
//!
//! Supervises one node's worker group for an elastic distributed job.
//!
//! # Architecture
//!
//! - **domain:** worker group model, environment contract, runtime trait, errors, configuration
//! - **application:** the supervisor loop (rendezvous, start, monitor, restart)
//! - **infrastructure:** local child-process runtime

pub mod application;
pub mod domain;
pub mod infrastructure;

pub use application::Supervisor;
pub use domain::config::{AgentConfig, ConfigError};
pub use domain::error::AgentError;
pub use domain::runtime::{RuntimeError, WorkerRuntime};
pub use domain::worker::{
    MonitorResult, Worker, WorkerEnv, WorkerFailure, WorkerGroup, WorkerId, WorkerOutput,
    WorkerSpec, WorkerState,
};
pub use infrastructure::LocalProcessRuntime;
