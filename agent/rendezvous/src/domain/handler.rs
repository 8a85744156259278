// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

use crate::domain::error::RendezvousError;
use crate::domain::kv::KeyValueStore;

/// Result of a successful rendezvous.
#[derive(Clone)]
pub struct RendezvousOutcome {
    /// Key-value exchange scoped to the agreed version
    pub store: Arc<dyn KeyValueStore>,
    pub rank: u32,
    pub world_size: u32,
    pub version: u64,
}

impl fmt::Debug for RendezvousOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RendezvousOutcome")
            .field("rank", &self.rank)
            .field("world_size", &self.world_size)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

/// What a node supervisor needs from a rendezvous implementation.
#[async_trait]
pub trait RendezvousHandler: Send + Sync {
    /// Block until a ranked group is agreed.
    ///
    /// # Errors
    /// * `RendezvousError::Timeout` when the overall deadline passes
    /// * `RendezvousError::Closed` once the job has been marked done
    /// * `RendezvousError::NonRetryable` on a structural invariant violation
    async fn next_rendezvous(&self) -> Result<RendezvousOutcome, RendezvousError>;

    /// Whether the job has been marked done. False when nothing exists yet.
    async fn is_closed(&self) -> Result<bool, RendezvousError>;

    /// Mark the job done. Idempotent.
    async fn set_closed(&self) -> Result<(), RendezvousError>;

    /// Number of late arrivals waiting on the current final version.
    async fn num_nodes_waiting(&self) -> Result<u32, RendezvousError>;
}
