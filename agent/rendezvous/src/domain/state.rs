// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # Rendezvous Version Record
//!
//! The single shared mutable record stored at `/rdzv/active_version`. It is
//! only ever replaced as a whole via compare-and-swap against the raw value
//! previously read, never patched in place.
//!
//! Status and payload are one tagged variant so that, for example, a `Final`
//! record always carries its keep-alive set and waiting counter while a
//! `Joinable` record cannot.
//!
//! ## Lifecycle
//!
//! ```text
//! Setup ──▶ Joinable ──▶ Frozen ──▶ Final ──▶ (deleted, next version starts at Setup)
//!   └──────────┴───────────┴──────────┴──▶ Closed (terminal)
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::domain::store::StoreError;

/// Coarse status of a [`RendezvousState`], used for logging and matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RendezvousStatus {
    Setup,
    Joinable,
    Frozen,
    Final,
    Closed,
}

impl fmt::Display for RendezvousStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RendezvousStatus::Setup => "setup",
            RendezvousStatus::Joinable => "joinable",
            RendezvousStatus::Frozen => "frozen",
            RendezvousStatus::Final => "final",
            RendezvousStatus::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Content of the active rendezvous record.
///
/// `participants[i]` is the join slot of rank `i`; join order determines rank.
/// `keep_alives` holds the absolute lease keys of confirmed participants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum RendezvousState {
    /// Placeholder written while a new version number is being allocated.
    Setup,
    Joinable {
        version: u64,
        participants: Vec<u32>,
    },
    Frozen {
        version: u64,
        participants: Vec<u32>,
        keep_alives: Vec<String>,
    },
    Final {
        version: u64,
        participants: Vec<u32>,
        keep_alives: Vec<String>,
        num_workers_waiting: u32,
    },
    Closed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        version: Option<u64>,
    },
}

impl RendezvousState {
    /// Fresh, empty record for a newly allocated version.
    pub fn joinable(version: u64) -> Self {
        RendezvousState::Joinable {
            version,
            participants: Vec::new(),
        }
    }

    pub fn status(&self) -> RendezvousStatus {
        match self {
            RendezvousState::Setup => RendezvousStatus::Setup,
            RendezvousState::Joinable { .. } => RendezvousStatus::Joinable,
            RendezvousState::Frozen { .. } => RendezvousStatus::Frozen,
            RendezvousState::Final { .. } => RendezvousStatus::Final,
            RendezvousState::Closed { .. } => RendezvousStatus::Closed,
        }
    }

    pub fn version(&self) -> Option<u64> {
        match self {
            RendezvousState::Setup => None,
            RendezvousState::Joinable { version, .. }
            | RendezvousState::Frozen { version, .. }
            | RendezvousState::Final { version, .. } => Some(*version),
            RendezvousState::Closed { version } => *version,
        }
    }

    pub fn participants(&self) -> &[u32] {
        match self {
            RendezvousState::Joinable { participants, .. }
            | RendezvousState::Frozen { participants, .. }
            | RendezvousState::Final { participants, .. } => participants,
            RendezvousState::Setup | RendezvousState::Closed { .. } => &[],
        }
    }

    /// True when the record has the given status for the given version.
    pub fn is(&self, status: RendezvousStatus, version: u64) -> bool {
        self.status() == status && self.version() == Some(version)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, RendezvousState::Closed { .. })
    }

    /// Lock membership: `Joinable` becomes `Frozen` with no confirmations yet.
    /// Any other state is returned unchanged as `Err`.
    pub fn freeze(self) -> Result<Self, Self> {
        match self {
            RendezvousState::Joinable {
                version,
                participants,
            } => Ok(RendezvousState::Frozen {
                version,
                participants,
                keep_alives: Vec::new(),
            }),
            other => Err(other),
        }
    }

    /// Closed keeps the version it was closed at, for diagnostics.
    pub fn close(self) -> Self {
        RendezvousState::Closed {
            version: self.version(),
        }
    }

    pub fn encode(&self) -> Result<String, StoreError> {
        serde_json::to_string(self).map_err(|e| StoreError::Decode(e.to_string()))
    }

    pub fn decode(raw: &str) -> Result<Self, StoreError> {
        serde_json::from_str(raw)
            .map_err(|e| StoreError::Decode(format!("invalid rendezvous record {raw:?}: {e}")))
    }
}
