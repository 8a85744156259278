// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use thiserror::Error;

use crate::domain::config::ConfigError;
use crate::domain::kv::KvError;
use crate::domain::store::StoreError;

/// Terminal outcomes of a rendezvous attempt. Contention on the shared
/// record is retried internally and never surfaces here.
#[derive(Debug, Error)]
pub enum RendezvousError {
    #[error("Rendezvous timed out")]
    Timeout,

    #[error("Rendezvous is closed")]
    Closed,

    /// An invariant was violated; retrying under the same identity is unsafe.
    #[error("Non-retryable rendezvous error: {0}")]
    NonRetryable(String),

    #[error("Coordination store error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Key-value exchange error: {0}")]
    Exchange(#[from] KvError),
}
