// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Ephemeral key ownership.
//!
//! A [`LeaseKeeper`] owns one TTL-bearing key and refreshes it from a
//! background task every `ttl / 2` until it is released or dropped. Each
//! refresh is bounded by the same half-TTL so a slow store can never stall
//! the task past the point where the key would lapse unnoticed.
//!
//! If the key disappears underneath the keeper (expired, deleted with its
//! parent directory) renewal stops quietly.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::domain::store::{CoordinationStore, StoreError};

pub struct LeaseKeeper {
    key: String,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl LeaseKeeper {
    /// Write `key` with `ttl` and start renewing it.
    pub async fn acquire(
        store: Arc<dyn CoordinationStore>,
        key: &str,
        value: Option<&str>,
        ttl: Duration,
    ) -> Result<Self, StoreError> {
        store.set(key, value, Some(ttl)).await?;
        Ok(Self::keep_alive(store, key, ttl))
    }

    /// Start renewing an already existing key. Must be called from within a
    /// tokio runtime.
    pub fn keep_alive(store: Arc<dyn CoordinationStore>, key: &str, ttl: Duration) -> Self {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(renew(store, key.to_string(), ttl, cancel.clone()));
        Self {
            key: key.to_string(),
            cancel,
            task,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Whether the renewal task is still running.
    pub fn is_active(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stop renewing. The key itself is left to expire.
    pub fn release(self) {
        debug!("Releasing lease on {}", self.key);
        // Drop cancels the task.
    }
}

impl Drop for LeaseKeeper {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn renew(
    store: Arc<dyn CoordinationStore>,
    key: String,
    ttl: Duration,
    cancel: CancellationToken,
) {
    let period = ttl / 2;
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            refreshed = tokio::time::timeout(period, store.refresh(&key, ttl)) => match refreshed {
                Ok(Ok(())) => trace!("Refreshed lease {}", key),
                Ok(Err(e)) if e.is_not_found() => {
                    debug!("Lease key {} is gone, stopping renewal", key);
                    break;
                }
                Ok(Err(e)) => warn!("Failed to refresh lease {}: {}", key, e),
                Err(_) => warn!("Refreshing lease {} took longer than {:?}", key, period),
            },
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(period) => {}
        }
    }
}
