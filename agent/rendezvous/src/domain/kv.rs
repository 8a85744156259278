// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Key-Value Store Trait
//!
//! Small shared key-value surface handed out by a successful rendezvous.
//! Participants of one rendezvous version use it to publish and read
//! job-wide facts such as the shared endpoint (`MASTER_ADDR` / `MASTER_PORT`).

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

use crate::domain::store::StoreError;

#[derive(Debug, Error)]
pub enum KvError {
    #[error("Key not found: {key}")]
    NotFound { key: String },

    #[error("Timed out waiting for keys: {keys:?}")]
    Timeout { keys: Vec<String> },

    #[error("Value of key {key} is not a base-10 counter")]
    InvalidCounter { key: String },

    #[error("Failed to decode stored entry: {0}")]
    Decode(String),

    #[error("Coordination store error: {0}")]
    Store(#[from] StoreError),
}

/// Keys and values are opaque byte strings.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Write a key (durable).
    async fn set(&self, key: &str, value: &[u8]) -> Result<(), KvError>;

    /// Write a key that expires after `ttl` unless refreshed.
    async fn set_with_ttl(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), KvError>;

    /// Read a key, blocking until it is present or the wait timeout elapses.
    ///
    /// # Errors
    /// * `KvError::NotFound` if the key did not appear in time
    async fn get(&self, key: &str) -> Result<Vec<u8>, KvError>;

    async fn delete(&self, key: &str) -> Result<(), KvError>;

    /// Extend the TTL of a key. No-op if the key already expired.
    async fn refresh(&self, key: &str, ttl: Duration) -> Result<(), KvError>;

    /// Atomically add `amount` to a base-10 counter (absent counts as 0) and
    /// return the new value.
    async fn add(&self, key: &str, amount: i64) -> Result<i64, KvError>;

    /// Block until every key exists. `timeout = None` uses the store default.
    async fn wait(&self, keys: &[&str], timeout: Option<Duration>) -> Result<(), KvError>;

    /// Non-blocking: whether every key exists right now.
    async fn check(&self, keys: &[&str]) -> Result<bool, KvError>;

    /// Change the default wait timeout used by `get` and `wait`.
    fn set_timeout(&self, timeout: Duration);
}
