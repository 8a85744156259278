// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Coordination Store Trait - Anti-Corruption Layer for the shared store
//!
//! The rendezvous protocol and the key-value exchange only ever talk to the
//! coordination service through this capability set. Implementations must
//! provide etcd v2 style semantics:
//!
//! - every response carries the store-wide index observed at response time
//! - compare-and-swap / compare-and-delete are guarded by the previous value
//! - keys may carry a TTL; expiry is a change event visible to watchers
//! - `refresh` extends a TTL without notifying watchers
//! - `watch` returns the first change with index >= `after_index`

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// A key (or directory) read from the coordination store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Absolute key path, e.g. `/torchelastic/p2p/run_42/rdzv/active_version`
    pub key: String,
    /// Value for plain keys, `None` for directories and empty keys
    pub value: Option<String>,
    /// Whether this node is a directory
    pub dir: bool,
    /// Index at which this node was last modified
    pub modified_index: u64,
    /// Remaining TTL in seconds, if the key is ephemeral
    pub ttl: Option<i64>,
    /// Store-wide index observed when this response was produced
    pub store_index: u64,
    /// Immediate children, populated for directory reads
    pub nodes: Vec<Node>,
}

impl Node {
    /// Value as a string slice, empty for directories
    pub fn value_str(&self) -> &str {
        self.value.as_deref().unwrap_or_default()
    }

    /// Keys of the immediate children
    pub fn child_keys(&self) -> impl Iterator<Item = &str> {
        self.nodes.iter().map(|n| n.key.as_str())
    }
}

/// Kind of change reported by [`CoordinationStore::watch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WatchAction {
    Set,
    Create,
    Update,
    CompareAndSwap,
    Delete,
    CompareAndDelete,
    Expire,
}

/// A single change observed by a watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub action: WatchAction,
    pub key: String,
    pub index: u64,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Key not found: {key}")]
    NotFound { key: String },

    #[error("Key already exists: {key}")]
    AlreadyExists { key: String },

    #[error("Compare failed for key {key}")]
    CompareFailed { key: String },

    #[error("Event index cleared from store history")]
    EventIndexCleared,

    #[error("HTTP transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Store returned error {code}: {message}")]
    Protocol { code: u32, message: String },

    #[error("Failed to decode store response: {0}")]
    Decode(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    pub fn is_compare_failed(&self) -> bool {
        matches!(self, StoreError::CompareFailed { .. })
    }
}

/// Capability set the rendezvous protocol requires from the coordination
/// service.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Read a key. Directories are returned with their immediate children.
    async fn get(&self, key: &str) -> Result<Node, StoreError>;

    /// Create a key that must not exist yet.
    ///
    /// # Errors
    /// * `StoreError::AlreadyExists` if the key is present
    async fn create(
        &self,
        key: &str,
        value: Option<&str>,
        ttl: Option<Duration>,
    ) -> Result<Node, StoreError>;

    /// Create a directory that must not exist yet.
    async fn create_dir(&self, key: &str, ttl: Option<Duration>) -> Result<Node, StoreError>;

    /// Unconditionally write a key.
    async fn set(
        &self,
        key: &str,
        value: Option<&str>,
        ttl: Option<Duration>,
    ) -> Result<Node, StoreError>;

    /// Replace the value of `key` only if it still equals `prev_value`.
    /// Passing `ttl = None` makes the key durable.
    ///
    /// # Errors
    /// * `StoreError::CompareFailed` if the stored value differs
    /// * `StoreError::NotFound` if the key is gone
    async fn compare_and_swap(
        &self,
        key: &str,
        value: &str,
        prev_value: &str,
        ttl: Option<Duration>,
    ) -> Result<Node, StoreError>;

    /// Delete `key` only if it still holds `prev_value`.
    async fn compare_and_delete(&self, key: &str, prev_value: &str) -> Result<(), StoreError>;

    /// Delete a key unconditionally.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Extend the TTL of an existing key without notifying watchers.
    ///
    /// # Errors
    /// * `StoreError::NotFound` if the key has already expired
    async fn refresh(&self, key: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Block until a change with index >= `after_index` touches `key`
    /// (or anything below it when `recursive`), or `timeout` elapses.
    ///
    /// Returns `Ok(None)` on timeout.
    async fn watch(
        &self,
        key: &str,
        recursive: bool,
        after_index: u64,
        timeout: Duration,
    ) -> Result<Option<WatchEvent>, StoreError>;
}
