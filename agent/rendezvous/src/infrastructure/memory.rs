// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! In-memory coordination store with etcd v2 semantics.
//!
//! Used for single-host runs and as the test double of the rendezvous
//! protocol. Expiry is driven by `tokio::time`, so tests running with a
//! paused clock observe TTL lapses deterministically.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::domain::store::{CoordinationStore, Node, StoreError, WatchAction, WatchEvent};

/// Number of change events kept for index-based watches.
const HISTORY_CAPACITY: usize = 1000;

#[derive(Debug, Clone)]
struct Entry {
    value: Option<String>,
    dir: bool,
    modified_index: u64,
    expires_at: Option<Instant>,
}

#[derive(Debug, Default)]
struct Inner {
    index: u64,
    nodes: BTreeMap<String, Entry>,
    history: VecDeque<WatchEvent>,
    /// Highest index whose event was evicted from `history`
    cleared_up_to: u64,
}

impl Inner {
    fn record(&mut self, action: WatchAction, key: &str) -> u64 {
        self.index += 1;
        if self.history.len() == HISTORY_CAPACITY {
            if let Some(evicted) = self.history.pop_front() {
                self.cleared_up_to = evicted.index;
            }
        }
        self.history.push_back(WatchEvent {
            action,
            key: key.to_string(),
            index: self.index,
        });
        self.index
    }

    /// Remove every expired key (and its subtree), emitting expire events.
    fn purge_expired(&mut self, now: Instant) -> bool {
        let expired: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, e)| e.expires_at.is_some_and(|at| at <= now))
            .map(|(k, _)| k.clone())
            .collect();
        let mut changed = false;
        for key in expired {
            if self.nodes.contains_key(&key) {
                self.remove_subtree(&key);
                self.record(WatchAction::Expire, &key);
                changed = true;
            }
        }
        changed
    }

    fn remove_subtree(&mut self, key: &str) {
        self.nodes.remove(key);
        let child_prefix = format!("{key}/");
        let children: Vec<String> = self
            .nodes
            .range(child_prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&child_prefix))
            .map(|(k, _)| k.clone())
            .collect();
        for child in children {
            self.nodes.remove(&child);
        }
    }

    fn ensure_parents(&mut self, key: &str) {
        let mut end = 0;
        while let Some(pos) = key[end + 1..].find('/') {
            end += pos + 1;
            let parent = &key[..end];
            self.nodes.entry(parent.to_string()).or_insert(Entry {
                value: None,
                dir: true,
                modified_index: self.index + 1,
                expires_at: None,
            });
        }
    }

    fn node(&self, key: &str, now: Instant, with_children: bool) -> Option<Node> {
        let entry = self.nodes.get(key)?;
        let nodes = if entry.dir && with_children {
            let child_prefix = format!("{key}/");
            self.nodes
                .range(child_prefix.clone()..)
                .take_while(|(k, _)| k.starts_with(&child_prefix))
                .filter(|(k, _)| !k[child_prefix.len()..].contains('/'))
                .filter_map(|(k, _)| self.node(k, now, false))
                .collect()
        } else {
            Vec::new()
        };
        Some(Node {
            key: key.to_string(),
            value: entry.value.clone(),
            dir: entry.dir,
            modified_index: entry.modified_index,
            ttl: entry.expires_at.map(|at| {
                let left = at.saturating_duration_since(now);
                (left.as_secs() + u64::from(left.subsec_nanos() > 0)) as i64
            }),
            store_index: self.index,
            nodes,
        })
    }

    fn put(&mut self, key: &str, entry: Entry, action: WatchAction, now: Instant) -> Node {
        self.ensure_parents(key);
        let index = self.record(action, key);
        self.nodes.insert(
            key.to_string(),
            Entry {
                modified_index: index,
                ..entry
            },
        );
        // A freshly written key always exists.
        self.node(key, now, false).unwrap_or_else(|| Node {
            key: key.to_string(),
            value: None,
            dir: false,
            modified_index: index,
            ttl: None,
            store_index: index,
            nodes: Vec::new(),
        })
    }

    fn first_match(&self, key: &str, recursive: bool, after_index: u64) -> Option<WatchEvent> {
        self.history
            .iter()
            .filter(|e| e.index >= after_index)
            .find(|e| event_matches(e, key, recursive))
            .cloned()
    }
}

/// Whether a change to `event.key` concerns a watcher on `key`. Removing a
/// directory also concerns watchers of keys inside it.
fn event_matches(event: &WatchEvent, key: &str, recursive: bool) -> bool {
    if event.key == key {
        return true;
    }
    if recursive && is_descendant(&event.key, key) {
        return true;
    }
    matches!(
        event.action,
        WatchAction::Delete | WatchAction::CompareAndDelete | WatchAction::Expire
    ) && is_descendant(key, &event.key)
}

fn is_descendant(key: &str, ancestor: &str) -> bool {
    let ancestor = ancestor.trim_end_matches('/');
    key.len() > ancestor.len() && key.starts_with(ancestor) && key[ancestor.len()..].starts_with('/')
}

pub struct InMemoryStore {
    inner: Mutex<Inner>,
    changes: watch::Sender<u64>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            inner: Mutex::new(Inner::default()),
            changes,
        }
    }

    /// Current store-wide index.
    pub fn index(&self) -> u64 {
        self.inner.lock().index
    }

    /// Run `f` against the store with expired keys purged, notifying
    /// watchers when anything changed.
    fn with_inner<T>(&self, f: impl FnOnce(&mut Inner, Instant) -> T) -> T {
        let now = Instant::now();
        let (result, before, after) = {
            let mut inner = self.inner.lock();
            let before = inner.index;
            inner.purge_expired(now);
            let result = f(&mut inner, now);
            (result, before, inner.index)
        };
        if after != before {
            self.changes.send_replace(after);
        }
        result
    }
}

#[async_trait]
impl CoordinationStore for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Node, StoreError> {
        self.with_inner(|inner, now| {
            inner.node(key, now, true).ok_or_else(|| StoreError::NotFound {
                key: key.to_string(),
            })
        })
    }

    async fn create(
        &self,
        key: &str,
        value: Option<&str>,
        ttl: Option<Duration>,
    ) -> Result<Node, StoreError> {
        self.with_inner(|inner, now| {
            if inner.nodes.contains_key(key) {
                return Err(StoreError::AlreadyExists {
                    key: key.to_string(),
                });
            }
            let entry = Entry {
                value: Some(value.unwrap_or_default().to_string()),
                dir: false,
                modified_index: 0,
                expires_at: ttl.map(|t| now + t),
            };
            Ok(inner.put(key, entry, WatchAction::Create, now))
        })
    }

    async fn create_dir(&self, key: &str, ttl: Option<Duration>) -> Result<Node, StoreError> {
        self.with_inner(|inner, now| {
            if inner.nodes.contains_key(key) {
                return Err(StoreError::AlreadyExists {
                    key: key.to_string(),
                });
            }
            let entry = Entry {
                value: None,
                dir: true,
                modified_index: 0,
                expires_at: ttl.map(|t| now + t),
            };
            Ok(inner.put(key, entry, WatchAction::Create, now))
        })
    }

    async fn set(
        &self,
        key: &str,
        value: Option<&str>,
        ttl: Option<Duration>,
    ) -> Result<Node, StoreError> {
        self.with_inner(|inner, now| {
            if inner.nodes.get(key).is_some_and(|e| e.dir) {
                return Err(StoreError::Protocol {
                    code: 102,
                    message: format!("Not a file: {key}"),
                });
            }
            let entry = Entry {
                value: Some(value.unwrap_or_default().to_string()),
                dir: false,
                modified_index: 0,
                expires_at: ttl.map(|t| now + t),
            };
            Ok(inner.put(key, entry, WatchAction::Set, now))
        })
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        value: &str,
        prev_value: &str,
        ttl: Option<Duration>,
    ) -> Result<Node, StoreError> {
        self.with_inner(|inner, now| {
            let current = inner.nodes.get(key).ok_or_else(|| StoreError::NotFound {
                key: key.to_string(),
            })?;
            if current.dir || current.value.as_deref() != Some(prev_value) {
                return Err(StoreError::CompareFailed {
                    key: key.to_string(),
                });
            }
            let entry = Entry {
                value: Some(value.to_string()),
                dir: false,
                modified_index: 0,
                expires_at: ttl.map(|t| now + t),
            };
            Ok(inner.put(key, entry, WatchAction::CompareAndSwap, now))
        })
    }

    async fn compare_and_delete(&self, key: &str, prev_value: &str) -> Result<(), StoreError> {
        self.with_inner(|inner, _| {
            let current = inner.nodes.get(key).ok_or_else(|| StoreError::NotFound {
                key: key.to_string(),
            })?;
            if current.dir || current.value.as_deref() != Some(prev_value) {
                return Err(StoreError::CompareFailed {
                    key: key.to_string(),
                });
            }
            inner.remove_subtree(key);
            inner.record(WatchAction::CompareAndDelete, key);
            Ok(())
        })
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.with_inner(|inner, _| {
            if !inner.nodes.contains_key(key) {
                return Err(StoreError::NotFound {
                    key: key.to_string(),
                });
            }
            inner.remove_subtree(key);
            inner.record(WatchAction::Delete, key);
            Ok(())
        })
    }

    async fn refresh(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        self.with_inner(|inner, now| {
            let entry = inner.nodes.get_mut(key).ok_or_else(|| StoreError::NotFound {
                key: key.to_string(),
            })?;
            entry.expires_at = Some(now + ttl);
            Ok(())
        })
    }

    async fn watch(
        &self,
        key: &str,
        recursive: bool,
        after_index: u64,
        timeout: Duration,
    ) -> Result<Option<WatchEvent>, StoreError> {
        let deadline = Instant::now() + timeout;
        let mut changes = self.changes.subscribe();

        loop {
            changes.borrow_and_update();
            let (found, next_expiry) = self.with_inner(|inner, _| {
                if after_index > 0 && after_index <= inner.cleared_up_to {
                    return Err(StoreError::EventIndexCleared);
                }
                let next_expiry = inner.nodes.values().filter_map(|e| e.expires_at).min();
                Ok((inner.first_match(key, recursive, after_index), next_expiry))
            })?;

            if found.is_some() {
                return Ok(found);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let wake_at = next_expiry.map_or(deadline, |at| at.min(deadline));

            tokio::select! {
                changed = changes.changed() => {
                    if changed.is_err() {
                        return Ok(None);
                    }
                }
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }
}
