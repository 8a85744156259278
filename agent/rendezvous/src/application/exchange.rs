// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Store-backed Key-Value Exchange
//!
//! Implements [`KeyValueStore`] under one directory of the coordination
//! store, normally `/rdzv/v_<version>/kv`. Keys and values are URL-safe
//! base64 encoded before they reach the store, so arbitrary bytes never
//! produce path separators.
//!
//! Blocking reads list the directory, and if anything is missing, watch it
//! recursively from the index of that listing until the keys show up or
//! the wait timeout elapses.

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::application::jittered;
use crate::domain::kv::{KeyValueStore, KvError};
use crate::domain::store::{CoordinationStore, StoreError};

pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(300);
const CAS_DELAY: Duration = Duration::from_millis(100);

pub struct StoreKeyValueExchange {
    store: Arc<dyn CoordinationStore>,
    prefix: String,
    timeout: Mutex<Duration>,
}

impl StoreKeyValueExchange {
    /// Open the exchange rooted at `prefix`, creating the directory if needed.
    pub async fn open(
        store: Arc<dyn CoordinationStore>,
        prefix: impl Into<String>,
    ) -> Result<Self, KvError> {
        let prefix = prefix.into().trim_end_matches('/').to_string();
        match store.create_dir(&prefix, None).await {
            Ok(_) | Err(StoreError::AlreadyExists { .. }) => {}
            Err(e) => return Err(e.into()),
        }
        Ok(Self {
            store,
            prefix,
            timeout: Mutex::new(DEFAULT_WAIT_TIMEOUT),
        })
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        *self.timeout.lock() = timeout;
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn path(&self, key: &str) -> String {
        format!("{}/{}", self.prefix, URL_SAFE.encode(key.as_bytes()))
    }

    fn default_timeout(&self) -> Duration {
        *self.timeout.lock()
    }

    /// Wait until every path in `paths` exists. Returns the raw (encoded)
    /// values, or `None` if `timeout` elapsed first.
    async fn try_wait_get(
        &self,
        paths: &[String],
        timeout: Duration,
    ) -> Result<Option<HashMap<String, String>>, KvError> {
        let deadline = Instant::now() + timeout;
        loop {
            let dir = self.store.get(&self.prefix).await?;
            let found: HashMap<String, String> = dir
                .nodes
                .iter()
                .filter(|n| paths.contains(&n.key))
                .map(|n| (n.key.clone(), n.value_str().to_string()))
                .collect();
            if found.len() == paths.len() {
                return Ok(Some(found));
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            match self
                .store
                .watch(&self.prefix, true, dir.store_index + 1, remaining)
                .await
            {
                Ok(_) | Err(StoreError::EventIndexCleared) => {}
                Err(e) => return Err(e.into()),
            }
        }
    }
}

fn decode(raw: &str) -> Result<Vec<u8>, KvError> {
    URL_SAFE
        .decode(raw)
        .map_err(|e| KvError::Decode(format!("{raw:?}: {e}")))
}

fn decode_counter(key: &str, raw: &str) -> Result<i64, KvError> {
    let bytes = decode(raw)?;
    std::str::from_utf8(&bytes)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| KvError::InvalidCounter {
            key: key.to_string(),
        })
}

#[async_trait]
impl KeyValueStore for StoreKeyValueExchange {
    async fn set(&self, key: &str, value: &[u8]) -> Result<(), KvError> {
        let encoded = URL_SAFE.encode(value);
        self.store.set(&self.path(key), Some(&encoded), None).await?;
        Ok(())
    }

    async fn set_with_ttl(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), KvError> {
        let encoded = URL_SAFE.encode(value);
        self.store
            .set(&self.path(key), Some(&encoded), Some(ttl))
            .await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, KvError> {
        let path = self.path(key);
        let found = self
            .try_wait_get(std::slice::from_ref(&path), self.default_timeout())
            .await?;
        match found.and_then(|mut values| values.remove(&path)) {
            Some(raw) => decode(&raw),
            None => Err(KvError::NotFound {
                key: key.to_string(),
            }),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        match self.store.delete(&self.path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Err(KvError::NotFound {
                key: key.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn refresh(&self, key: &str, ttl: Duration) -> Result<(), KvError> {
        match self.store.refresh(&self.path(key), ttl).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => {
                debug!("Key {} already expired, nothing to refresh", key);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn add(&self, key: &str, amount: i64) -> Result<i64, KvError> {
        let path = self.path(key);
        let initial = URL_SAFE.encode(amount.to_string());
        match self.store.create(&path, Some(&initial), None).await {
            Ok(_) => return Ok(amount),
            Err(StoreError::AlreadyExists { .. }) => {}
            Err(e) => return Err(e.into()),
        }

        loop {
            let node = self.store.get(&path).await?;
            let current = decode_counter(key, node.value_str())?;
            let next = current
                .checked_add(amount)
                .ok_or_else(|| KvError::InvalidCounter {
                    key: key.to_string(),
                })?;
            let encoded = URL_SAFE.encode(next.to_string());
            match self
                .store
                .compare_and_swap(&path, &encoded, node.value_str(), None)
                .await
            {
                Ok(_) => return Ok(next),
                Err(e) if e.is_compare_failed() => {
                    debug!("Counter {} CAS unsuccessful, retrying", key);
                    tokio::time::sleep(jittered(CAS_DELAY)).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn wait(&self, keys: &[&str], timeout: Option<Duration>) -> Result<(), KvError> {
        let paths: Vec<String> = keys.iter().map(|k| self.path(k)).collect();
        let timeout = timeout.unwrap_or_else(|| self.default_timeout());
        match self.try_wait_get(&paths, timeout).await? {
            Some(_) => Ok(()),
            None => Err(KvError::Timeout {
                keys: keys.iter().map(|k| k.to_string()).collect(),
            }),
        }
    }

    async fn check(&self, keys: &[&str]) -> Result<bool, KvError> {
        let paths: Vec<String> = keys.iter().map(|k| self.path(k)).collect();
        Ok(self.try_wait_get(&paths, Duration::ZERO).await?.is_some())
    }

    fn set_timeout(&self, timeout: Duration) {
        *self.timeout.lock() = timeout;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::memory::InMemoryStore;

    async fn exchange(store: &Arc<InMemoryStore>) -> StoreKeyValueExchange {
        StoreKeyValueExchange::open(store.clone(), "/job/run_1/rdzv/v_1/kv")
            .await
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_blocks_until_another_participant_sets() {
        let store = Arc::new(InMemoryStore::new());
        let reader = exchange(&store).await;
        let writer = exchange(&store).await;

        let publish = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            writer.set("endpoint_host", b"host1").await.unwrap();
        });

        let started = Instant::now();
        let value = reader.get("endpoint_host").await.unwrap();
        assert_eq!(value, b"host1");
        assert!(started.elapsed() >= Duration::from_secs(3));
        publish.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_times_out_with_not_found() {
        let store = Arc::new(InMemoryStore::new());
        let kv = exchange(&store).await.with_timeout(Duration::from_secs(5));
        let result = kv.get("missing").await;
        assert!(matches!(result, Err(KvError::NotFound { key }) if key == "missing"));

        kv.set_timeout(Duration::from_secs(1));
        let started = Instant::now();
        assert!(matches!(
            kv.wait(&["a", "b"], None).await,
            Err(KvError::Timeout { .. })
        ));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_keys_are_encoded_without_separators() {
        let store = Arc::new(InMemoryStore::new());
        let kv = exchange(&store).await;
        kv.set("a/b?c", &[0xff, 0x00, 0x2f]).await.unwrap();
        let dir = store.get("/job/run_1/rdzv/v_1/kv").await.unwrap();
        assert_eq!(dir.nodes.len(), 1);
        assert!(!dir.nodes[0].key["/job/run_1/rdzv/v_1/kv/".len()..].contains('/'));
        assert_eq!(kv.get("a/b?c").await.unwrap(), vec![0xff, 0x00, 0x2f]);
    }

    #[tokio::test]
    async fn test_check_and_delete() {
        let store = Arc::new(InMemoryStore::new());
        let kv = exchange(&store).await;
        kv.set("x", b"1").await.unwrap();
        assert!(kv.check(&["x"]).await.unwrap());
        assert!(!kv.check(&["x", "y"]).await.unwrap());
        kv.delete("x").await.unwrap();
        assert!(!kv.check(&["x"]).await.unwrap());
        assert!(matches!(kv.delete("x").await, Err(KvError::NotFound { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_add() {
        let store = Arc::new(InMemoryStore::new());
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let kv = exchange(&store).await;
            tasks.push(tokio::spawn(async move { kv.add("counter", 2).await.unwrap() }));
        }
        let mut results: Vec<i64> = Vec::new();
        for task in tasks {
            results.push(task.await.unwrap());
        }
        results.sort();
        assert_eq!(results, (1..=8).map(|i| i * 2).collect::<Vec<_>>());

        let kv = exchange(&store).await;
        assert_eq!(kv.add("counter", -16).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_add_rejects_non_numeric_value() {
        let store = Arc::new(InMemoryStore::new());
        let kv = exchange(&store).await;
        kv.set("counter", b"abc").await.unwrap();
        assert!(matches!(
            kv.add("counter", 1).await,
            Err(KvError::InvalidCounter { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_keys_refresh_and_expire() {
        let store = Arc::new(InMemoryStore::new());
        let kv = exchange(&store).await;
        kv.set_with_ttl("hb", b"1", Duration::from_secs(4)).await.unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;
        kv.refresh("hb", Duration::from_secs(4)).await.unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(kv.check(&["hb"]).await.unwrap());
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!kv.check(&["hb"]).await.unwrap());
        kv.refresh("hb", Duration::from_secs(4)).await.unwrap();
    }
}
