// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Elastic Rendezvous
//!
//! Store-mediated membership agreement for elastic worker groups.
//!
//! # Architecture
//!
//! - **domain:** record model, store and key-value capability traits, errors, configuration
//! - **application:** the rendezvous protocol, the key-value exchange, lease renewal
//! - **infrastructure:** etcd v2 HTTP adapter and an in-memory store

pub mod application;
pub mod domain;
pub mod infrastructure;

use std::sync::Arc;

pub use application::{LeaseKeeper, RendezvousCoordinator, StoreKeyValueExchange};
pub use domain::config::{RendezvousConfig, RendezvousTimings, StoreEndpoint};
pub use domain::error::RendezvousError;
pub use domain::handler::{RendezvousHandler, RendezvousOutcome};
pub use domain::kv::{KeyValueStore, KvError};
pub use domain::state::{RendezvousState, RendezvousStatus};
pub use domain::store::{CoordinationStore, StoreError};
pub use infrastructure::{EtcdV2Store, InMemoryStore};

/// Parse a rendezvous URL and connect to the etcd store it names.
pub async fn connect(url: &str) -> Result<RendezvousCoordinator, RendezvousError> {
    let config = RendezvousConfig::from_url(url)?;
    let store = EtcdV2Store::new(&config.endpoint)?;
    RendezvousCoordinator::connect(Arc::new(store), config).await
}
