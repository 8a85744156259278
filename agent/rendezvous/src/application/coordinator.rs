// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # Rendezvous Coordinator
//!
//! Agrees on a ranked group of participants using nothing but the shared
//! coordination store. Every transition replaces the single record at
//! `/rdzv/active_version` by compare-and-swap against the raw value read
//! just before, so concurrent nodes never overwrite each other blindly.
//!
//! ## Phases
//!
//! | Observed record | Action |
//! |-----------------|--------|
//! | absent | create `setup` placeholder, allocate next version, publish `joinable` |
//! | `joinable` | append self to `participants`; index = rank |
//! | `joinable`, we are rank `min_workers - 1` | last call: wait `last_call_timeout` for extra joiners, then freeze |
//! | `frozen` | confirm by adding our keep-alive key; the last confirmer publishes `final` |
//! | `final` (late arrival) | bump `num_workers_waiting`, wait for the version to change or a keep-alive to lapse |
//! | `closed` | fail with `Closed` |
//! | `setup` / foreign `frozen` | wait for a change, retry after a short delay |
//!
//! Contention is never surfaced: lost CAS races either retry immediately or
//! after a jittered delay. Only `Timeout`, `Closed` and `NonRetryable`
//! leave [`RendezvousCoordinator::next_rendezvous`].

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::application::exchange::StoreKeyValueExchange;
use crate::application::jittered;
use crate::application::lease::LeaseKeeper;
use crate::domain::config::RendezvousConfig;
use crate::domain::error::RendezvousError;
use crate::domain::handler::{RendezvousHandler, RendezvousOutcome};
use crate::domain::layout::KeyLayout;
use crate::domain::state::{RendezvousState, RendezvousStatus};
use crate::domain::store::{CoordinationStore, Node, StoreError};

/// How a failed phase step should be handled by the barrier loop.
#[derive(Debug)]
enum PhaseError {
    /// The record already moved past what we raced against; re-enter now.
    RetryImmediately,
    /// Contention or an intermediate state; re-enter after a short delay.
    RetryAfterDelay(String),
    /// Terminal for this call.
    Abort(RendezvousError),
}

impl From<StoreError> for PhaseError {
    fn from(e: StoreError) -> Self {
        PhaseError::RetryAfterDelay(e.to_string())
    }
}

impl From<RendezvousError> for PhaseError {
    fn from(e: RendezvousError) -> Self {
        PhaseError::Abort(e)
    }
}

type PhaseResult<T> = Result<T, PhaseError>;

/// The active record together with the raw value it was decoded from
/// (the CAS guard) and the store index of the read.
#[derive(Debug, Clone)]
struct Snapshot {
    raw: String,
    state: RendezvousState,
    index: u64,
}

impl Snapshot {
    fn from_node(node: &Node) -> Result<Self, StoreError> {
        Ok(Self {
            raw: node.value_str().to_string(),
            state: RendezvousState::decode(node.value_str())?,
            index: node.store_index,
        })
    }
}

/// (version, rank, world_size)
type Membership = (u64, u32, u32);

pub struct RendezvousCoordinator {
    store: Arc<dyn CoordinationStore>,
    config: RendezvousConfig,
    layout: KeyLayout,
    _run_lease: LeaseKeeper,
    rank_lease: Mutex<Option<LeaseKeeper>>,
}

impl RendezvousCoordinator {
    /// Prepare the job's key space and start keeping the run directory alive.
    ///
    /// Creates, when absent: the prefix directory, `run_<id>` (with the
    /// run-id TTL), `run_<id>/rdzv` and `rdzv/version_counter = 0`.
    pub async fn connect(
        store: Arc<dyn CoordinationStore>,
        config: RendezvousConfig,
    ) -> Result<Self, RendezvousError> {
        config.validate()?;
        let layout = KeyLayout::new(&config.prefix, &config.run_id);
        let timings = &config.timings;

        if layout.prefix() != "/" {
            create_dir_if_absent(store.as_ref(), layout.prefix(), None).await?;
        }
        create_dir_if_absent(store.as_ref(), layout.run_dir(), Some(timings.run_id_ttl)).await?;
        let run_lease = LeaseKeeper::keep_alive(store.clone(), layout.run_dir(), timings.run_id_ttl);
        create_dir_if_absent(store.as_ref(), &layout.rdzv_dir(), None).await?;
        match store.create(&layout.version_counter(), Some("0"), None).await {
            Ok(_) | Err(StoreError::AlreadyExists { .. }) => {}
            Err(e) => return Err(e.into()),
        }

        info!(
            "Rendezvous for run {} ready under {} (min_workers={}, max_workers={})",
            config.run_id,
            layout.run_dir(),
            config.min_workers,
            config.max_workers
        );

        Ok(Self {
            store,
            config,
            layout,
            _run_lease: run_lease,
            rank_lease: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &RendezvousConfig {
        &self.config
    }

    /// Current active record, if any.
    pub async fn active_state(&self) -> Result<Option<RendezvousState>, RendezvousError> {
        match self.get_rdzv_state().await {
            Ok(snapshot) => Ok(Some(snapshot.state)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Run the protocol until this node holds a confirmed membership in a
    /// `final` version. Returns `(version, rank, world_size)`.
    pub async fn rendezvous_barrier(&self) -> Result<Membership, RendezvousError> {
        let deadline = Instant::now() + self.config.timeout;
        loop {
            if Instant::now() > deadline {
                return Err(RendezvousError::Timeout);
            }
            info!("Attempting to join next rendezvous");
            self.release_rank_lease();

            match self.init_phase(deadline).await {
                Ok(membership) => return Ok(membership),
                Err(PhaseError::RetryImmediately) => {}
                Err(PhaseError::RetryAfterDelay(reason)) => {
                    info!("Rendezvous attempt failed, will retry. Reason: {}", reason);
                    tokio::time::sleep(jittered(self.config.timings.retry_delay)).await;
                }
                Err(PhaseError::Abort(RendezvousError::Closed)) => {
                    info!("Rendezvous for run_id={} was observed to be closed", self.config.run_id);
                    return Err(RendezvousError::Closed);
                }
                Err(PhaseError::Abort(RendezvousError::Timeout)) => {
                    info!("Rendezvous for run_id={} timed out", self.config.run_id);
                    return Err(RendezvousError::Timeout);
                }
                Err(PhaseError::Abort(e)) => return Err(e),
            }
        }
    }

    fn release_rank_lease(&self) {
        if let Some(lease) = self.rank_lease.lock().take() {
            lease.release();
        }
    }

    async fn init_phase(&self, deadline: Instant) -> PhaseResult<Membership> {
        let snapshot = match self.try_create_rendezvous().await? {
            Some(created) => {
                info!("New rendezvous state created: {}", created.raw);
                created
            }
            None => {
                let existing = self.get_rdzv_state().await?;
                info!("Observed existing rendezvous state: {}", existing.raw);
                existing
            }
        };

        match &snapshot.state {
            RendezvousState::Closed { .. } => Err(PhaseError::Abort(RendezvousError::Closed)),
            RendezvousState::Joinable { version, .. } => self.join_phase(*version, deadline).await,
            RendezvousState::Final { version, .. } => {
                self.handle_existing_rendezvous(*version, deadline).await?;
                Err(PhaseError::RetryImmediately)
            }
            RendezvousState::Setup | RendezvousState::Frozen { .. } => {
                self.try_wait_for_state_change(snapshot.index + 1, None, deadline)
                    .await?;
                Err(PhaseError::RetryAfterDelay(format!(
                    "rendezvous is {}, waiting for it to settle",
                    snapshot.state.status()
                )))
            }
        }
    }

    /// Allocate a new version. Returns `None` if an active record exists.
    async fn try_create_rendezvous(&self) -> PhaseResult<Option<Snapshot>> {
        let active = self.layout.active_version();
        let setup = RendezvousState::Setup.encode()?;
        let placeholder = match self
            .store
            .create(&active, Some(&setup), Some(self.config.timings.setup_ttl))
            .await
        {
            Ok(node) => node,
            Err(StoreError::AlreadyExists { .. }) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let version = self.bump_version_counter().await?;
        self.store
            .create_dir(&self.layout.version_dir(version), None)
            .await?;

        let joinable = RendezvousState::joinable(version).encode()?;
        let node = self
            .store
            .compare_and_swap(&active, &joinable, placeholder.value_str(), None)
            .await?;
        Ok(Some(Snapshot::from_node(&node)?))
    }

    async fn bump_version_counter(&self) -> PhaseResult<u64> {
        let key = self.layout.version_counter();
        let corrupted = || {
            PhaseError::Abort(RendezvousError::NonRetryable(
                "Unexpected state of the version counter, worker needs to die".to_string(),
            ))
        };

        let node = match self.store.get(&key).await {
            Ok(node) => node,
            Err(e) if e.is_not_found() => return Err(corrupted()),
            Err(e) => return Err(e.into()),
        };
        let current: u64 = node.value_str().parse().map_err(|_| corrupted())?;
        let next = current + 1;
        match self
            .store
            .compare_and_swap(&key, &next.to_string(), node.value_str(), None)
            .await
        {
            Ok(_) => Ok(next),
            Err(e) if e.is_not_found() || e.is_compare_failed() => Err(corrupted()),
            Err(e) => Err(e.into()),
        }
    }

    async fn join_phase(&self, expected_version: u64, deadline: Instant) -> PhaseResult<Membership> {
        let (snapshot, rank) = self.join_rendezvous(expected_version).await?;
        info!(
            "Joined rendezvous version {} as rank {}. Full state: {}",
            expected_version, rank, snapshot.raw
        );

        if rank + 1 == self.config.min_workers
            && snapshot.state.status() == RendezvousStatus::Joinable
        {
            info!("Rank {} is responsible for join last call.", rank);
            let last_call_deadline = Instant::now() + self.config.last_call_timeout;
            self.handle_join_last_call(expected_version, last_call_deadline, deadline)
                .await?;
            info!("Rank {} finished join last call.", rank);
        }

        info!("Waiting for remaining peers.");
        self.wait_for_peers(expected_version, deadline).await?;
        self.confirm_phase(expected_version, rank, deadline).await
    }

    async fn join_rendezvous(&self, expected_version: u64) -> PhaseResult<(Snapshot, u32)> {
        let timings = &self.config.timings;
        let max = self.config.max_workers as usize;
        let min = self.config.min_workers as usize;

        loop {
            tokio::time::sleep(jittered(timings.cas_delay)).await;

            let snapshot = self.get_rdzv_state().await?;
            let (version, mut participants) = match snapshot.state.clone() {
                RendezvousState::Joinable {
                    version,
                    participants,
                } => (version, participants),
                _ => {
                    return Err(PhaseError::RetryAfterDelay(
                        "Rendezvous state became non-joinable before we could join. \
                         Must join next one."
                            .to_string(),
                    ))
                }
            };
            if version != expected_version {
                return Err(PhaseError::RetryImmediately);
            }
            if participants.len() >= max {
                return Err(PhaseError::Abort(RendezvousError::NonRetryable(format!(
                    "joinable rendezvous version {version} already holds {} participants",
                    participants.len()
                ))));
            }

            let rank = participants.len() as u32;
            participants.push(rank);
            let (next, ttl) = if participants.len() == max {
                (
                    RendezvousState::Frozen {
                        version,
                        participants,
                        keep_alives: Vec::new(),
                    },
                    Some(timings.frozen_ttl),
                )
            } else if participants.len() >= min {
                (
                    RendezvousState::Joinable {
                        version,
                        participants,
                    },
                    Some(timings.joinable_ephemeral_ttl),
                )
            } else {
                (
                    RendezvousState::Joinable {
                        version,
                        participants,
                    },
                    None,
                )
            };

            match self.cas_active(&snapshot, &next, ttl).await {
                Ok(joined) => return Ok((joined, rank)),
                Err(e) if e.is_compare_failed() => {
                    info!("Join rendezvous CAS unsuccessful, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Keep the joinable record alive until `last_call_deadline`, then freeze
    /// it. A concurrent freeze by the `max_workers`-th joiner is equally fine.
    async fn handle_join_last_call(
        &self,
        expected_version: u64,
        last_call_deadline: Instant,
        deadline: Instant,
    ) -> PhaseResult<()> {
        let timings = &self.config.timings;
        let active = self.layout.active_version();
        let mut snapshot = self.get_rdzv_state().await?;

        loop {
            if snapshot.state.is(RendezvousStatus::Frozen, expected_version) {
                return Ok(());
            }
            if !snapshot.state.is(RendezvousStatus::Joinable, expected_version) {
                info!("Rendezvous state left joinable during last call. Must re-enter.");
                return Err(PhaseError::RetryImmediately);
            }

            if Instant::now() >= last_call_deadline {
                let frozen = snapshot.state.clone().freeze().map_err(|other| {
                    PhaseError::RetryAfterDelay(format!("cannot freeze a {} record", other.status()))
                })?;
                match self.cas_active(&snapshot, &frozen, Some(timings.frozen_ttl)).await {
                    Ok(_) => return Ok(()),
                    Err(e) if e.is_compare_failed() => {
                        info!("Join last-call transition CAS unsuccessful. Will retry");
                        tokio::time::sleep(jittered(timings.cas_delay)).await;
                        snapshot = self.get_rdzv_state().await?;
                        continue;
                    }
                    Err(e) => return Err(e.into()),
                }
            }

            // Rewrite the same value to push the ephemeral TTL forward.
            match self
                .store
                .compare_and_swap(
                    &active,
                    &snapshot.raw,
                    &snapshot.raw,
                    Some(timings.joinable_ephemeral_ttl),
                )
                .await
            {
                Ok(node) => {
                    let until_last_call = last_call_deadline
                        .saturating_duration_since(Instant::now())
                        + timings.watch_margin;
                    let wait = (timings.joinable_ephemeral_ttl / 2).min(until_last_call);
                    snapshot = self
                        .try_wait_for_state_change(node.store_index + 1, Some(wait), deadline)
                        .await?;
                }
                Err(e) if e.is_compare_failed() => {
                    info!("Join last-call TTL refresh CAS unsuccessful, will retry");
                    tokio::time::sleep(jittered(timings.cas_delay)).await;
                    snapshot = self.get_rdzv_state().await?;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn wait_for_peers(&self, expected_version: u64, deadline: Instant) -> PhaseResult<()> {
        let mut snapshot = self.get_rdzv_state().await?;
        loop {
            if snapshot.state.is(RendezvousStatus::Frozen, expected_version) {
                return Ok(());
            }
            if !snapshot.state.is(RendezvousStatus::Joinable, expected_version) {
                return Err(PhaseError::RetryAfterDelay(
                    "Rendezvous state transition no longer possible. Must re-enter.".to_string(),
                ));
            }
            snapshot = self
                .try_wait_for_state_change(snapshot.index + 1, None, deadline)
                .await?;
        }
    }

    async fn confirm_phase(
        &self,
        expected_version: u64,
        rank: u32,
        deadline: Instant,
    ) -> PhaseResult<Membership> {
        info!("All peers arrived. Confirming membership.");
        self.confirm_membership(expected_version, rank).await?;

        info!("Waiting for confirmations from all peers.");
        let snapshot = self.wait_for_final(expected_version, deadline).await?;
        info!(
            "Rendezvous version {} is complete. Final state: {}",
            expected_version, snapshot.raw
        );
        Ok((
            expected_version,
            rank,
            snapshot.state.participants().len() as u32,
        ))
    }

    async fn confirm_membership(&self, expected_version: u64, rank: u32) -> PhaseResult<()> {
        let timings = &self.config.timings;
        loop {
            tokio::time::sleep(jittered(timings.cas_delay)).await;

            let snapshot = self.get_rdzv_state().await?;
            let (participants, mut keep_alives) = match snapshot.state.clone() {
                RendezvousState::Frozen {
                    version,
                    participants,
                    keep_alives,
                } if version == expected_version => (participants, keep_alives),
                _ => return Err(PhaseError::RetryImmediately),
            };

            let lease_key = self.layout.keep_alive(expected_version, rank);
            let lease = LeaseKeeper::acquire(
                self.store.clone(),
                &lease_key,
                None,
                timings.keep_alive_ttl,
            )
            .await?;
            keep_alives.push(lease_key);

            let (next, ttl) = if keep_alives.len() == participants.len() {
                (
                    RendezvousState::Final {
                        version: expected_version,
                        participants,
                        keep_alives,
                        num_workers_waiting: 0,
                    },
                    None,
                )
            } else {
                (
                    RendezvousState::Frozen {
                        version: expected_version,
                        participants,
                        keep_alives,
                    },
                    Some(timings.frozen_ttl),
                )
            };

            match self.cas_active(&snapshot, &next, ttl).await {
                Ok(_) => {
                    *self.rank_lease.lock() = Some(lease);
                    return Ok(());
                }
                Err(e) if e.is_compare_failed() => {
                    info!("Confirm membership CAS unsuccessful, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn wait_for_final(&self, expected_version: u64, deadline: Instant) -> PhaseResult<Snapshot> {
        let mut snapshot = self.get_rdzv_state().await?;
        loop {
            if snapshot.state.is(RendezvousStatus::Final, expected_version) {
                return Ok(snapshot);
            }
            if !snapshot.state.is(RendezvousStatus::Frozen, expected_version) {
                return Err(PhaseError::RetryAfterDelay(
                    "Rendezvous state transition no longer possible. Must re-enter.".to_string(),
                ));
            }
            snapshot = self
                .try_wait_for_state_change(snapshot.index + 1, None, deadline)
                .await?;
        }
    }

    /// Late arrival: register as waiting, then block until the final version
    /// goes away or turns out to be stale.
    async fn handle_existing_rendezvous(
        &self,
        expected_version: u64,
        deadline: Instant,
    ) -> PhaseResult<()> {
        let announced = self.announce_self_waiting(expected_version).await?;
        info!(
            "Added self to waiting list. Rendezvous full state: {}",
            announced.raw
        );
        self.wait_for_rendezvous_to_free(expected_version, deadline)
            .await?;
        info!("Previously existing rendezvous state changed. Will re-try joining.");
        Ok(())
    }

    async fn announce_self_waiting(&self, expected_version: u64) -> PhaseResult<Snapshot> {
        loop {
            tokio::time::sleep(jittered(self.config.timings.cas_delay)).await;

            let snapshot = self.get_rdzv_state().await?;
            let next = match snapshot.state.clone() {
                RendezvousState::Final {
                    version,
                    participants,
                    keep_alives,
                    num_workers_waiting,
                } if version == expected_version => RendezvousState::Final {
                    version,
                    participants,
                    keep_alives,
                    num_workers_waiting: num_workers_waiting + 1,
                },
                _ => return Err(PhaseError::RetryImmediately),
            };

            match self.cas_active(&snapshot, &next, None).await {
                Ok(announced) => return Ok(announced),
                Err(e) if e.is_compare_failed() => {
                    info!("Announce self as waiting CAS unsuccessful, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn wait_for_rendezvous_to_free(
        &self,
        expected_version: u64,
        deadline: Instant,
    ) -> PhaseResult<()> {
        let mut snapshot = self.get_rdzv_state().await?;
        loop {
            let keep_alives = match &snapshot.state {
                RendezvousState::Final {
                    version,
                    keep_alives,
                    ..
                } if *version == expected_version => keep_alives,
                _ => return Ok(()),
            };

            let alive = self
                .store
                .get(&self.layout.version_dir(expected_version))
                .await?;
            let alive_keys: HashSet<&str> = alive.child_keys().collect();

            if let Some(lapsed) = keep_alives
                .iter()
                .find(|key| !alive_keys.contains(key.as_str()))
            {
                info!("Keep-alive key {} is not renewed.", lapsed);
                info!(
                    "Rendezvous version {} is incomplete. Attempting to destroy it.",
                    expected_version
                );
                match self
                    .store
                    .compare_and_delete(&self.layout.active_version(), &snapshot.raw)
                    .await
                {
                    Ok(()) => info!(
                        "Destroyed rendezvous version {} successfully.",
                        expected_version
                    ),
                    Err(e) if e.is_compare_failed() || e.is_not_found() => debug!(
                        "Rendezvous version {} changed before it could be destroyed: {}",
                        expected_version, e
                    ),
                    Err(e) => return Err(e.into()),
                }
                return Ok(());
            }

            let timeout = deadline.saturating_duration_since(Instant::now())
                + self.config.timings.watch_margin;
            match self
                .store
                .watch(&self.layout.rdzv_dir(), true, snapshot.index + 1, timeout)
                .await
            {
                Ok(_) | Err(StoreError::EventIndexCleared) => {}
                Err(e) => return Err(e.into()),
            }
            if Instant::now() > deadline {
                return Err(PhaseError::Abort(RendezvousError::Timeout));
            }
            snapshot = self.get_rdzv_state().await?;
        }
    }

    /// Mark the job as done. Creates a closed record if none exists.
    pub async fn set_closed(&self) -> Result<(), RendezvousError> {
        let active = self.layout.active_version();
        loop {
            let snapshot = match self.get_rdzv_state().await {
                Ok(snapshot) => snapshot,
                Err(e) if e.is_not_found() => {
                    let closed = RendezvousState::Closed { version: None }.encode()?;
                    match self.store.create(&active, Some(&closed), None).await {
                        Ok(_) => {
                            info!("Marked rendezvous for run {} as closed", self.config.run_id);
                            return Ok(());
                        }
                        Err(StoreError::AlreadyExists { .. }) => continue,
                        Err(e) => return Err(e.into()),
                    }
                }
                Err(e) => return Err(e.into()),
            };
            if snapshot.state.is_closed() {
                return Ok(());
            }

            let closed = snapshot.state.clone().close();
            match self.cas_active(&snapshot, &closed, None).await {
                Ok(_) => {
                    info!("Marked rendezvous for run {} as closed", self.config.run_id);
                    return Ok(());
                }
                Err(e) if e.is_compare_failed() || e.is_not_found() => {
                    info!("Set closed CAS unsuccessful, retrying");
                    tokio::time::sleep(jittered(self.config.timings.cas_delay)).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Merge `key = value` into the version's `extra_data` object.
    pub async fn store_extra_data(
        &self,
        version: u64,
        key: &str,
        value: serde_json::Value,
    ) -> Result<(), RendezvousError> {
        let path = self.layout.extra_data(version);
        let mut initial = serde_json::Map::new();
        initial.insert(key.to_string(), value.clone());
        match self
            .store
            .create(&path, Some(&encode_json(&initial)?), None)
            .await
        {
            Ok(_) => return Ok(()),
            Err(StoreError::AlreadyExists { .. }) => {}
            Err(e) => return Err(e.into()),
        }

        loop {
            let node = self.store.get(&path).await?;
            let mut merged = decode_json(node.value_str())?;
            merged.insert(key.to_string(), value.clone());
            match self
                .store
                .compare_and_swap(&path, &encode_json(&merged)?, node.value_str(), None)
                .await
            {
                Ok(_) => return Ok(()),
                Err(e) if e.is_compare_failed() => {
                    info!("Store extra_data CAS unsuccessful, retrying");
                    tokio::time::sleep(self.config.timings.cas_delay).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Wait up to `timeout` for `key` to appear in the version's
    /// `extra_data` object.
    pub async fn load_extra_data(
        &self,
        version: u64,
        key: &str,
        timeout: Duration,
    ) -> Result<Option<serde_json::Value>, RendezvousError> {
        let path = self.layout.extra_data(version);
        let dir = self.layout.version_dir(version);
        let deadline = Instant::now() + timeout;

        loop {
            let root = self.store.get(&dir).await?;
            if let Some(node) = root.nodes.iter().find(|n| n.key == path) {
                if let Some(value) = decode_json(node.value_str())?.remove(key) {
                    return Ok(Some(value));
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            match self
                .store
                .watch(&path, false, root.store_index + 1, remaining)
                .await
            {
                Ok(_) | Err(StoreError::EventIndexCleared) => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Open the key-value exchange of `version`.
    pub async fn setup_kv_store(&self, version: u64) -> Result<StoreKeyValueExchange, RendezvousError> {
        Ok(StoreKeyValueExchange::open(self.store.clone(), self.layout.kv_dir(version)).await?)
    }

    async fn get_rdzv_state(&self) -> Result<Snapshot, StoreError> {
        let node = self.store.get(&self.layout.active_version()).await?;
        Snapshot::from_node(&node)
    }

    async fn cas_active(
        &self,
        prev: &Snapshot,
        next: &RendezvousState,
        ttl: Option<Duration>,
    ) -> Result<Snapshot, StoreError> {
        let raw = next.encode()?;
        let node = self
            .store
            .compare_and_swap(&self.layout.active_version(), &raw, &prev.raw, ttl)
            .await?;
        Snapshot::from_node(&node)
    }

    /// Block until the active record changes at or after `index`, bounded by
    /// the overall deadline plus a small margin, then re-read it.
    async fn try_wait_for_state_change(
        &self,
        index: u64,
        timeout: Option<Duration>,
        deadline: Instant,
    ) -> PhaseResult<Snapshot> {
        let overall = deadline.saturating_duration_since(Instant::now())
            + self.config.timings.watch_margin;
        let timeout = timeout.map_or(overall, |t| t.min(overall));

        match self
            .store
            .watch(&self.layout.active_version(), false, index, timeout)
            .await
        {
            Ok(_) | Err(StoreError::EventIndexCleared) => {}
            Err(e) => return Err(e.into()),
        }
        if Instant::now() > deadline {
            return Err(PhaseError::Abort(RendezvousError::Timeout));
        }
        Ok(self.get_rdzv_state().await?)
    }
}

async fn create_dir_if_absent(
    store: &dyn CoordinationStore,
    key: &str,
    ttl: Option<Duration>,
) -> Result<(), StoreError> {
    match store.create_dir(key, ttl).await {
        Ok(_) | Err(StoreError::AlreadyExists { .. }) => Ok(()),
        Err(e) => Err(e),
    }
}

fn encode_json(map: &serde_json::Map<String, serde_json::Value>) -> Result<String, StoreError> {
    serde_json::to_string(map).map_err(|e| StoreError::Decode(e.to_string()))
}

fn decode_json(raw: &str) -> Result<serde_json::Map<String, serde_json::Value>, StoreError> {
    serde_json::from_str(raw).map_err(|e| StoreError::Decode(format!("invalid extra_data {raw:?}: {e}")))
}

#[async_trait]
impl RendezvousHandler for RendezvousCoordinator {
    async fn next_rendezvous(&self) -> Result<RendezvousOutcome, RendezvousError> {
        let (version, rank, world_size) = self.rendezvous_barrier().await?;
        debug!("Opening key-value exchange for rendezvous version {}", version);
        let store = self.setup_kv_store(version).await?;
        Ok(RendezvousOutcome {
            store: Arc::new(store),
            rank,
            world_size,
            version,
        })
    }

    async fn is_closed(&self) -> Result<bool, RendezvousError> {
        Ok(self
            .active_state()
            .await?
            .is_some_and(|state| state.is_closed()))
    }

    async fn set_closed(&self) -> Result<(), RendezvousError> {
        RendezvousCoordinator::set_closed(self).await
    }

    async fn num_nodes_waiting(&self) -> Result<u32, RendezvousError> {
        Ok(match self.active_state().await? {
            Some(RendezvousState::Final {
                num_workers_waiting,
                ..
            }) => num_workers_waiting,
            _ => 0,
        })
    }
}
