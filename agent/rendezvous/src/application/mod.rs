// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod coordinator;
pub mod exchange;
pub mod lease;

pub use coordinator::RendezvousCoordinator;
pub use exchange::StoreKeyValueExchange;
pub use lease::LeaseKeeper;

use rand::Rng;
use std::time::Duration;

/// Uniformly random pause in `[0, max]`, used to spread out contending CAS
/// attempts from different nodes.
pub(crate) fn jittered(max: Duration) -> Duration {
    let max_ms = u64::try_from(max.as_millis()).unwrap_or(u64::MAX);
    Duration::from_millis(rand::rng().random_range(0..=max_ms))
}
