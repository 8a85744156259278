// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Store key layout for one job:
//!
//! ```text
//! <prefix>/run_<id>/rdzv/version_counter
//! <prefix>/run_<id>/rdzv/active_version
//! <prefix>/run_<id>/rdzv/v_<n>/rank_<r>
//! <prefix>/run_<id>/rdzv/v_<n>/kv/<encoded-key>
//! <prefix>/run_<id>/rdzv/v_<n>/extra_data
//! ```

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyLayout {
    prefix: String,
    run: String,
}

impl KeyLayout {
    pub fn new(prefix: &str, run_id: &str) -> Self {
        let prefix = format!("/{}", prefix.trim_matches('/'));
        let run = if prefix == "/" {
            format!("/run_{run_id}")
        } else {
            format!("{prefix}/run_{run_id}")
        };
        Self { prefix, run }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn run_dir(&self) -> &str {
        &self.run
    }

    pub fn rdzv_dir(&self) -> String {
        format!("{}/rdzv", self.run)
    }

    pub fn version_counter(&self) -> String {
        format!("{}/rdzv/version_counter", self.run)
    }

    pub fn active_version(&self) -> String {
        format!("{}/rdzv/active_version", self.run)
    }

    pub fn version_dir(&self, version: u64) -> String {
        format!("{}/rdzv/v_{version}", self.run)
    }

    pub fn keep_alive(&self, version: u64, rank: u32) -> String {
        format!("{}/rdzv/v_{version}/rank_{rank}", self.run)
    }

    pub fn kv_dir(&self, version: u64) -> String {
        format!("{}/rdzv/v_{version}/kv", self.run)
    }

    pub fn extra_data(&self, version: u64) -> String {
        format!("{}/rdzv/v_{version}/extra_data", self.run)
    }
}
