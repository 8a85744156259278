// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod config;
pub mod error;
pub mod handler;
pub mod kv;
pub mod layout;
pub mod state;
pub mod store;
