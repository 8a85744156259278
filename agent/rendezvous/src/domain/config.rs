// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Rendezvous Configuration
//!
//! A rendezvous is selected and parametrized by a single URL:
//!
//! ```text
//! etcd://<host>[:<port>]/<run_id>?min_workers=N[&max_workers=M][&timeout=S]
//!     [&last_call_timeout=S][&prefix=/path][&protocol=http|https]
//!     [&cacert=FILE][&cert=FILE][&key=FILE]
//! ```
//!
//! | Parameter | Default |
//! |-----------|---------|
//! | `max_workers` | `min_workers` |
//! | `timeout` | 600 s |
//! | `last_call_timeout` | 30 s |
//! | `prefix` (alias `etcd_prefix`) | `/torchelastic/p2p` |
//! | `protocol` | `http` |
//! | port | 2379 |

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use url::Url;

pub const DEFAULT_STORE_PORT: u16 = 2379;
pub const DEFAULT_PREFIX: &str = "/torchelastic/p2p";
pub const DEFAULT_OVERALL_TIMEOUT: Duration = Duration::from_secs(600);
pub const DEFAULT_LAST_CALL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid rendezvous URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("Unsupported rendezvous scheme '{0}' (expected 'etcd')")]
    UnsupportedScheme(String),

    #[error("Missing required rendezvous parameter '{0}'")]
    MissingParameter(&'static str),

    #[error("Invalid value '{value}' for rendezvous parameter '{name}'")]
    InvalidParameter { name: String, value: String },

    #[error("Invalid rendezvous configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    Https,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Https => "https",
        }
    }
}

/// Where the coordination store lives and how to reach it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreEndpoint {
    pub host: String,
    pub port: u16,
    pub protocol: Protocol,
    /// CA certificate used to verify the store (https only)
    pub ca_cert: Option<PathBuf>,
    /// Client certificate (https only, requires `key`)
    pub cert: Option<PathBuf>,
    /// Client private key (https only, requires `cert`)
    pub key: Option<PathBuf>,
}

impl StoreEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            protocol: Protocol::Http,
            ca_cert: None,
            cert: None,
            key: None,
        }
    }

    pub fn base_url(&self) -> String {
        format!("{}://{}:{}", self.protocol.as_str(), self.host, self.port)
    }
}

/// TTLs and retry pacing used internally by the rendezvous protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RendezvousTimings {
    /// TTL of the `setup` placeholder while a version number is allocated
    pub setup_ttl: Duration,
    /// TTL of a `frozen` record that is still collecting confirmations
    pub frozen_ttl: Duration,
    /// TTL of a `joinable` record once `min_workers` have joined
    pub joinable_ephemeral_ttl: Duration,
    /// TTL of each participant's keep-alive key
    pub keep_alive_ttl: Duration,
    /// TTL of the whole `run_<id>` subtree
    pub run_id_ttl: Duration,
    /// Extra time granted to a blocking watch beyond the overall deadline
    pub watch_margin: Duration,
    /// Upper bound of the jittered pause after a retryable failure
    pub retry_delay: Duration,
    /// Upper bound of the jittered pause before every CAS attempt
    pub cas_delay: Duration,
}

impl Default for RendezvousTimings {
    fn default() -> Self {
        Self {
            setup_ttl: Duration::from_secs(5),
            frozen_ttl: Duration::from_secs(10),
            joinable_ephemeral_ttl: Duration::from_secs(10),
            keep_alive_ttl: Duration::from_secs(10),
            run_id_ttl: Duration::from_secs(7200),
            watch_margin: Duration::from_secs(1),
            retry_delay: Duration::from_secs(1),
            cas_delay: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RendezvousConfig {
    pub endpoint: StoreEndpoint,
    /// Unique id of the job; several jobs may share one store
    pub run_id: String,
    /// Root path under which all keys of all jobs are created
    pub prefix: String,
    pub min_workers: u32,
    pub max_workers: u32,
    /// Overall deadline of a single `next_rendezvous()` call
    pub timeout: Duration,
    /// Grace window for elastic joiners once `min_workers` is reached
    pub last_call_timeout: Duration,
    #[serde(default)]
    pub timings: RendezvousTimings,
}

impl RendezvousConfig {
    /// Configuration with defaults for everything except the group bounds.
    pub fn new(run_id: impl Into<String>, min_workers: u32, max_workers: u32) -> Self {
        Self {
            endpoint: StoreEndpoint::new("localhost", DEFAULT_STORE_PORT),
            run_id: run_id.into(),
            prefix: DEFAULT_PREFIX.to_string(),
            min_workers,
            max_workers,
            timeout: DEFAULT_OVERALL_TIMEOUT,
            last_call_timeout: DEFAULT_LAST_CALL_TIMEOUT,
            timings: RendezvousTimings::default(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_last_call_timeout(mut self, last_call_timeout: Duration) -> Self {
        self.last_call_timeout = last_call_timeout;
        self
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Parse a rendezvous URL (see module docs for the format).
    pub fn from_url(raw: &str) -> Result<Self, ConfigError> {
        let url = Url::parse(raw)?;
        if url.scheme() != "etcd" {
            return Err(ConfigError::UnsupportedScheme(url.scheme().to_string()));
        }

        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| ConfigError::Invalid(format!("no store host in '{raw}'")))?
            .to_string();
        let port = url.port().unwrap_or(DEFAULT_STORE_PORT);

        let run_id = url.path().trim_matches('/').to_string();
        if run_id.is_empty() {
            return Err(ConfigError::Invalid(format!("no run id in '{raw}'")));
        }

        let params: std::collections::HashMap<String, String> =
            url.query_pairs().into_owned().collect();

        let min_workers: u32 = match params.get("min_workers") {
            Some(v) => parse_param("min_workers", v)?,
            None => return Err(ConfigError::MissingParameter("min_workers")),
        };
        let max_workers: u32 = match params.get("max_workers") {
            Some(v) => parse_param("max_workers", v)?,
            None => min_workers,
        };
        let timeout = match params.get("timeout") {
            Some(v) => Duration::from_secs(parse_param("timeout", v)?),
            None => DEFAULT_OVERALL_TIMEOUT,
        };
        let last_call_timeout = match params.get("last_call_timeout") {
            Some(v) => Duration::from_secs(parse_param("last_call_timeout", v)?),
            None => DEFAULT_LAST_CALL_TIMEOUT,
        };
        let prefix = params
            .get("prefix")
            .or_else(|| params.get("etcd_prefix"))
            .cloned()
            .unwrap_or_else(|| DEFAULT_PREFIX.to_string());

        let protocol = match params.get("protocol").map(String::as_str) {
            None | Some("http") => Protocol::Http,
            Some("https") => Protocol::Https,
            Some(other) => {
                return Err(ConfigError::InvalidParameter {
                    name: "protocol".to_string(),
                    value: other.to_string(),
                })
            }
        };

        let endpoint = StoreEndpoint {
            host,
            port,
            protocol,
            ca_cert: params.get("cacert").map(PathBuf::from),
            cert: params.get("cert").map(PathBuf::from),
            key: params.get("key").map(PathBuf::from),
        };

        let config = Self {
            endpoint,
            run_id,
            prefix,
            min_workers,
            max_workers,
            timeout,
            last_call_timeout,
            timings: RendezvousTimings::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_workers < 1 {
            return Err(ConfigError::Invalid(
                "min_workers should be at least 1".to_string(),
            ));
        }
        if self.max_workers < self.min_workers {
            return Err(ConfigError::Invalid(format!(
                "max_workers ({}) cannot be less than min_workers ({})",
                self.max_workers, self.min_workers
            )));
        }
        if self.endpoint.key.is_some() && self.endpoint.cert.is_none() {
            return Err(ConfigError::Invalid(
                "client key given without a client certificate".to_string(),
            ));
        }
        if self.endpoint.protocol == Protocol::Http
            && (self.endpoint.ca_cert.is_some() || self.endpoint.cert.is_some())
        {
            return Err(ConfigError::Invalid(
                "certificates require protocol=https".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_param<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidParameter {
        name: name.to_string(),
        value: value.to_string(),
    })
}
