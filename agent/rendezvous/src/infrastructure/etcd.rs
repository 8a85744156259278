// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! etcd v2 Coordination Store Implementation
//!
//! Implements [`CoordinationStore`] over the etcd v2 HTTP keys API.
//!
//! # API Endpoints
//!
//! - `GET /v2/keys/<key>` - Read a key or list a directory
//! - `GET /v2/keys/<key>?wait=true&waitIndex=N[&recursive=true]` - Long-poll watch
//! - `PUT /v2/keys/<key>` (form: `value`, `ttl`, `dir`, `prevExist`, `prevValue`, `refresh`) - Writes
//! - `DELETE /v2/keys/<key>[?prevValue=..]` - Delete / compare-and-delete
//!
//! Every response carries the store-wide index in the `X-Etcd-Index` header.
//!
//! # Error Codes
//!
//! | Code | Meaning | Mapped to |
//! |------|---------|-----------|
//! | 100 | Key not found | `StoreError::NotFound` |
//! | 101 | Compare failed | `StoreError::CompareFailed` |
//! | 105 | Key already exists | `StoreError::AlreadyExists` |
//! | 401 | Event index cleared | `StoreError::EventIndexCleared` |

use async_trait::async_trait;
use reqwest::{Certificate, Client, Identity, RequestBuilder, Response};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use crate::domain::config::{ConfigError, Protocol, StoreEndpoint};
use crate::domain::store::{CoordinationStore, Node, StoreError, WatchAction, WatchEvent};

const ETCD_INDEX_HEADER: &str = "X-Etcd-Index";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

const ERROR_KEY_NOT_FOUND: u32 = 100;
const ERROR_COMPARE_FAILED: u32 = 101;
const ERROR_NODE_EXIST: u32 = 105;
const ERROR_EVENT_INDEX_CLEARED: u32 = 401;

#[derive(Debug, Deserialize)]
struct EtcdResponse {
    action: String,
    node: Option<EtcdNode>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EtcdNode {
    key: Option<String>,
    value: Option<String>,
    #[serde(default)]
    dir: bool,
    #[serde(default)]
    modified_index: u64,
    ttl: Option<i64>,
    #[serde(default)]
    nodes: Vec<EtcdNode>,
}

impl EtcdNode {
    fn into_node(self, store_index: u64) -> Node {
        Node {
            key: self.key.unwrap_or_else(|| "/".to_string()),
            value: self.value,
            dir: self.dir,
            modified_index: self.modified_index,
            ttl: self.ttl,
            store_index,
            nodes: self
                .nodes
                .into_iter()
                .map(|n| n.into_node(store_index))
                .collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EtcdErrorBody {
    error_code: u32,
    message: String,
    #[serde(default)]
    cause: Option<String>,
}

/// etcd v2 HTTP adapter
pub struct EtcdV2Store {
    client: Client,
    /// e.g. "http://localhost:2379"
    base_url: String,
}

impl EtcdV2Store {
    /// Build an adapter for the given endpoint, loading TLS material when
    /// the endpoint uses https.
    pub fn new(endpoint: &StoreEndpoint) -> Result<Self, ConfigError> {
        let mut builder = Client::builder().connect_timeout(CONNECT_TIMEOUT);

        if endpoint.protocol == Protocol::Https {
            if let Some(ca_path) = &endpoint.ca_cert {
                let pem = read_pem(ca_path)?;
                let ca = Certificate::from_pem(&pem).map_err(|e| {
                    ConfigError::Invalid(format!("invalid CA certificate {}: {e}", ca_path.display()))
                })?;
                builder = builder.add_root_certificate(ca);
            }
            if let Some(cert_path) = &endpoint.cert {
                let mut pem = read_pem(cert_path)?;
                if let Some(key_path) = &endpoint.key {
                    pem.push(b'\n');
                    pem.extend(read_pem(key_path)?);
                }
                let identity = Identity::from_pem(&pem).map_err(|e| {
                    ConfigError::Invalid(format!(
                        "invalid client certificate {}: {e}",
                        cert_path.display()
                    ))
                })?;
                builder = builder.identity(identity);
            }
        }

        let client = builder
            .build()
            .map_err(|e| ConfigError::Invalid(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: endpoint.base_url(),
        })
    }

    fn build_url(&self, key: &str) -> String {
        format!("{}/v2/keys{}", self.base_url, key)
    }

    async fn send(&self, request: RequestBuilder) -> Result<Node, StoreError> {
        let response = request.send().await?;
        let (_, node) = parse_response(response).await?;
        node.ok_or_else(|| StoreError::Decode("response carries no node".to_string()))
    }

    async fn send_unit(&self, request: RequestBuilder) -> Result<(), StoreError> {
        let response = request.send().await?;
        parse_response(response).await.map(|_| ())
    }
}

fn read_pem(path: &std::path::Path) -> Result<Vec<u8>, ConfigError> {
    std::fs::read(path)
        .map_err(|e| ConfigError::Invalid(format!("cannot read {}: {e}", path.display())))
}

/// etcd TTLs are whole seconds; round up so a lease never shrinks.
fn ttl_secs(ttl: Duration) -> String {
    let secs = ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0);
    secs.max(1).to_string()
}

fn store_index(response: &Response) -> u64 {
    response
        .headers()
        .get(ETCD_INDEX_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .unwrap_or_default()
}

async fn parse_response(response: Response) -> Result<(String, Option<Node>), StoreError> {
    let index = store_index(&response);
    let status = response.status();
    let body = response.text().await?;

    if status.is_success() {
        let parsed: EtcdResponse = serde_json::from_str(&body)
            .map_err(|e| StoreError::Decode(format!("{e}: {body}")))?;
        return Ok((parsed.action, parsed.node.map(|n| n.into_node(index))));
    }

    let error: EtcdErrorBody = serde_json::from_str(&body).map_err(|_| StoreError::Protocol {
        code: u32::from(status.as_u16()),
        message: body.clone(),
    })?;
    let key = error.cause.clone().unwrap_or_default();
    Err(match error.error_code {
        ERROR_KEY_NOT_FOUND => StoreError::NotFound { key },
        ERROR_COMPARE_FAILED => StoreError::CompareFailed { key },
        ERROR_NODE_EXIST => StoreError::AlreadyExists { key },
        ERROR_EVENT_INDEX_CLEARED => StoreError::EventIndexCleared,
        code => StoreError::Protocol {
            code,
            message: error.message,
        },
    })
}

fn parse_action(action: &str) -> Result<WatchAction, StoreError> {
    serde_json::from_value(serde_json::Value::String(action.to_string()))
        .map_err(|_| StoreError::Decode(format!("unexpected watch action '{action}'")))
}

#[async_trait]
impl CoordinationStore for EtcdV2Store {
    async fn get(&self, key: &str) -> Result<Node, StoreError> {
        let request = self
            .client
            .get(self.build_url(key))
            .timeout(REQUEST_TIMEOUT);
        self.send(request).await
    }

    async fn create(
        &self,
        key: &str,
        value: Option<&str>,
        ttl: Option<Duration>,
    ) -> Result<Node, StoreError> {
        let mut form = vec![
            ("prevExist", "false".to_string()),
            ("value", value.unwrap_or_default().to_string()),
        ];
        if let Some(ttl) = ttl {
            form.push(("ttl", ttl_secs(ttl)));
        }
        let request = self
            .client
            .put(self.build_url(key))
            .form(&form)
            .timeout(REQUEST_TIMEOUT);
        self.send(request).await
    }

    async fn create_dir(&self, key: &str, ttl: Option<Duration>) -> Result<Node, StoreError> {
        let mut form = vec![("prevExist", "false".to_string()), ("dir", "true".to_string())];
        if let Some(ttl) = ttl {
            form.push(("ttl", ttl_secs(ttl)));
        }
        let request = self
            .client
            .put(self.build_url(key))
            .form(&form)
            .timeout(REQUEST_TIMEOUT);
        self.send(request).await
    }

    async fn set(
        &self,
        key: &str,
        value: Option<&str>,
        ttl: Option<Duration>,
    ) -> Result<Node, StoreError> {
        let mut form = vec![("value", value.unwrap_or_default().to_string())];
        if let Some(ttl) = ttl {
            form.push(("ttl", ttl_secs(ttl)));
        }
        let request = self
            .client
            .put(self.build_url(key))
            .form(&form)
            .timeout(REQUEST_TIMEOUT);
        self.send(request).await
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        value: &str,
        prev_value: &str,
        ttl: Option<Duration>,
    ) -> Result<Node, StoreError> {
        // An empty ttl makes the key durable again.
        let form = vec![
            ("value", value.to_string()),
            ("prevValue", prev_value.to_string()),
            ("ttl", ttl.map(ttl_secs).unwrap_or_default()),
        ];
        let request = self
            .client
            .put(self.build_url(key))
            .form(&form)
            .timeout(REQUEST_TIMEOUT);
        self.send(request).await
    }

    async fn compare_and_delete(&self, key: &str, prev_value: &str) -> Result<(), StoreError> {
        let request = self
            .client
            .delete(self.build_url(key))
            .query(&[("prevValue", prev_value)])
            .timeout(REQUEST_TIMEOUT);
        self.send_unit(request).await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let request = self
            .client
            .delete(self.build_url(key))
            .query(&[("recursive", "true")])
            .timeout(REQUEST_TIMEOUT);
        self.send_unit(request).await
    }

    async fn refresh(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        let form = vec![
            ("refresh", "true".to_string()),
            ("prevExist", "true".to_string()),
            ("ttl", ttl_secs(ttl)),
        ];
        let request = self
            .client
            .put(self.build_url(key))
            .form(&form)
            .timeout(REQUEST_TIMEOUT);
        self.send_unit(request).await
    }

    async fn watch(
        &self,
        key: &str,
        recursive: bool,
        after_index: u64,
        timeout: Duration,
    ) -> Result<Option<WatchEvent>, StoreError> {
        let request = self
            .client
            .get(self.build_url(key))
            .query(&[
                ("wait", "true".to_string()),
                ("waitIndex", after_index.to_string()),
                ("recursive", recursive.to_string()),
            ])
            .timeout(timeout);

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) if e.is_timeout() => {
                debug!("Watch on {} timed out after {:?}", key, timeout);
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let (action, node) = match parse_response(response).await {
            Ok(parsed) => parsed,
            Err(StoreError::Http(e)) if e.is_timeout() => return Ok(None),
            Err(e) => return Err(e),
        };
        let node =
            node.ok_or_else(|| StoreError::Decode("watch response carries no node".to_string()))?;

        Ok(Some(WatchEvent {
            action: parse_action(&action)?,
            key: node.key,
            index: node.modified_index,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_for(server: &mockito::Server) -> EtcdV2Store {
        let url = url::Url::parse(&server.url()).unwrap();
        let endpoint = StoreEndpoint::new(url.host_str().unwrap(), url.port().unwrap());
        EtcdV2Store::new(&endpoint).unwrap()
    }

    #[test]
    fn test_ttl_rounds_up() {
        assert_eq!(ttl_secs(Duration::from_millis(1500)), "2");
        assert_eq!(ttl_secs(Duration::from_secs(10)), "10");
        assert_eq!(ttl_secs(Duration::ZERO), "1");
    }

    #[tokio::test]
    async fn test_get_directory() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/v2/keys/p/run_1/rdzv/v_1")
            .with_status(200)
            .with_header("X-Etcd-Index", "17")
            .with_body(
                r#"{"action":"get","node":{"key":"/p/run_1/rdzv/v_1","dir":true,
                "modifiedIndex":9,"nodes":[
                  {"key":"/p/run_1/rdzv/v_1/rank_0","value":"","ttl":8,"modifiedIndex":12},
                  {"key":"/p/run_1/rdzv/v_1/kv","dir":true,"modifiedIndex":14}]}}"#,
            )
            .create_async()
            .await;

        let node = store_for(&server).get("/p/run_1/rdzv/v_1").await.unwrap();
        mock.assert_async().await;
        assert!(node.dir);
        assert_eq!(node.store_index, 17);
        assert_eq!(node.nodes.len(), 2);
        assert_eq!(node.nodes[0].ttl, Some(8));
        assert_eq!(
            node.child_keys().collect::<Vec<_>>(),
            vec!["/p/run_1/rdzv/v_1/rank_0", "/p/run_1/rdzv/v_1/kv"]
        );
    }

    #[tokio::test]
    async fn test_error_codes_are_mapped() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v2/keys/missing")
            .with_status(404)
            .with_body(r#"{"errorCode":100,"message":"Key not found","cause":"/missing","index":3}"#)
            .create_async()
            .await;
        server
            .mock("PUT", "/v2/keys/taken")
            .with_status(412)
            .with_body(r#"{"errorCode":105,"message":"Key already exists","cause":"/taken","index":3}"#)
            .create_async()
            .await;
        server
            .mock("PUT", "/v2/keys/record")
            .with_status(412)
            .with_body(r#"{"errorCode":101,"message":"Compare failed","cause":"[a != b]","index":3}"#)
            .create_async()
            .await;

        let store = store_for(&server);
        assert!(store.get("/missing").await.unwrap_err().is_not_found());
        assert!(matches!(
            store.create("/taken", Some("x"), None).await,
            Err(StoreError::AlreadyExists { .. })
        ));
        assert!(store
            .compare_and_swap("/record", "b", "a", None)
            .await
            .unwrap_err()
            .is_compare_failed());
    }

    #[tokio::test]
    async fn test_create_sends_prev_exist_and_ttl() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("PUT", "/v2/keys/p/run_1/rdzv/active_version")
            .match_body(mockito::Matcher::AllOf(vec![
                mockito::Matcher::UrlEncoded("prevExist".into(), "false".into()),
                mockito::Matcher::UrlEncoded("value".into(), r#"{"status":"setup"}"#.into()),
                mockito::Matcher::UrlEncoded("ttl".into(), "5".into()),
            ]))
            .with_status(201)
            .with_header("X-Etcd-Index", "4")
            .with_body(
                r#"{"action":"create","node":{"key":"/p/run_1/rdzv/active_version",
                "value":"{\"status\":\"setup\"}","ttl":5,"modifiedIndex":4}}"#,
            )
            .create_async()
            .await;

        let node = store_for(&server)
            .create(
                "/p/run_1/rdzv/active_version",
                Some(r#"{"status":"setup"}"#),
                Some(Duration::from_secs(5)),
            )
            .await
            .unwrap();
        mock.assert_async().await;
        assert_eq!(node.modified_index, 4);
        assert_eq!(node.value_str(), r#"{"status":"setup"}"#);
    }

    #[tokio::test]
    async fn test_watch_returns_event() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v2/keys/p/run_1/rdzv")
            .match_query(mockito::Matcher::AllOf(vec![
                mockito::Matcher::UrlEncoded("wait".into(), "true".into()),
                mockito::Matcher::UrlEncoded("waitIndex".into(), "21".into()),
                mockito::Matcher::UrlEncoded("recursive".into(), "true".into()),
            ]))
            .with_status(200)
            .with_body(
                r#"{"action":"expire","node":{"key":"/p/run_1/rdzv/v_2/rank_1",
                "modifiedIndex":23,"createdIndex":12}}"#,
            )
            .create_async()
            .await;

        let event = store_for(&server)
            .watch("/p/run_1/rdzv", true, 21, Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.action, WatchAction::Expire);
        assert_eq!(event.key, "/p/run_1/rdzv/v_2/rank_1");
        assert_eq!(event.index, 23);
    }

    #[tokio::test]
    async fn test_watch_index_cleared() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v2/keys/k")
            .match_query(mockito::Matcher::Any)
            .with_status(400)
            .with_body(r#"{"errorCode":401,"message":"The event in requested index is outdated and cleared","cause":"the requested history has been cleared [1008/3]","index":2007}"#)
            .create_async()
            .await;

        let result = store_for(&server)
            .watch("/k", false, 3, Duration::from_secs(5))
            .await;
        assert!(matches!(result, Err(StoreError::EventIndexCleared)));
    }
}
