//! Key-value backends used to replicate bootstrap material.

use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::{Certificate, Client, Identity};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{BootstrapError, Result};
use crate::fs_util;

/// A linearizable single-key get/put service.
pub trait KvStore: Send + Sync {
    /// Returns the value at `key`, or `None` when the key is absent.
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<Vec<u8>>>> + Send;

    fn put(&self, key: &str, value: Vec<u8>) -> impl Future<Output = Result<()>> + Send;
}

/// Client TLS material for the key-value service. Empty paths disable the
/// corresponding piece.
#[derive(Debug, Clone, Default)]
pub struct KvTls<'a> {
    pub ca_file: Option<&'a Path>,
    pub cert_file: Option<&'a Path>,
    pub key_file: Option<&'a Path>,
}

/// Talks to etcd v3 through its JSON gateway (`/v3/kv/range`, `/v3/kv/put`).
#[derive(Debug, Clone)]
pub struct EtcdGatewayClient {
    endpoints: Vec<String>,
    client: Client,
}

#[derive(Serialize)]
struct RangeRequest<'a> {
    key: &'a str,
}

#[derive(Serialize)]
struct PutRequest<'a> {
    key: &'a str,
    value: &'a str,
}

#[derive(Deserialize)]
struct RangeResponse {
    #[serde(default)]
    kvs: Vec<KeyValue>,
}

#[derive(Deserialize)]
struct KeyValue {
    #[serde(default)]
    value: String,
}

impl EtcdGatewayClient {
    /// Builds a client for the comma-separated `endpoints`.
    ///
    /// # Errors
    /// Returns a transport error if no endpoint is given or the TLS material
    /// cannot be loaded.
    pub async fn connect(endpoints: &str, tls: &KvTls<'_>, dial_timeout: Duration) -> Result<Self> {
        let endpoints: Vec<String> = endpoints
            .split(',')
            .map(|e| e.trim().trim_end_matches('/').to_string())
            .filter(|e| !e.is_empty())
            .collect();
        if endpoints.is_empty() {
            return Err(BootstrapError::Transport(
                "no key-value endpoints configured".to_string(),
            ));
        }

        let mut builder = Client::builder().connect_timeout(dial_timeout);
        if let Some(ca_file) = tls.ca_file {
            let pem = fs_util::read(ca_file).await?;
            let cert = Certificate::from_pem(&pem).map_err(|e| {
                BootstrapError::Transport(format!("invalid CA {}: {e}", ca_file.display()))
            })?;
            builder = builder.add_root_certificate(cert);
        }
        if let (Some(cert_file), Some(key_file)) = (tls.cert_file, tls.key_file) {
            let mut pem = fs_util::read(cert_file).await?;
            pem.extend(fs_util::read(key_file).await?);
            let identity = Identity::from_pem(&pem).map_err(|e| {
                BootstrapError::Transport(format!(
                    "invalid client identity {}: {e}",
                    cert_file.display()
                ))
            })?;
            builder = builder.identity(identity);
        }
        let client = builder
            .build()
            .map_err(|e| BootstrapError::Transport(format!("failed to build client: {e}")))?;

        Ok(Self { endpoints, client })
    }

    async fn post<T: Serialize + Sync>(&self, path: &str, body: &T) -> Result<reqwest::Response> {
        let mut last_error = None;
        for endpoint in &self.endpoints {
            let url = format!("{endpoint}{path}");
            match self.client.post(&url).json(body).send().await {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) => {
                    last_error = Some(format!("{url} returned {}", response.status()));
                }
                Err(err) => {
                    debug!("Key-value endpoint {url} failed: {err}");
                    last_error = Some(format!("{url}: {err}"));
                }
            }
        }
        Err(BootstrapError::Transport(
            last_error.unwrap_or_else(|| "no endpoints".to_string()),
        ))
    }
}

impl KvStore for EtcdGatewayClient {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let encoded = STANDARD.encode(key);
        let response = self
            .post("/v3/kv/range", &RangeRequest { key: &encoded })
            .await?;
        let range: RangeResponse = response
            .json()
            .await
            .map_err(|e| BootstrapError::Transport(format!("invalid range response: {e}")))?;
        let Some(kv) = range.kvs.into_iter().next() else {
            return Ok(None);
        };
        let value = STANDARD
            .decode(kv.value)
            .map_err(|e| BootstrapError::Transport(format!("invalid value encoding: {e}")))?;
        Ok(Some(value))
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let key = STANDARD.encode(key);
        let value = STANDARD.encode(value);
        self.post(
            "/v3/kv/put",
            &PutRequest {
                key: &key,
                value: &value,
            },
        )
        .await?;
        Ok(())
    }
}

/// Process-local store, shared between clones.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.inner.lock().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.inner.lock().await.insert(key.to_string(), value);
        Ok(())
    }
}
