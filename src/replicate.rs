//! Sharing CA and credential material between control-plane replicas.
//!
//! The first replica to start publishes a [`BootstrapBundle`] under a single
//! key; later replicas adopt it before generating anything locally. Publishing
//! is read-then-write-if-absent and not atomic: two replicas racing on an
//! empty key may both write, and the last write wins.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{BootstrapError, Result};
use crate::fs_util;
use crate::kv::KvStore;
use crate::paths::ControlPaths;

pub const RUNTIME_KEY: &str = "/k2s/runtime";
pub const SUPPORTED_BACKEND: &str = "etcd3";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapMode {
    None,
    Read,
    Write,
    Full,
}

impl FromStr for BootstrapMode {
    type Err = BootstrapError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "" | "none" => Ok(Self::None),
            "read" => Ok(Self::Read),
            "write" => Ok(Self::Write),
            "full" => Ok(Self::Full),
            other => Err(BootstrapError::Config(format!(
                "unsupported bootstrap type [{other}]"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Fetch,
    Store,
}

impl Direction {
    fn accepts(self, mode: BootstrapMode) -> bool {
        match self {
            Self::Fetch => matches!(mode, BootstrapMode::Read | BootstrapMode::Full),
            Self::Store => matches!(mode, BootstrapMode::Write | BootstrapMode::Full),
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fetch => f.write_str("fetching"),
            Self::Store => f.write_str("storing"),
        }
    }
}

/// Decides whether `direction` may run under the configured mode and backend.
///
/// # Errors
/// Returns `Config` for an unknown mode, or when a replicating mode is set
/// without the etcd3 backend.
pub fn check_mode(mode: &str, backend: &str, direction: Direction) -> Result<bool> {
    let mode = mode.parse::<BootstrapMode>()?;
    if mode == BootstrapMode::None {
        return Ok(false);
    }
    if backend != SUPPORTED_BACKEND {
        return Err(BootstrapError::Config(format!(
            "bootstrap only supported with {SUPPORTED_BACKEND} as storage backend"
        )));
    }
    Ok(direction.accepts(mode))
}

/// Like [`check_mode`], but a configuration problem is logged and treated
/// as "disabled".
#[must_use]
pub fn permitted(mode: &str, backend: &str, direction: Direction) -> bool {
    match check_mode(mode, backend, direction) {
        Ok(enabled) => enabled,
        Err(err) => {
            warn!("Not {direction} bootstrap data: {err}");
            false
        }
    }
}

/// Every replicated file, embedded as text.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapBundle {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub server_ca_data: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub server_ca_key_data: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub client_ca_data: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub client_ca_key_data: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub service_key_data: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub passwd_file_data: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub request_header_ca_data: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub request_header_ca_key_data: String,
}

/// Which CA pairs a fetch replaced with different material.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChangedAuthorities {
    pub server: bool,
    pub client: bool,
    pub request_header: bool,
}

impl ChangedAuthorities {
    #[must_use]
    pub fn any(self) -> bool {
        self.server || self.client || self.request_header
    }
}

#[derive(Clone, Copy)]
enum Owner {
    ServerCa,
    ClientCa,
    RequestHeaderCa,
    Other,
}

impl BootstrapBundle {
    fn fields<'a>(&'a self, paths: &'a ControlPaths) -> [(Owner, &'a Path, &'a str); 8] {
        [
            (Owner::ServerCa, paths.server_ca.cert.as_path(), self.server_ca_data.as_str()),
            (Owner::ServerCa, paths.server_ca.key.as_path(), self.server_ca_key_data.as_str()),
            (Owner::ClientCa, paths.client_ca.cert.as_path(), self.client_ca_data.as_str()),
            (Owner::ClientCa, paths.client_ca.key.as_path(), self.client_ca_key_data.as_str()),
            (Owner::Other, paths.service_key.as_path(), self.service_key_data.as_str()),
            (Owner::Other, paths.passwd_file.as_path(), self.passwd_file_data.as_str()),
            (
                Owner::RequestHeaderCa,
                paths.request_header_ca.cert.as_path(),
                self.request_header_ca_data.as_str(),
            ),
            (
                Owner::RequestHeaderCa,
                paths.request_header_ca.key.as_path(),
                self.request_header_ca_key_data.as_str(),
            ),
        ]
    }

    /// Reads every replicated file from the local data directory.
    ///
    /// # Errors
    /// Returns an error if any file is missing or not UTF-8.
    pub async fn read_local(paths: &ControlPaths) -> Result<Self> {
        Ok(Self {
            server_ca_data: read_text(&paths.server_ca.cert).await?,
            server_ca_key_data: read_text(&paths.server_ca.key).await?,
            client_ca_data: read_text(&paths.client_ca.cert).await?,
            client_ca_key_data: read_text(&paths.client_ca.key).await?,
            service_key_data: read_text(&paths.service_key).await?,
            passwd_file_data: read_text(&paths.passwd_file).await?,
            request_header_ca_data: read_text(&paths.request_header_ca.cert).await?,
            request_header_ca_key_data: read_text(&paths.request_header_ca.key).await?,
        })
    }

    /// Overwrites the local files with the bundle contents. Empty fields are
    /// left alone. Returns the CA pairs whose certificate or key differed
    /// from what was on disk.
    ///
    /// # Errors
    /// Returns an error if a file cannot be read or written.
    pub async fn write_local(&self, paths: &ControlPaths) -> Result<ChangedAuthorities> {
        let mut changed = ChangedAuthorities::default();
        for (owner, path, data) in self.fields(paths) {
            if data.is_empty() {
                continue;
            }
            let current = fs_util::read_optional(path).await?;
            if current.as_deref() == Some(data.as_bytes()) {
                continue;
            }
            fs_util::write_secret(path, data).await?;
            match owner {
                Owner::ServerCa => changed.server = true,
                Owner::ClientCa => changed.client = true,
                Owner::RequestHeaderCa => changed.request_header = true,
                Owner::Other => {}
            }
        }
        Ok(changed)
    }
}

async fn read_text(path: &Path) -> Result<String> {
    let bytes = fs_util::read(path).await?;
    String::from_utf8(bytes).map_err(|e| BootstrapError::Credential {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

pub struct BootstrapReplicator<S> {
    store: S,
}

impl<S: KvStore> BootstrapReplicator<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Adopts the published bundle, if any. Returns `None` when nothing is
    /// published, otherwise the CA pairs that changed on disk.
    ///
    /// # Errors
    /// Returns an error if the store is unreachable, the bundle is malformed,
    /// or the files cannot be written.
    pub async fn fetch(&self, paths: &ControlPaths) -> Result<Option<ChangedAuthorities>> {
        let value = match self.store.get(RUNTIME_KEY).await? {
            Some(value) if !value.is_empty() => value,
            _ => {
                info!("No bootstrap data at {RUNTIME_KEY}, acting as first replica");
                return Ok(None);
            }
        };

        let json = STANDARD
            .decode(&value)
            .map_err(|e| BootstrapError::Bundle(format!("not base64: {e}")))?;
        let bundle: BootstrapBundle = serde_json::from_slice(&json)
            .map_err(|e| BootstrapError::Bundle(format!("not a bundle: {e}")))?;
        let changed = bundle.write_local(paths).await?;
        if changed.any() {
            warn!("Bootstrap data from {RUNTIME_KEY} replaced local CAs: {changed:?}");
        } else {
            info!("Adopted bootstrap data from {RUNTIME_KEY}");
        }
        Ok(Some(changed))
    }

    /// Publishes the local bundle unless one is already stored. Returns true
    /// when this call wrote the key.
    ///
    /// # Errors
    /// Returns an error if the store is unreachable or local files are missing.
    pub async fn store(&self, paths: &ControlPaths) -> Result<bool> {
        if let Some(existing) = self.store.get(RUNTIME_KEY).await?
            && !existing.is_empty()
        {
            info!("Bootstrap data already published at {RUNTIME_KEY}");
            return Ok(false);
        }

        let bundle = BootstrapBundle::read_local(paths).await?;
        let json = serde_json::to_vec(&bundle)
            .map_err(|e| BootstrapError::Bundle(format!("failed to encode: {e}")))?;
        self.store
            .put(RUNTIME_KEY, STANDARD.encode(json).into_bytes())
            .await?;
        info!("Published bootstrap data to {RUNTIME_KEY}");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::kv::MemoryStore;

    async fn seed(paths: &ControlPaths, tag: &str) {
        published(tag).write_local(paths).await.unwrap();
    }

    fn published(tag: &str) -> BootstrapBundle {
        BootstrapBundle {
            server_ca_data: format!("server-ca-{tag}"),
            server_ca_key_data: format!("server-ca-key-{tag}"),
            client_ca_data: format!("client-ca-{tag}"),
            client_ca_key_data: format!("client-ca-key-{tag}"),
            service_key_data: format!("service-{tag}"),
            passwd_file_data: format!("pw,server,k2s:server-{tag}\n"),
            request_header_ca_data: format!("rh-ca-{tag}"),
            request_header_ca_key_data: format!("rh-ca-key-{tag}"),
        }
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!("".parse::<BootstrapMode>().unwrap(), BootstrapMode::None);
        assert_eq!("full".parse::<BootstrapMode>().unwrap(), BootstrapMode::Full);
        assert!(matches!(
            "sometimes".parse::<BootstrapMode>(),
            Err(BootstrapError::Config(_))
        ));
    }

    #[test]
    fn test_check_mode_gating() {
        assert!(check_mode("read", "etcd3", Direction::Fetch).unwrap());
        assert!(!check_mode("read", "etcd3", Direction::Store).unwrap());
        assert!(check_mode("write", "etcd3", Direction::Store).unwrap());
        assert!(check_mode("full", "etcd3", Direction::Fetch).unwrap());
        assert!(!check_mode("none", "sqlite", Direction::Fetch).unwrap());
        assert!(check_mode("full", "sqlite", Direction::Fetch).is_err());
        assert!(!permitted("bogus", "etcd3", Direction::Store));
    }

    #[test]
    fn test_bundle_json_field_names() {
        let bundle = BootstrapBundle {
            server_ca_data: "a".to_string(),
            request_header_ca_key_data: "b".to_string(),
            ..BootstrapBundle::default()
        };
        let value = serde_json::to_value(&bundle).unwrap();
        assert_eq!(
            value,
            serde_json::json!({ "serverCAData": "a", "requestHeaderCAKeyData": "b" })
        );
    }

    #[tokio::test]
    async fn test_fetch_empty_store_is_noop() {
        let dir = tempdir().unwrap();
        let paths = ControlPaths::new(dir.path());
        let replicator = BootstrapReplicator::new(MemoryStore::default());

        assert!(replicator.fetch(&paths).await.unwrap().is_none());
        assert!(!paths.server_ca.cert.exists());
    }

    #[tokio::test]
    async fn test_store_then_fetch_copies_material() {
        let store = MemoryStore::default();
        let first = tempdir().unwrap();
        let first_paths = ControlPaths::new(first.path());
        seed(&first_paths, "one").await;
        assert!(
            BootstrapReplicator::new(store.clone())
                .store(&first_paths)
                .await
                .unwrap()
        );

        let second = tempdir().unwrap();
        let second_paths = ControlPaths::new(second.path());
        seed(&second_paths, "two").await;
        let changed = BootstrapReplicator::new(store.clone())
            .fetch(&second_paths)
            .await
            .unwrap()
            .unwrap();
        assert!(changed.server && changed.client && changed.request_header);

        assert_eq!(
            BootstrapBundle::read_local(&second_paths).await.unwrap(),
            BootstrapBundle::read_local(&first_paths).await.unwrap()
        );
    }

    #[tokio::test]
    async fn test_store_does_not_overwrite_published_bundle() {
        let store = MemoryStore::default();
        let first = tempdir().unwrap();
        let first_paths = ControlPaths::new(first.path());
        seed(&first_paths, "one").await;
        let second = tempdir().unwrap();
        let second_paths = ControlPaths::new(second.path());
        seed(&second_paths, "two").await;

        let replicator = BootstrapReplicator::new(store.clone());
        assert!(replicator.store(&first_paths).await.unwrap());
        assert!(!replicator.store(&second_paths).await.unwrap());

        let stored = store.get(RUNTIME_KEY).await.unwrap().unwrap();
        let bundle: BootstrapBundle =
            serde_json::from_slice(&STANDARD.decode(stored).unwrap()).unwrap();
        assert_eq!(bundle.server_ca_data, "server-ca-one");
    }

    #[tokio::test]
    async fn test_concurrent_store_leaves_one_bundle() {
        let store = MemoryStore::default();
        let a = tempdir().unwrap();
        let a_paths = ControlPaths::new(a.path());
        seed(&a_paths, "a").await;
        let b = tempdir().unwrap();
        let b_paths = ControlPaths::new(b.path());
        seed(&b_paths, "b").await;

        let replicator_a = BootstrapReplicator::new(store.clone());
        let replicator_b = BootstrapReplicator::new(store.clone());
        let (ra, rb) = tokio::join!(replicator_a.store(&a_paths), replicator_b.store(&b_paths));
        let (ra, rb) = (ra.unwrap(), rb.unwrap());
        assert!(ra || rb);

        let stored = store.get(RUNTIME_KEY).await.unwrap().unwrap();
        let bundle: BootstrapBundle =
            serde_json::from_slice(&STANDARD.decode(stored).unwrap()).unwrap();
        let from_a = BootstrapBundle::read_local(&a_paths).await.unwrap();
        let from_b = BootstrapBundle::read_local(&b_paths).await.unwrap();
        assert!(bundle == from_a || bundle == from_b);
    }

    #[tokio::test]
    async fn test_fetch_rejects_malformed_value() {
        let dir = tempdir().unwrap();
        let paths = ControlPaths::new(dir.path());
        let store = MemoryStore::default();
        store
            .put(RUNTIME_KEY, b"not base64!".to_vec())
            .await
            .unwrap();

        let err = BootstrapReplicator::new(store)
            .fetch(&paths)
            .await
            .unwrap_err();
        assert!(matches!(err, BootstrapError::Bundle(_)));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_write_local_reports_only_changed_authorities() {
        let dir = tempdir().unwrap();
        let paths = ControlPaths::new(dir.path());
        seed(&paths, "one").await;

        let unchanged = published("one").write_local(&paths).await.unwrap();
        assert!(!unchanged.any());

        let mut bundle = published("one");
        bundle.client_ca_key_data = "client-ca-key-two".to_string();
        bundle.service_key_data = "service-two".to_string();
        let changed = bundle.write_local(&paths).await.unwrap();
        assert_eq!(
            changed,
            ChangedAuthorities {
                client: true,
                ..ChangedAuthorities::default()
            }
        );
    }
}
