use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

use crate::kv::KvTls;

#[derive(Debug, Deserialize, Clone)]
pub struct ControlSettings {
    pub data_dir: PathBuf,
    pub https_port: u16,
    pub listen_port: u16,
    pub advertise_port: u16,
    pub bind_address: String,
    pub advertise_ip: String,
    pub token: String,
    pub agent_token: String,
    pub cluster_cidr: String,
    pub service_cidr: String,
    pub cluster_dns: String,
    pub cluster_domain: String,
    pub sans: Vec<String>,
    pub storage: StorageSettings,
    pub bootstrap: BootstrapSettings,
    pub api_server: ApiServerSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageSettings {
    pub backend: String,
    pub endpoints: String,
    pub ca_file: String,
    pub cert_file: String,
    pub key_file: String,
    pub dial_timeout: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BootstrapSettings {
    pub mode: String,
    pub http: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ApiServerSettings {
    pub url: String,
    pub poll_interval: String,
}

/// Non-secret view of the settings served to joining agents.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct PublicConfig {
    pub https_port: u16,
    pub advertise_port: u16,
    pub advertise_ip: String,
    pub cluster_cidr: String,
    pub service_cidr: String,
    pub cluster_dns: String,
    pub cluster_domain: String,
    pub http_bootstrap: bool,
}

const DEFAULT_CONFIG_FILE: &str = "k2s.toml";
const ENV_PREFIX: &str = "K2S";
const DEFAULT_DATA_DIR: &str = "/var/lib/k2s/server";
const DEFAULT_HTTPS_PORT: u16 = 6443;
const DEFAULT_LISTEN_PORT: u16 = 6444;
const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0";
const DEFAULT_CLUSTER_CIDR: &str = "10.42.0.0/16";
const DEFAULT_SERVICE_CIDR: &str = "10.43.0.0/16";
const DEFAULT_CLUSTER_DNS: &str = "10.43.0.10";
const DEFAULT_CLUSTER_DOMAIN: &str = "cluster.local";
const DEFAULT_STORAGE_BACKEND: &str = "sqlite3";
const DEFAULT_DIAL_TIMEOUT: &str = "5s";
const DEFAULT_BOOTSTRAP_MODE: &str = "none";
const DEFAULT_API_SERVER_URL: &str = "https://127.0.0.1:6444";
const DEFAULT_POLL_INTERVAL: &str = "2s";

impl ControlSettings {
    /// Creates a new `ControlSettings` instance.
    ///
    /// # Errors
    /// Returns error if configuration parsing fails (e.g. invalid format).
    pub fn new(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let mut s = Config::builder();

        s = s
            .set_default("data_dir", DEFAULT_DATA_DIR)?
            .set_default("https_port", DEFAULT_HTTPS_PORT)?
            .set_default("listen_port", DEFAULT_LISTEN_PORT)?
            .set_default("advertise_port", 0)?
            .set_default("bind_address", DEFAULT_BIND_ADDRESS)?
            .set_default("advertise_ip", "")?
            .set_default("token", "")?
            .set_default("agent_token", "")?
            .set_default("cluster_cidr", DEFAULT_CLUSTER_CIDR)?
            .set_default("service_cidr", DEFAULT_SERVICE_CIDR)?
            .set_default("cluster_dns", DEFAULT_CLUSTER_DNS)?
            .set_default("cluster_domain", DEFAULT_CLUSTER_DOMAIN)?
            .set_default("sans", Vec::<String>::new())?
            .set_default("storage.backend", DEFAULT_STORAGE_BACKEND)?
            .set_default("storage.endpoints", "")?
            .set_default("storage.ca_file", "")?
            .set_default("storage.cert_file", "")?
            .set_default("storage.key_file", "")?
            .set_default("storage.dial_timeout", DEFAULT_DIAL_TIMEOUT)?
            .set_default("bootstrap.mode", DEFAULT_BOOTSTRAP_MODE)?
            .set_default("bootstrap.http", false)?
            .set_default("api_server.url", DEFAULT_API_SERVER_URL)?
            .set_default("api_server.poll_interval", DEFAULT_POLL_INTERVAL)?;

        let path = config_path.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
        s = s.add_source(File::from(path).required(false));

        // e.g. K2S_TOKEN, K2S_STORAGE__BACKEND
        s = s.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .ignore_empty(true),
        );

        s.build()?.try_deserialize()
    }

    /// Merges CLI arguments into the settings, overriding values if present.
    pub fn merge_with_args(&mut self, args: &crate::ServerArgs) {
        if let Some(data_dir) = &args.data_dir {
            data_dir.clone_into(&mut self.data_dir);
        }
        if let Some(token) = &args.token {
            token.clone_into(&mut self.token);
        }
        if let Some(agent_token) = &args.agent_token {
            agent_token.clone_into(&mut self.agent_token);
        }
        if let Some(mode) = &args.bootstrap_mode {
            mode.clone_into(&mut self.bootstrap.mode);
        }
        if let Some(port) = args.https_port {
            self.https_port = port;
        }
    }

    /// Validates configuration values for correctness.
    ///
    /// The bootstrap mode is checked where it is used, so that a bad value
    /// only disables replication.
    ///
    /// # Errors
    /// Returns error if any setting is invalid or out of range.
    pub fn validate(&self) -> Result<()> {
        if self.data_dir.as_os_str().is_empty() {
            anyhow::bail!("data_dir must not be empty");
        }
        if self.https_port == 0 {
            anyhow::bail!("https_port must be greater than 0");
        }
        if self.listen_port == 0 {
            anyhow::bail!("listen_port must be greater than 0");
        }
        self.bind_address
            .parse::<IpAddr>()
            .map_err(|e| anyhow::anyhow!("bind_address invalid: {e}"))?;
        self.dial_timeout()?;
        self.poll_interval()?;
        self.first_service_ip()?;
        Ok(())
    }

    /// # Errors
    /// Returns error if `storage.dial_timeout` is not a duration.
    pub fn dial_timeout(&self) -> Result<Duration> {
        parse_duration("storage.dial_timeout", &self.storage.dial_timeout)
    }

    /// # Errors
    /// Returns error if `api_server.poll_interval` is not a positive duration.
    pub fn poll_interval(&self) -> Result<Duration> {
        parse_duration("api_server.poll_interval", &self.api_server.poll_interval)
    }

    /// First usable address of the service CIDR, used as the in-cluster API
    /// server address.
    ///
    /// # Errors
    /// Returns error if `service_cidr` is not a CIDR.
    pub fn first_service_ip(&self) -> Result<IpAddr> {
        first_ip(&self.service_cidr)
            .with_context(|| format!("service_cidr invalid: {}", self.service_cidr))
    }

    #[must_use]
    pub fn advertise_port(&self) -> u16 {
        if self.advertise_port == 0 {
            self.https_port
        } else {
            self.advertise_port
        }
    }

    #[must_use]
    pub fn public_config(&self) -> PublicConfig {
        PublicConfig {
            https_port: self.https_port,
            advertise_port: self.advertise_port(),
            advertise_ip: self.advertise_ip.clone(),
            cluster_cidr: self.cluster_cidr.clone(),
            service_cidr: self.service_cidr.clone(),
            cluster_dns: self.cluster_dns.clone(),
            cluster_domain: self.cluster_domain.clone(),
            http_bootstrap: self.bootstrap.http,
        }
    }
}

impl StorageSettings {
    /// Client TLS material for the key-value service; empty paths are unset.
    #[must_use]
    pub fn tls(&self) -> KvTls<'_> {
        KvTls {
            ca_file: non_empty(&self.ca_file),
            cert_file: non_empty(&self.cert_file),
            key_file: non_empty(&self.key_file),
        }
    }
}

fn non_empty(value: &str) -> Option<&Path> {
    if value.is_empty() {
        None
    } else {
        Some(Path::new(value))
    }
}

fn parse_duration(name: &str, value: &str) -> Result<Duration> {
    let duration = humantime::parse_duration(value)
        .map_err(|e| anyhow::anyhow!("{name} invalid: {e}"))?;
    if duration.is_zero() {
        anyhow::bail!("{name} must be greater than 0");
    }
    Ok(duration)
}

fn first_ip(cidr: &str) -> Result<IpAddr> {
    let (addr, prefix) = cidr
        .split_once('/')
        .ok_or_else(|| anyhow::anyhow!("missing prefix length"))?;
    let prefix: u32 = prefix.parse().context("prefix length")?;
    match addr.parse::<IpAddr>().context("network address")? {
        IpAddr::V4(v4) => {
            if prefix > 30 {
                anyhow::bail!("prefix /{prefix} leaves no usable addresses");
            }
            let mask = u32::MAX.checked_shl(32 - prefix).unwrap_or(0);
            Ok(IpAddr::V4(Ipv4Addr::from((u32::from(v4) & mask) + 1)))
        }
        IpAddr::V6(v6) => {
            if prefix > 126 {
                anyhow::bail!("prefix /{prefix} leaves no usable addresses");
            }
            let mask = u128::MAX.checked_shl(128 - prefix).unwrap_or(0);
            Ok(IpAddr::V6(Ipv6Addr::from((u128::from(v6) & mask) + 1)))
        }
    }
}
