//! Control-plane startup: trust material, credentials and join tokens.
//!
//! [`prepare`] runs once, sequentially, before the listener starts.

use std::net::IpAddr;

use anyhow::{Context, Result};
use tracing::info;

use crate::certs::{self, ApiServerNames, Authorities};
use crate::config::ControlSettings;
use crate::kv::{EtcdGatewayClient, KvStore, MemoryStore};
use crate::passwd::Passwd;
use crate::paths::ControlPaths;
use crate::replicate::{self, BootstrapReplicator, ChangedAuthorities, Direction};
use crate::router::{ROLE_AGENT, ROLE_SERVER};
use crate::{fs_util, server, token};

const ROLE_MASTERS: &str = "system:masters";
const SECRET_BYTES: usize = 16;
const IPSEC_PSK_BYTES: usize = 48;

/// Everything later stages need from a prepared control plane.
#[derive(Debug, Clone)]
pub struct ControlRuntime {
    pub paths: ControlPaths,
    pub authorities: Authorities,
    /// `server:<secret>`, used by agents and joining servers.
    pub agent_token: String,
    /// `admin:<secret>`.
    pub client_token: String,
    pub ipsec_psk: String,
}

impl ControlRuntime {
    /// The join token written to `node-token`.
    #[must_use]
    pub fn node_token(&self) -> String {
        let secret = self
            .agent_token
            .split_once(':')
            .map_or(self.agent_token.as_str(), |(_, secret)| secret);
        token::format(secret, Some(self.authorities.server.cert_pem().as_bytes()))
    }
}

/// Prepares the data directory, replicating through the configured
/// key-value service when the bootstrap mode allows it.
///
/// # Errors
/// Returns an error if any fatal step fails: key-value transport, malformed
/// bootstrap data, certificate generation or credential files.
pub async fn prepare(settings: &ControlSettings) -> Result<ControlRuntime> {
    let mode = &settings.bootstrap.mode;
    let backend = &settings.storage.backend;
    let wants_store = replicate::permitted(mode, backend, Direction::Fetch)
        || replicate::permitted(mode, backend, Direction::Store);
    if !wants_store {
        return prepare_with::<MemoryStore>(settings, None).await;
    }

    let client = EtcdGatewayClient::connect(
        &settings.storage.endpoints,
        &settings.storage.tls(),
        settings.dial_timeout()?,
    )
    .await
    .context("failed to connect to key-value store")?;
    prepare_with(settings, Some(&BootstrapReplicator::new(client))).await
}

/// [`prepare`] against an explicit replicator, if any.
///
/// # Errors
/// See [`prepare`].
pub async fn prepare_with<S: KvStore>(
    settings: &ControlSettings,
    replicator: Option<&BootstrapReplicator<S>>,
) -> Result<ControlRuntime> {
    let paths = ControlPaths::new(&settings.data_dir);
    for dir in [&paths.data_dir, &paths.tls_dir, &paths.cred_dir] {
        fs_util::ensure_secrets_dir(dir).await?;
    }

    let mode = &settings.bootstrap.mode;
    let backend = &settings.storage.backend;
    let mut replaced = ChangedAuthorities::default();
    if let Some(replicator) = replicator
        && replicate::permitted(mode, backend, Direction::Fetch)
    {
        replaced = replicator
            .fetch(&paths)
            .await
            .context("failed to fetch bootstrap data")?
            .unwrap_or_default();
    }

    let names = ApiServerNames {
        listen_port: settings.listen_port,
        service_ip: settings.first_service_ip()?,
        sans: settings.sans.clone(),
    };
    let authorities = certs::generate_all(&paths, &names, replaced)
        .await
        .context("failed to generate certificates")?;
    certs::ensure_service_key(&paths.service_key).await?;
    server::ensure_serving_cert(
        authorities.server_regenerated,
        &authorities.server,
        &paths.serving_listener,
        &listener_addresses(settings),
        &settings.sans,
    )
    .await
    .context("failed to issue listener certificate")?;

    gen_users(settings, &paths).await?;
    let ipsec_psk = ensure_ipsec_psk(&paths).await?;

    if let Some(replicator) = replicator
        && replicate::permitted(mode, backend, Direction::Store)
    {
        replicator
            .store(&paths)
            .await
            .context("failed to store bootstrap data")?;
    }

    let (agent_token, client_token) = read_tokens(&paths).await?;
    let runtime = ControlRuntime {
        paths,
        authorities,
        agent_token,
        client_token,
        ipsec_psk,
    };
    fs_util::write_secret(
        &runtime.paths.node_token,
        format!("{}\n", runtime.node_token()),
    )
    .await?;
    info!("Wrote join token to {}", runtime.paths.node_token.display());
    Ok(runtime)
}

fn listener_addresses(settings: &ControlSettings) -> Vec<IpAddr> {
    [&settings.bind_address, &settings.advertise_ip]
        .into_iter()
        .filter_map(|addr| addr.parse().ok())
        .collect()
}

/// Ensures the `admin`, `node` and `server` users exist.
///
/// A table holding only a legacy `node` entry is migrated by giving
/// `server` the node secret. The configured token replaces the server
/// secret; the agent token, or else the server secret, becomes the node
/// secret. Tokens in `K10` form must match the local server CA.
///
/// # Errors
/// Returns an error if a token belongs to another CA, or the credential
/// file is malformed or cannot be written.
pub async fn gen_users(settings: &ControlSettings, paths: &ControlPaths) -> Result<()> {
    let mut passwd = Passwd::read(&paths.passwd_file).await?;

    if passwd.pass("server").is_none()
        && let Some(node) = passwd.pass("node").map(ToString::to_string)
    {
        info!("Migrating node password to server password");
        passwd.ensure_user("server", ROLE_SERVER, &node)?;
    }

    let server_secret = if settings.token.is_empty() {
        match passwd.pass("server") {
            Some(existing) => existing.to_string(),
            None => token::random(SECRET_BYTES)?,
        }
    } else {
        configured_secret(&settings.token, "server", paths).await?
    };
    passwd.ensure_user("server", ROLE_SERVER, &server_secret)?;

    let node_secret = if settings.agent_token.is_empty() {
        passwd
            .pass("server")
            .map(ToString::to_string)
            .context("server password missing after generation")?
    } else {
        configured_secret(&settings.agent_token, "node", paths).await?
    };
    passwd.ensure_user("node", ROLE_AGENT, &node_secret)?;
    passwd.ensure_user("admin", ROLE_MASTERS, "")?;

    passwd
        .write(&paths.passwd_file)
        .await
        .with_context(|| format!("failed to write {}", paths.passwd_file.display()))
}

/// Reduces a configured token to the bare secret for `username`.
async fn configured_secret(value: &str, username: &str, paths: &ControlPaths) -> Result<String> {
    if !value.starts_with(token::TOKEN_PREFIX) {
        return Ok(value.to_string());
    }
    let ca = fs_util::read(&paths.server_ca.cert).await?;
    let secret = token::validate(value, &ca)
        .with_context(|| format!("{username} token does not belong to this cluster"))?;
    let secret = secret
        .strip_prefix(username)
        .and_then(|rest| rest.strip_prefix(':'))
        .unwrap_or(secret.as_str());
    Ok(secret.to_string())
}

/// Recovers `(agent_token, client_token)` from the credential file.
///
/// # Errors
/// Returns an error if the file is unreadable or lacks the needed users.
pub async fn read_tokens(paths: &ControlPaths) -> Result<(String, String)> {
    let passwd = Passwd::read(&paths.passwd_file).await?;
    let agent_token = passwd
        .pass("server")
        .map(|secret| format!("server:{secret}"))
        .or_else(|| passwd.pass("node").map(|secret| format!("node:{secret}")))
        .context("no server or node user in credential file")?;
    let client_token = passwd
        .pass("admin")
        .map(|secret| format!("admin:{secret}"))
        .context("no admin user in credential file")?;
    Ok((agent_token, client_token))
}

async fn ensure_ipsec_psk(paths: &ControlPaths) -> Result<String> {
    if let Some(existing) = fs_util::read_optional(&paths.ipsec_key).await? {
        let existing = String::from_utf8_lossy(&existing).trim().to_string();
        if !existing.is_empty() {
            return Ok(existing);
        }
    }
    let psk = token::random(IPSEC_PSK_BYTES)?;
    fs_util::write_secret(&paths.ipsec_key, format!("{psk}\n")).await?;
    info!("Generated IPsec pre-shared key");
    Ok(psk)
}
