//! The control plane's certificate set: CAs, per-component leaves, the
//! shared kubelet keys, kubeconfigs and the service-account key.

use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;

use tracing::info;

use crate::ca::{self, AltNames, CaRole, LeafSpec, SigningPair};
use crate::error::Result;
use crate::fs_util;
use crate::paths::{CertKeyPaths, ControlPaths};
use crate::replicate::ChangedAuthorities;

/// Names and addresses the API server certificate must cover.
#[derive(Debug, Clone)]
pub struct ApiServerNames {
    pub listen_port: u16,
    pub service_ip: IpAddr,
    pub sans: Vec<String>,
}

/// The three CAs after generation.
#[derive(Debug, Clone)]
pub struct Authorities {
    pub client: SigningPair,
    pub server: SigningPair,
    pub request_header: SigningPair,
    /// The server CA was created, adopted or replaced on this run.
    pub server_regenerated: bool,
}

/// Ensures every CA and leaf exists and is current.
///
/// CAs in `replaced` were swapped on disk before this call; their leaves and
/// keys are re-issued as if the CA had just been generated.
///
/// # Errors
/// Returns an error if any key or certificate cannot be generated, signed
/// or written.
pub async fn generate_all(
    paths: &ControlPaths,
    names: &ApiServerNames,
    replaced: ChangedAuthorities,
) -> Result<Authorities> {
    let api_url = format!("https://127.0.0.1:{}", names.listen_port);
    let client = gen_client_certs(paths, &api_url, replaced.client).await?;
    let (server, server_regenerated) = gen_server_certs(paths, names, replaced.server).await?;
    let request_header = gen_request_header_certs(paths, replaced.request_header).await?;
    Ok(Authorities {
        client,
        server,
        request_header,
        server_regenerated,
    })
}

async fn gen_client_certs(
    paths: &ControlPaths,
    api_url: &str,
    replaced: bool,
) -> Result<SigningPair> {
    let (client_ca, generated) =
        ca::ensure_signing_pair(CaRole::Client, &paths.client_ca, None).await?;
    let regen = generated || replaced;

    let with_kubeconfig = [
        (
            LeafSpec::client("system:admin").with_organization("system:masters"),
            &paths.client_admin,
            &paths.kubeconfig_admin,
        ),
        (
            LeafSpec::client("system:kube-controller-manager"),
            &paths.client_controller,
            &paths.kubeconfig_controller,
        ),
        (
            LeafSpec::client("system:kube-scheduler"),
            &paths.client_scheduler,
            &paths.kubeconfig_scheduler,
        ),
        (
            LeafSpec::client("kube-apiserver"),
            &paths.client_kube_apiserver,
            &paths.kubeconfig_api_server,
        ),
        (
            LeafSpec::client("cloud-controller-manager"),
            &paths.client_cloud_controller,
            &paths.kubeconfig_cloud_controller,
        ),
    ];
    for (spec, out, kubeconfig) in &with_kubeconfig {
        let issued = ca::issue_leaf(regen, spec, &client_ca, out).await?;
        if issued || !fs_util::exists_all(&[kubeconfig.as_path()]).await {
            write_kubeconfig(kubeconfig, api_url, &paths.server_ca.cert, out).await?;
        }
    }

    ca::issue_leaf(
        regen,
        &LeafSpec::client("system:kube-proxy"),
        &client_ca,
        &paths.client_kube_proxy,
    )
    .await?;
    ca::issue_leaf(
        regen,
        &LeafSpec::client("system:k2s-controller"),
        &client_ca,
        &paths.client_k2s_controller,
    )
    .await?;

    ca::load_or_generate_key(&paths.client_kubelet_key, regen).await?;
    Ok(client_ca)
}

async fn gen_server_certs(
    paths: &ControlPaths,
    names: &ApiServerNames,
    replaced: bool,
) -> Result<(SigningPair, bool)> {
    let (server_ca, generated) = ca::ensure_signing_pair(
        CaRole::Server,
        &paths.server_ca,
        Some(&paths.legacy_token_ca),
    )
    .await?;
    let regen = generated || replaced;

    let mut alt_names = AltNames {
        dns_names: vec![
            "kubernetes.default.svc".to_string(),
            "kubernetes.default".to_string(),
            "kubernetes".to_string(),
            "localhost".to_string(),
        ],
        ips: vec![names.service_ip, IpAddr::V4(Ipv4Addr::LOCALHOST)],
    };
    for san in &names.sans {
        match san.parse::<IpAddr>() {
            Ok(ip) if !alt_names.ips.contains(&ip) => alt_names.ips.push(ip),
            Ok(_) => {}
            Err(_) => alt_names.dns_names.push(san.clone()),
        }
    }
    ca::issue_leaf(
        regen,
        &LeafSpec::server("kube-apiserver", alt_names),
        &server_ca,
        &paths.serving_kube_apiserver,
    )
    .await?;

    ca::load_or_generate_key(&paths.serving_kubelet_key, regen).await?;
    Ok((server_ca, regen))
}

async fn gen_request_header_certs(paths: &ControlPaths, replaced: bool) -> Result<SigningPair> {
    let (request_header_ca, generated) =
        ca::ensure_signing_pair(CaRole::RequestHeader, &paths.request_header_ca, None).await?;
    let regen = generated || replaced;
    ca::issue_leaf(
        regen,
        &LeafSpec::client("system:auth-proxy"),
        &request_header_ca,
        &paths.client_auth_proxy,
    )
    .await?;
    Ok(request_header_ca)
}

/// Generates the service-account signing key once.
///
/// # Errors
/// Returns an error if the key cannot be generated or written.
pub async fn ensure_service_key(path: &Path) -> Result<bool> {
    if fs_util::exists_all(&[path]).await {
        return Ok(false);
    }
    ca::load_or_generate_key(path, true).await?;
    info!("Generated service account key {}", path.display());
    Ok(true)
}

async fn write_kubeconfig(
    dest: &Path,
    server_url: &str,
    ca_file: &Path,
    client: &CertKeyPaths,
) -> Result<()> {
    let contents = format!(
        "apiVersion: v1
kind: Config
clusters:
- cluster:
    server: {server_url}
    certificate-authority: {ca}
  name: local
contexts:
- context:
    cluster: local
    namespace: default
    user: user
  name: Default
current-context: Default
preferences: {{}}
users:
- name: user
  user:
    client-certificate: {cert}
    client-key: {key}
",
        ca = ca_file.display(),
        cert = client.cert.display(),
        key = client.key.display(),
    );
    fs_util::write_secret(dest, contents).await?;
    info!("Wrote kubeconfig {}", dest.display());
    Ok(())
}
