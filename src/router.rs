//! Role-scoped bootstrap endpoints.
//!
//! Requests are matched against four tiers in order: public, server, node
//! and agent. A tier only checks the caller's role when one of its paths
//! matches; unmatched requests fall through to the next tier and finally to
//! the API fallback, which does its own authentication.
//!
//! Authenticated tiers answer 404 when the request did not arrive over TLS or
//! carries no identity, and 401 when the identity lacks the tier's role.

use std::sync::Arc;

use poem::endpoint::{BoxEndpoint, StaticFilesEndpoint};
use poem::http::{StatusCode, header};
use poem::web::{Data, Json};
use poem::{Endpoint, EndpointExt, IntoResponse, Request, Response, Route, handler};
use serde::Serialize;
use tracing::{error, warn};

use crate::ca::{self, AltNames, LeafSpec, SigningPair};
use crate::config::PublicConfig;
use crate::error::BootstrapError;
use crate::fs_util;
use crate::identity::{self, ClientIdentity, TlsConnection};
use crate::passwd::{NodePasswords, Passwd};
use crate::paths::{CertKeyPaths, ControlPaths};
use crate::replicate::BootstrapBundle;

pub const ROLE_AGENT: &str = "k2s:agent";
pub const ROLE_SERVER: &str = "k2s:server";
pub const ROLE_NODES: &str = "system:nodes";

pub const HEADER_NODE_NAME: &str = "K2s-Node-Name";
pub const HEADER_NODE_PASSWORD: &str = "K2s-Node-Password";

const STATIC_PREFIX: &str = "/static/";
const TEXT_PLAIN: &str = "text/plain";

/// Datastore summary served on `/db/info`.
#[derive(Debug, Clone, Serialize)]
pub struct DbInfo {
    pub backend: String,
    pub endpoints: Vec<String>,
}

/// Shared state of the bootstrap handlers.
pub struct RouterState {
    pub paths: ControlPaths,
    /// Server CA bundle served on `/cacerts`.
    pub ca_certs: String,
    /// Users allowed to authenticate with HTTP Basic credentials.
    pub users: Passwd,
    pub node_passwords: NodePasswords,
    pub public_config: PublicConfig,
    pub db_info: DbInfo,
}

#[derive(Debug, Clone, Copy)]
enum PathMatch {
    Exact(&'static str),
    Prefix(&'static str),
}

impl PathMatch {
    fn matches(self, path: &str) -> bool {
        match self {
            Self::Exact(p) => path == p,
            Self::Prefix(p) => path.starts_with(p),
        }
    }
}

struct Tier {
    role: Option<&'static str>,
    routes: Vec<(PathMatch, BoxEndpoint<'static>)>,
}

impl Tier {
    fn new(role: Option<&'static str>) -> Self {
        Self {
            role,
            routes: Vec::new(),
        }
    }

    fn at<E>(mut self, path: PathMatch, ep: E) -> Self
    where
        E: Endpoint + 'static,
    {
        self.routes.push((path, ep.map_to_response().boxed()));
        self
    }

    fn find(&self, path: &str) -> Option<&BoxEndpoint<'static>> {
        self.routes
            .iter()
            .find(|(m, _)| m.matches(path))
            .map(|(_, ep)| ep)
    }
}

/// Ordered list of tiers evaluated by a single dispatcher.
pub struct AuthenticatedRouter {
    state: Arc<RouterState>,
    tiers: Vec<Tier>,
    fallback: BoxEndpoint<'static>,
}

impl AuthenticatedRouter {
    /// Builds the router. `tunnel` serves the node tunnel endpoint and
    /// `fallback` receives every request no tier matched.
    pub fn new<T, F>(
        state: Arc<RouterState>,
        http_bootstrap: bool,
        tunnel: T,
        fallback: F,
    ) -> Self
    where
        T: Endpoint + 'static,
        F: Endpoint + 'static,
    {
        let static_files = Route::new().nest(
            STATIC_PREFIX.trim_end_matches('/'),
            StaticFilesEndpoint::new(&state.paths.static_dir),
        );
        let public = Tier::new(None)
            .at(PathMatch::Exact("/cacerts"), poem::get(cacerts))
            .at(PathMatch::Exact("/ping"), poem::get(ping))
            .at(PathMatch::Prefix(STATIC_PREFIX), static_files);

        let mut server =
            Tier::new(Some(ROLE_SERVER)).at(PathMatch::Exact("/db/info"), poem::get(db_info));
        if http_bootstrap {
            server = server.at(
                PathMatch::Exact("/v1-k2s/server-bootstrap"),
                poem::get(server_bootstrap),
            );
        }

        let node = Tier::new(Some(ROLE_NODES)).at(PathMatch::Exact("/v1-k2s/connect"), tunnel);

        let agent = Tier::new(Some(ROLE_AGENT))
            .at(
                PathMatch::Exact("/v1-k2s/serving-kubelet.crt"),
                poem::get(serving_kubelet_cert),
            )
            .at(
                PathMatch::Exact("/v1-k2s/client-kubelet.crt"),
                poem::get(client_kubelet_cert),
            )
            .at(
                PathMatch::Exact("/v1-k2s/client-kube-proxy.crt"),
                poem::get(client_kube_proxy_cert),
            )
            .at(
                PathMatch::Exact("/v1-k2s/client-k2s-controller.crt"),
                poem::get(client_k2s_controller_cert),
            )
            .at(PathMatch::Exact("/v1-k2s/client-ca.crt"), poem::get(client_ca_cert))
            .at(PathMatch::Exact("/v1-k2s/server-ca.crt"), poem::get(server_ca_cert))
            .at(PathMatch::Exact("/v1-k2s/config"), poem::get(control_config));

        Self {
            state,
            tiers: vec![public, server, node, agent],
            fallback: fallback.map_to_response().boxed(),
        }
    }

    fn identify(&self, req: &Request) -> Option<ClientIdentity> {
        let tls = req.data::<TlsConnection>()?;
        if let Some(peer) = &tls.peer {
            return Some(peer.clone());
        }
        let authorization = req.headers().get(header::AUTHORIZATION)?.to_str().ok()?;
        identity::from_basic_auth(authorization, &self.state.users)
    }
}

impl Endpoint for AuthenticatedRouter {
    type Output = Response;

    async fn call(&self, mut req: Request) -> poem::Result<Self::Output> {
        req.set_data(Arc::clone(&self.state));
        let path = req.uri().path().to_string();

        for tier in &self.tiers {
            let Some(ep) = tier.find(&path) else {
                continue;
            };
            if let Some(role) = tier.role {
                match self.identify(&req) {
                    None => return Ok(StatusCode::NOT_FOUND.into_response()),
                    Some(id) if !id.has_role(role) => {
                        return Ok(StatusCode::UNAUTHORIZED.into_response());
                    }
                    Some(_) => {}
                }
            }
            return ep.call(req).await;
        }

        self.fallback.call(req).await
    }
}

fn send_error(err: &BootstrapError) -> Response {
    let status = match err {
        BootstrapError::Auth(_) => StatusCode::FORBIDDEN,
        BootstrapError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        error!("{err}");
    } else {
        warn!("{err}");
    }
    (status, err.to_string()).into_response()
}

fn node_info(req: &Request) -> Result<(String, String), String> {
    let single = |name: &str| -> Option<String> {
        let mut values = req.headers().get_all(name).iter();
        let value = values.next()?.to_str().ok()?;
        if values.next().is_some() || value.is_empty() {
            return None;
        }
        Some(value.to_string())
    };
    let name = single(HEADER_NODE_NAME).ok_or_else(|| "node name not set".to_string())?;
    let password =
        single(HEADER_NODE_PASSWORD).ok_or_else(|| "node password not set".to_string())?;
    Ok((name.to_lowercase(), password))
}

#[derive(Clone, Copy)]
enum KubeletCert {
    Serving,
    Client,
}

async fn kubelet_cert(req: &Request, state: &RouterState, kind: KubeletCert) -> Response {
    let (node_name, password) = match node_info(req) {
        Ok(info) => info,
        Err(msg) => {
            warn!("{msg}");
            return (StatusCode::BAD_REQUEST, msg).into_response();
        }
    };
    if let Err(err) = state.node_passwords.ensure(&node_name, &password).await {
        return send_error(&err);
    }

    let (ca_paths, key_path, spec) = match kind {
        KubeletCert::Serving => (
            &state.paths.server_ca,
            &state.paths.serving_kubelet_key,
            LeafSpec::server(
                node_name.clone(),
                AltNames {
                    dns_names: vec![node_name, "localhost".to_string()],
                    ips: vec![std::net::Ipv4Addr::LOCALHOST.into()],
                },
            ),
        ),
        KubeletCert::Client => (
            &state.paths.client_ca,
            &state.paths.client_kubelet_key,
            LeafSpec::client(format!("system:node:{node_name}")).with_organization(ROLE_NODES),
        ),
    };

    let issued = async {
        let ca = SigningPair::load(ca_paths).await?;
        let (key, key_pem) = ca::load_key(key_path).await?;
        let mut body = ca.sign(&spec, &key)?;
        body.push_str(&key_pem);
        Ok::<_, BootstrapError>(body)
    };
    match issued.await {
        Ok(body) => body.into_response(),
        Err(err) => send_error(&err),
    }
}

async fn files(paths: &[&std::path::Path]) -> Response {
    let mut body = Vec::new();
    for path in paths {
        match fs_util::read(path).await {
            Ok(bytes) => body.extend(bytes),
            Err(err) => return send_error(&err),
        }
    }
    body.with_content_type(TEXT_PLAIN).into_response()
}

async fn pair(paths: &CertKeyPaths) -> Response {
    files(&[&paths.cert, &paths.key]).await
}

#[handler]
fn cacerts(Data(state): Data<&Arc<RouterState>>) -> impl IntoResponse {
    state.ca_certs.clone().with_content_type(TEXT_PLAIN)
}

#[handler]
fn ping() -> impl IntoResponse {
    "pong".with_content_type(TEXT_PLAIN)
}

#[handler]
fn db_info(Data(state): Data<&Arc<RouterState>>) -> Json<DbInfo> {
    Json(state.db_info.clone())
}

#[handler]
async fn server_bootstrap(Data(state): Data<&Arc<RouterState>>) -> Response {
    match BootstrapBundle::read_local(&state.paths).await {
        Ok(bundle) => Json(bundle).into_response(),
        Err(err) => send_error(&err),
    }
}

#[handler]
async fn serving_kubelet_cert(req: &Request, Data(state): Data<&Arc<RouterState>>) -> Response {
    kubelet_cert(req, state, KubeletCert::Serving).await
}

#[handler]
async fn client_kubelet_cert(req: &Request, Data(state): Data<&Arc<RouterState>>) -> Response {
    kubelet_cert(req, state, KubeletCert::Client).await
}

#[handler]
async fn client_kube_proxy_cert(Data(state): Data<&Arc<RouterState>>) -> Response {
    pair(&state.paths.client_kube_proxy).await
}

#[handler]
async fn client_k2s_controller_cert(Data(state): Data<&Arc<RouterState>>) -> Response {
    pair(&state.paths.client_k2s_controller).await
}

#[handler]
async fn client_ca_cert(Data(state): Data<&Arc<RouterState>>) -> Response {
    files(&[&state.paths.client_ca.cert]).await
}

#[handler]
async fn server_ca_cert(Data(state): Data<&Arc<RouterState>>) -> Response {
    files(&[&state.paths.server_ca.cert]).await
}

#[handler]
fn control_config(Data(state): Data<&Arc<RouterState>>) -> Json<PublicConfig> {
    Json(state.public_config.clone())
}

/// Placeholder for the node tunnel when no tunnel server is wired in.
#[handler]
pub fn tunnel_unavailable() -> (StatusCode, String) {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        "tunnel server not running".to_string(),
    )
}

#[cfg(test)]
mod tests {
    use poem::test::TestClient;
    use tempfile::{TempDir, tempdir};

    use super::*;
    use crate::ca::{CaRole, ensure_signing_pair, load_or_generate_key};

    #[handler]
    fn api_fallback() -> (StatusCode, String) {
        (StatusCode::OK, "api".to_string())
    }

    async fn test_router(http_bootstrap: bool) -> (TempDir, AuthenticatedRouter) {
        let dir = tempdir().unwrap();
        let paths = ControlPaths::new(dir.path());
        let (server_ca, _) = ensure_signing_pair(CaRole::Server, &paths.server_ca, None)
            .await
            .unwrap();
        ensure_signing_pair(CaRole::Client, &paths.client_ca, None)
            .await
            .unwrap();
        load_or_generate_key(&paths.serving_kubelet_key, false)
            .await
            .unwrap();
        load_or_generate_key(&paths.client_kubelet_key, false)
            .await
            .unwrap();
        fs_util::write_secret(&paths.client_kube_proxy.cert, "proxy-cert\n")
            .await
            .unwrap();
        fs_util::write_secret(&paths.client_kube_proxy.key, "proxy-key\n")
            .await
            .unwrap();

        let mut users = Passwd::default();
        users.ensure_user("node", ROLE_AGENT, "agent-pw").unwrap();
        users.ensure_user("server", ROLE_SERVER, "server-pw").unwrap();

        let state = Arc::new(RouterState {
            node_passwords: NodePasswords::new(paths.node_passwd_file.clone()),
            ca_certs: server_ca.cert_pem().to_string(),
            users,
            public_config: crate::config::ControlSettings::new(None)
                .unwrap()
                .public_config(),
            db_info: DbInfo {
                backend: "etcd3".to_string(),
                endpoints: vec!["https://10.0.0.1:2379".to_string()],
            },
            paths,
        });
        let router =
            AuthenticatedRouter::new(state, http_bootstrap, tunnel_unavailable, api_fallback);
        (dir, router)
    }

    fn agent() -> TlsConnection {
        TlsConnection {
            peer: Some(ClientIdentity {
                name: "node".to_string(),
                roles: vec![ROLE_AGENT.to_string()],
            }),
        }
    }

    #[tokio::test]
    async fn test_public_routes_need_no_identity() {
        let (_dir, router) = test_router(false).await;
        let cli = TestClient::new(router);

        let resp = cli.get("/ping").send().await;
        resp.assert_status_is_ok();
        resp.assert_text("pong").await;

        let resp = cli.get("/cacerts").send().await;
        resp.assert_status_is_ok();
        resp.assert_content_type(TEXT_PLAIN);
    }

    #[tokio::test]
    async fn test_authenticated_route_without_tls_is_not_found() {
        let (_dir, router) = test_router(false).await;
        let cli = TestClient::new(router);

        cli.get("/v1-k2s/config")
            .send()
            .await
            .assert_status(StatusCode::NOT_FOUND);
        cli.get("/v1-k2s/config")
            .data(TlsConnection::default())
            .send()
            .await
            .assert_status(StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_wrong_role_is_unauthorized() {
        let (_dir, router) = test_router(false).await;
        let cli = TestClient::new(router);

        cli.get("/db/info")
            .data(agent())
            .send()
            .await
            .assert_status(StatusCode::UNAUTHORIZED);
        cli.get("/v1-k2s/connect")
            .data(agent())
            .send()
            .await
            .assert_status(StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_agent_config_and_files() {
        let (_dir, router) = test_router(false).await;
        let cli = TestClient::new(router);

        let resp = cli.get("/v1-k2s/config").data(agent()).send().await;
        resp.assert_status_is_ok();
        let json = resp.json().await;
        json.value().object().get("cluster_domain").assert_string("cluster.local");

        let resp = cli
            .get("/v1-k2s/client-kube-proxy.crt")
            .data(agent())
            .send()
            .await;
        resp.assert_status_is_ok();
        resp.assert_text("proxy-cert\nproxy-key\n").await;
    }

    #[tokio::test]
    async fn test_basic_auth_over_tls() {
        let (_dir, router) = test_router(false).await;
        let cli = TestClient::new(router);
        let basic = |user: &str, pw: &str| {
            use base64::Engine;
            format!(
                "Basic {}",
                base64::engine::general_purpose::STANDARD.encode(format!("{user}:{pw}"))
            )
        };

        cli.get("/db/info")
            .data(TlsConnection::default())
            .header(header::AUTHORIZATION, basic("server", "server-pw"))
            .send()
            .await
            .assert_status_is_ok();
        cli.get("/db/info")
            .data(TlsConnection::default())
            .header(header::AUTHORIZATION, basic("server", "nope"))
            .send()
            .await
            .assert_status(StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_server_bootstrap_only_when_enabled() {
        let server = || TlsConnection {
            peer: Some(ClientIdentity {
                name: "server".to_string(),
                roles: vec![ROLE_SERVER.to_string()],
            }),
        };

        let (_dir, router) = test_router(false).await;
        let resp = TestClient::new(router)
            .get("/v1-k2s/server-bootstrap")
            .data(server())
            .send()
            .await;
        resp.assert_status_is_ok();
        resp.assert_text("api").await;

        let (dir, router) = test_router(true).await;
        let paths = ControlPaths::new(dir.path());
        ensure_signing_pair(CaRole::RequestHeader, &paths.request_header_ca, None)
            .await
            .unwrap();
        load_or_generate_key(&paths.service_key, false).await.unwrap();
        fs_util::write_secret(&paths.passwd_file, "pw,server,k2s:server\n")
            .await
            .unwrap();

        let resp = TestClient::new(router)
            .get("/v1-k2s/server-bootstrap")
            .data(server())
            .send()
            .await;
        resp.assert_status_is_ok();
        let json = resp.json().await;
        json.value()
            .object()
            .get("passwdFileData")
            .assert_string("pw,server,k2s:server\n");
    }

    #[tokio::test]
    async fn test_unmatched_falls_through_to_api() {
        let (_dir, router) = test_router(false).await;
        let cli = TestClient::new(router);
        let resp = cli.get("/api/v1/namespaces").send().await;
        resp.assert_status_is_ok();
        resp.assert_text("api").await;
    }

    #[tokio::test]
    async fn test_client_kubelet_cert_first_contact_and_mismatch() {
        let (_dir, router) = test_router(false).await;
        let cli = TestClient::new(router);

        let resp = cli
            .get("/v1-k2s/client-kubelet.crt")
            .data(agent())
            .header(HEADER_NODE_NAME, "Worker-1")
            .header(HEADER_NODE_PASSWORD, "pw1")
            .send()
            .await;
        resp.assert_status_is_ok();
        let body = resp.0.into_body().into_string().await.unwrap();
        assert_eq!(body.matches("BEGIN CERTIFICATE").count(), 2);
        assert!(body.contains("PRIVATE KEY"));

        let (_, pem) = x509_parser::pem::parse_x509_pem(body.as_bytes()).unwrap();
        let (_, cert) = x509_parser::parse_x509_certificate(&pem.contents).unwrap();
        assert!(
            cert.subject()
                .to_string()
                .contains("CN=system:node:worker-1")
        );

        cli.get("/v1-k2s/client-kubelet.crt")
            .data(agent())
            .header(HEADER_NODE_NAME, "worker-1")
            .header(HEADER_NODE_PASSWORD, "other")
            .send()
            .await
            .assert_status(StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_serving_kubelet_cert_requires_node_headers() {
        let (_dir, router) = test_router(false).await;
        let cli = TestClient::new(router);

        cli.get("/v1-k2s/serving-kubelet.crt")
            .data(agent())
            .send()
            .await
            .assert_status(StatusCode::BAD_REQUEST);

        let resp = cli
            .get("/v1-k2s/serving-kubelet.crt")
            .data(agent())
            .header(HEADER_NODE_NAME, "worker-2")
            .header(HEADER_NODE_PASSWORD, "pw2")
            .send()
            .await;
        resp.assert_status_is_ok();
    }

    #[tokio::test]
    async fn test_node_password_with_separator_is_rejected() {
        let (_dir, router) = test_router(false).await;
        let cli = TestClient::new(router);

        cli.get("/v1-k2s/client-kubelet.crt")
            .data(agent())
            .header(HEADER_NODE_NAME, "worker-3")
            .header(HEADER_NODE_PASSWORD, "pw,worker-4")
            .send()
            .await
            .assert_status(StatusCode::BAD_REQUEST);

        let resp = cli
            .get("/v1-k2s/client-kubelet.crt")
            .data(agent())
            .header(HEADER_NODE_NAME, "worker-3")
            .header(HEADER_NODE_PASSWORD, "pw3")
            .send()
            .await;
        resp.assert_status_is_ok();
    }
}
