//! Forwarding to the Kubernetes API server and waiting for it to come up.

use std::path::Path;
use std::time::Duration;

use poem::http::{HeaderMap, header};
use poem::{Endpoint, Request, Response};
use reqwest::{Certificate, Client};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{BootstrapError, Result};
use crate::fs_util;

const HOP_BY_HOP: [header::HeaderName; 6] = [
    header::CONNECTION,
    header::HOST,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// Builds a client that trusts the server CA.
///
/// # Errors
/// Returns an error if the CA file cannot be read or parsed.
pub async fn api_client(server_ca: &Path) -> Result<Client> {
    let pem = fs_util::read(server_ca).await?;
    let cert = Certificate::from_pem(&pem)
        .map_err(|e| BootstrapError::crypto("Failed to parse server CA", e))?;
    Client::builder()
        .add_root_certificate(cert)
        .build()
        .map_err(|e| BootstrapError::Transport(format!("failed to build API client: {e}")))
}

/// Relays requests no bootstrap route matched to the API server.
///
/// Bodies are buffered; connection upgrades are not bridged.
#[derive(Debug, Clone)]
pub struct ApiProxy {
    base_url: String,
    client: Client,
}

impl ApiProxy {
    #[must_use]
    pub fn new(base_url: &str, client: Client) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        }
    }
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in &HOP_BY_HOP {
        headers.remove(name);
    }
}

impl Endpoint for ApiProxy {
    type Output = Response;

    async fn call(&self, req: Request) -> poem::Result<Self::Output> {
        let target = req
            .uri()
            .path_and_query()
            .map_or("/", |p| p.as_str())
            .to_string();
        let url = format!("{}{target}", self.base_url);
        let method = req.method().clone();
        let mut headers = req.headers().clone();
        strip_hop_by_hop(&mut headers);
        let body = req.into_body().into_bytes().await?;

        debug!("Proxying {method} {target}");
        let upstream = match self
            .client
            .request(method, &url)
            .headers(headers)
            .body(body)
            .send()
            .await
        {
            Ok(upstream) => upstream,
            Err(err) => {
                warn!("API server request {url} failed: {err}");
                return Ok(Response::builder()
                    .status(poem::http::StatusCode::BAD_GATEWAY)
                    .body(err.to_string()));
            }
        };

        let status = upstream.status();
        let mut headers = upstream.headers().clone();
        strip_hop_by_hop(&mut headers);
        let bytes = match upstream.bytes().await {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!("API server response {url} failed: {err}");
                return Ok(Response::builder()
                    .status(poem::http::StatusCode::BAD_GATEWAY)
                    .body(err.to_string()));
            }
        };

        let mut resp = Response::builder().status(status).body(bytes);
        resp.headers_mut().extend(headers);
        Ok(resp)
    }
}

/// Polls `<url>/version` every `interval` until it answers with success.
///
/// Returns false if `shutdown` fires first.
pub async fn wait_for_api_server(
    client: &Client,
    url: &str,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> bool {
    let version_url = format!("{}/version", url.trim_end_matches('/'));
    loop {
        if *shutdown.borrow() {
            return false;
        }
        match client.get(&version_url).send().await {
            Ok(resp) if resp.status().is_success() => {
                info!("API server is ready at {url}");
                return true;
            }
            Ok(resp) => info!("Waiting for API server to become available: {}", resp.status()),
            Err(err) => info!("Waiting for API server to become available: {err}"),
        }

        tokio::select! {
            () = tokio::time::sleep(interval) => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return false;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use poem::http::StatusCode;
    use poem::test::TestClient;
    use wiremock::matchers::{header as header_is, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    #[tokio::test]
    async fn test_proxy_forwards_request_and_response() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/pods"))
            .and(query_param("limit", "1"))
            .and(header_is("x-request-id", "abc"))
            .respond_with(
                ResponseTemplate::new(201)
                    .insert_header("x-upstream", "yes")
                    .set_body_string("pods"),
            )
            .mount(&server)
            .await;

        let cli = TestClient::new(ApiProxy::new(&server.uri(), Client::new()));
        let resp = cli
            .get("/api/v1/pods?limit=1")
            .header("x-request-id", "abc")
            .send()
            .await;
        resp.assert_status(StatusCode::CREATED);
        resp.assert_header("x-upstream", "yes");
        resp.assert_text("pods").await;
    }

    #[tokio::test]
    async fn test_proxy_reports_unreachable_upstream() {
        let cli = TestClient::new(ApiProxy::new("http://127.0.0.1:1", Client::new()));
        cli.get("/version")
            .send()
            .await
            .assert_status(StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_wait_for_api_server_retries_until_ready() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/version"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/version"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{}"))
            .mount(&server)
            .await;

        let (_tx, rx) = watch::channel(false);
        let ready = wait_for_api_server(
            &Client::new(),
            &server.uri(),
            Duration::from_millis(10),
            rx,
        )
        .await;
        assert!(ready);
    }

    #[tokio::test]
    async fn test_wait_for_api_server_stops_on_shutdown() {
        let (tx, rx) = watch::channel(false);
        let waiter = tokio::spawn(async move {
            wait_for_api_server(
                &Client::new(),
                "http://127.0.0.1:1",
                Duration::from_secs(60),
                rx,
            )
            .await
        });
        tx.send(true).unwrap();
        assert!(!waiter.await.unwrap());
    }
}
