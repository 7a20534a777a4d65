//! HTTPS listener for the bootstrap router.
//!
//! poem's own listeners do not expose the peer certificate, so connections
//! are accepted here with tokio-rustls, served with hyper, and each request
//! is handed to the poem endpoint with a [`TlsConnection`] attached.

use std::convert::Infallible;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::Body;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use poem::Endpoint;
use poem::http::StatusCode;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use crate::ca::{self, AltNames, LeafSpec, SigningPair};
use crate::error::{BootstrapError, Result};
use crate::fs_util;
use crate::identity::{self, TlsConnection};
use crate::paths::{CertKeyPaths, ControlPaths};

const LISTENER_COMMON_NAME: &str = "k2s";
/// Request bodies are buffered before routing; anything larger is refused.
pub const MAX_REQUEST_BODY: usize = 3 * 1024 * 1024;

/// Issues the listener certificate from the server CA.
///
/// Names in `sans` that parse as IP addresses become IP SANs; the rest are
/// DNS names.
///
/// # Errors
/// Returns an error if signing or writing the certificate fails.
pub async fn ensure_serving_cert(
    regen: bool,
    server_ca: &SigningPair,
    out: &CertKeyPaths,
    addresses: &[IpAddr],
    sans: &[String],
) -> Result<bool> {
    let mut alt_names = AltNames {
        dns_names: vec!["localhost".to_string()],
        ips: vec![IpAddr::V4(Ipv4Addr::LOCALHOST)],
    };
    for ip in addresses {
        if !ip.is_unspecified() && !alt_names.ips.contains(ip) {
            alt_names.ips.push(*ip);
        }
    }
    for san in sans {
        match san.parse::<IpAddr>() {
            Ok(ip) if !alt_names.ips.contains(&ip) => alt_names.ips.push(ip),
            Ok(_) => {}
            Err(_) => alt_names.dns_names.push(san.clone()),
        }
    }
    ca::issue_leaf(
        regen,
        &LeafSpec::server(LISTENER_COMMON_NAME, alt_names),
        server_ca,
        out,
    )
    .await
}

/// Builds the rustls configuration: the listener certificate, and optional
/// client certificates verified against the client CA.
///
/// # Errors
/// Returns an error if the certificate, key or client CA cannot be loaded.
pub async fn tls_config(paths: &ControlPaths) -> Result<Arc<ServerConfig>> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());

    let cert_pem = fs_util::read(&paths.serving_listener.cert).await?;
    let certs = CertificateDer::pem_slice_iter(&cert_pem)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| BootstrapError::crypto("Failed to parse listener certificate", e))?;
    let key_pem = fs_util::read(&paths.serving_listener.key).await?;
    let key = PrivateKeyDer::from_pem_slice(&key_pem)
        .map_err(|e| BootstrapError::crypto("Failed to parse listener key", e))?;

    let client_ca_pem = fs_util::read(&paths.client_ca.cert).await?;
    let mut roots = RootCertStore::empty();
    for cert in CertificateDer::pem_slice_iter(&client_ca_pem) {
        let cert = cert.map_err(|e| BootstrapError::crypto("Failed to parse client CA", e))?;
        roots
            .add(cert)
            .map_err(|e| BootstrapError::crypto("Failed to trust client CA", e))?;
    }
    let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider.clone())
        .allow_unauthenticated()
        .build()
        .map_err(|e| BootstrapError::crypto("Failed to build client verifier", e))?;

    let mut config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| BootstrapError::crypto("Failed to select TLS versions", e))?
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)
        .map_err(|e| BootstrapError::crypto("Failed to load listener certificate", e))?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}

/// Accepts TLS connections until `shutdown` turns true.
///
/// # Errors
/// Returns an error if the listener cannot report its address.
pub async fn serve<E>(
    listener: TcpListener,
    config: Arc<ServerConfig>,
    endpoint: Arc<E>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()>
where
    E: Endpoint + 'static,
{
    let local = listener
        .local_addr()
        .map_err(|e| BootstrapError::Transport(format!("listener address: {e}")))?;
    let acceptor = TlsAcceptor::from(config);
    info!("Listening on https://{local}");

    loop {
        let (stream, remote) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(err) => {
                    warn!("Failed to accept connection: {err}");
                    continue;
                }
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("Stopping listener on {local}");
                    return Ok(());
                }
                continue;
            }
        };

        let acceptor = acceptor.clone();
        let endpoint = Arc::clone(&endpoint);
        tokio::spawn(async move {
            let tls = match acceptor.accept(stream).await {
                Ok(tls) => tls,
                Err(err) => {
                    debug!("TLS handshake with {remote} failed: {err}");
                    return;
                }
            };
            let peer = tls
                .get_ref()
                .1
                .peer_certificates()
                .and_then(|certs| certs.first())
                .and_then(|der| match identity::from_certificate(der) {
                    Ok(identity) => Some(identity),
                    Err(err) => {
                        warn!("Ignoring client certificate from {remote}: {err}");
                        None
                    }
                });
            let conn = TlsConnection { peer };

            let service = service_fn(move |req| {
                let endpoint = Arc::clone(&endpoint);
                let conn = conn.clone();
                async move { Ok::<_, Infallible>(dispatch(endpoint.as_ref(), conn, req).await) }
            });
            if let Err(err) = http1::Builder::new()
                .serve_connection(TokioIo::new(tls), service)
                .await
            {
                debug!("Connection from {remote} closed: {err}");
            }
        });
    }
}

async fn dispatch<E, B>(
    endpoint: &E,
    conn: TlsConnection,
    req: hyper::Request<B>,
) -> hyper::Response<Full<Bytes>>
where
    E: Endpoint,
    B: Body<Data = Bytes>,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let (parts, body) = req.into_parts();
    let body = match Limited::new(body, MAX_REQUEST_BODY).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(err) if err.downcast_ref::<LengthLimitError>().is_some() => {
            debug!("Refusing {} {}: {err}", parts.method, parts.uri);
            return status_only(StatusCode::PAYLOAD_TOO_LARGE);
        }
        Err(err) => {
            debug!("Failed to read request body: {err}");
            return status_only(StatusCode::BAD_REQUEST);
        }
    };

    let mut req = poem::Request::builder()
        .method(parts.method)
        .uri(parts.uri)
        .body(body);
    *req.headers_mut() = parts.headers;
    req.extensions_mut().insert(conn);

    let resp = endpoint.get_response(req).await;
    let status = resp.status();
    let headers = resp.headers().clone();
    let bytes = match resp.into_body().into_bytes().await {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!("Failed to read response body: {err}");
            return status_only(StatusCode::INTERNAL_SERVER_ERROR);
        }
    };

    let mut out = hyper::Response::new(Full::new(bytes));
    *out.status_mut() = status;
    *out.headers_mut() = headers;
    out
}

fn status_only(status: StatusCode) -> hyper::Response<Full<Bytes>> {
    let mut resp = hyper::Response::new(Full::new(Bytes::new()));
    *resp.status_mut() = status;
    resp
}
