use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use tracing::debug;

use crate::error::{BootstrapError, Result};
use crate::passwd::Passwd;

const BASIC_SCHEME: &str = "Basic ";

/// An authenticated caller and the roles it holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    pub name: String,
    pub roles: Vec<String>,
}

impl ClientIdentity {
    #[must_use]
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

/// Request extension set by the TLS listener. Its absence means the request
/// did not arrive over TLS.
#[derive(Debug, Clone, Default)]
pub struct TlsConnection {
    /// Identity from a verified client certificate.
    pub peer: Option<ClientIdentity>,
}

/// Reads the subject of a verified client certificate: CN becomes the name,
/// each O attribute a role.
///
/// # Errors
/// Returns `Auth` if the certificate cannot be parsed or has no CN.
pub fn from_certificate(der: &[u8]) -> Result<ClientIdentity> {
    let (_, cert) = x509_parser::parse_x509_certificate(der)
        .map_err(|e| BootstrapError::Auth(format!("unparsable client certificate: {e}")))?;
    let subject = cert.subject();
    let name = subject
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .ok_or_else(|| BootstrapError::Auth("client certificate has no common name".to_string()))?
        .to_string();
    let roles = subject
        .iter_organization()
        .filter_map(|o| o.as_str().ok())
        .map(ToString::to_string)
        .collect();

    debug!("Client certificate identity {name}");
    Ok(ClientIdentity { name, roles })
}

/// Authenticates an `Authorization: Basic` header against the credential
/// table. The user's role column becomes its only role.
#[must_use]
pub fn from_basic_auth(header: &str, users: &Passwd) -> Option<ClientIdentity> {
    let encoded = header.strip_prefix(BASIC_SCHEME)?;
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (name, secret) = decoded.split_once(':')?;

    match users.check(name, secret) {
        (true, true) => Some(ClientIdentity {
            name: name.to_string(),
            roles: users
                .role(name)
                .filter(|r| !r.is_empty())
                .map(|r| vec![r.to_string()])
                .unwrap_or_default(),
        }),
        _ => None,
    }
}
