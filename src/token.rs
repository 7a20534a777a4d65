//! Join tokens: `K10<sha256(server-ca) hex>::<secret>`.

use ring::digest;
use ring::rand::{SecureRandom, SystemRandom};
use subtle::ConstantTimeEq;

use crate::error::{BootstrapError, Result};

pub const TOKEN_PREFIX: &str = "K10";
const FINGERPRINT_SEPARATOR: &str = "::";
const FINGERPRINT_HEX_LEN: usize = 64;

/// Hex SHA-256 of the CA certificate bytes.
#[must_use]
pub fn fingerprint(ca_pem: &[u8]) -> String {
    hex::encode(digest::digest(&digest::SHA256, ca_pem))
}

/// Wraps `secret` with the fingerprint of `ca_pem`.
///
/// An empty secret is returned unchanged. Without CA material the token
/// carries only the prefix.
#[must_use]
pub fn format(secret: &str, ca_pem: Option<&[u8]>) -> String {
    if secret.is_empty() {
        return String::new();
    }
    match ca_pem {
        Some(ca) if !ca.is_empty() => {
            format!(
                "{TOKEN_PREFIX}{}{FINGERPRINT_SEPARATOR}{secret}",
                fingerprint(ca)
            )
        }
        _ => format!("{TOKEN_PREFIX}{secret}"),
    }
}

/// Returns the secret carried by `token` after checking its fingerprint
/// against the current server CA.
///
/// # Errors
/// Returns `Token` when the fingerprint is malformed or belongs to a
/// different CA.
pub fn validate(token: &str, current_ca_pem: &[u8]) -> Result<String> {
    let Some(rest) = token.strip_prefix(TOKEN_PREFIX) else {
        return Ok(token.to_string());
    };
    let Some((hash, secret)) = rest.split_once(FINGERPRINT_SEPARATOR) else {
        return Ok(rest.to_string());
    };

    if hash.len() != FINGERPRINT_HEX_LEN || hex::decode(hash).is_err() {
        return Err(BootstrapError::Token(format!(
            "fingerprint must be {FINGERPRINT_HEX_LEN} hex characters"
        )));
    }
    let expected = fingerprint(current_ca_pem);
    let hash = hash.to_ascii_lowercase();
    if !bool::from(expected.as_bytes().ct_eq(hash.as_bytes())) {
        return Err(BootstrapError::Token(
            "token CA hash does not match the cluster CA certificate".to_string(),
        ));
    }
    Ok(secret.to_string())
}

/// Hex encoding of `bytes` random bytes.
///
/// # Errors
/// Returns a crypto error if the system RNG fails.
pub fn random(bytes: usize) -> Result<String> {
    let mut buf = vec![0u8; bytes];
    SystemRandom::new()
        .fill(&mut buf)
        .map_err(|_| BootstrapError::Crypto("system random source failed".to_string()))?;
    Ok(hex::encode(buf))
}
