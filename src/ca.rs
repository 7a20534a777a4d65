//! Self-signed certificate authorities and the leaf certificates they sign.
//!
//! Each CA role owns a certificate and key at a fixed path. Both files must
//! exist for the pair to count as present; otherwise a new self-signed CA is
//! minted and every leaf it signs is re-issued on the same startup.

use std::net::IpAddr;
use std::path::Path;

use rcgen::string::Ia5String;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use tracing::{info, warn};

use crate::error::{BootstrapError, Result};
use crate::fs_util;
use crate::paths::CertKeyPaths;

const CA_VALIDITY_DAYS: i64 = 3650;
const LEAF_VALIDITY_DAYS: i64 = 365;

/// The three independent signing roles of a control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaRole {
    Client,
    Server,
    RequestHeader,
}

impl CaRole {
    /// Prefix used in the CA common name, `<prefix>-ca@<unix-timestamp>`.
    #[must_use]
    pub fn prefix(self) -> &'static str {
        match self {
            Self::Client => "k2s-client",
            Self::Server => "k2s-server",
            Self::RequestHeader => "k2s-request-header",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyUsage {
    ServerAuth,
    ClientAuth,
}

impl KeyUsage {
    fn purpose(self) -> ExtendedKeyUsagePurpose {
        match self {
            Self::ServerAuth => ExtendedKeyUsagePurpose::ServerAuth,
            Self::ClientAuth => ExtendedKeyUsagePurpose::ClientAuth,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AltNames {
    pub dns_names: Vec<String>,
    pub ips: Vec<IpAddr>,
}

/// Subject and usage of a leaf certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafSpec {
    pub common_name: String,
    pub organization: Option<String>,
    pub alt_names: AltNames,
    pub usages: Vec<KeyUsage>,
}

impl LeafSpec {
    #[must_use]
    pub fn client(common_name: impl Into<String>) -> Self {
        Self {
            common_name: common_name.into(),
            organization: None,
            alt_names: AltNames::default(),
            usages: vec![KeyUsage::ClientAuth],
        }
    }

    #[must_use]
    pub fn server(common_name: impl Into<String>, alt_names: AltNames) -> Self {
        Self {
            common_name: common_name.into(),
            organization: None,
            alt_names,
            usages: vec![KeyUsage::ServerAuth],
        }
    }

    #[must_use]
    pub fn with_organization(mut self, organization: impl Into<String>) -> Self {
        self.organization = Some(organization.into());
        self
    }

    fn params(&self) -> Result<CertificateParams> {
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, self.common_name.as_str());
        if let Some(organization) = &self.organization {
            dn.push(DnType::OrganizationName, organization.as_str());
        }
        params.distinguished_name = dn;
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = self.usages.iter().map(|u| u.purpose()).collect();

        let mut sans = Vec::new();
        for name in &self.alt_names.dns_names {
            let dns = Ia5String::try_from(name.as_str())
                .map_err(|e| BootstrapError::crypto(&format!("invalid DNS name '{name}'"), e))?;
            sans.push(SanType::DnsName(dns));
        }
        sans.extend(self.alt_names.ips.iter().copied().map(SanType::IpAddress));
        params.subject_alt_names = sans;

        let now = time::OffsetDateTime::now_utc();
        params.not_before = now;
        params.not_after = now + time::Duration::days(LEAF_VALIDITY_DAYS);
        Ok(params)
    }
}

/// A loaded CA certificate and private key.
#[derive(Debug, Clone)]
pub struct SigningPair {
    pub paths: CertKeyPaths,
    cert_pem: String,
    key_pem: String,
}

impl SigningPair {
    /// Reads both halves of the pair from disk.
    ///
    /// # Errors
    /// Returns an error if either file is unreadable or not UTF-8 PEM.
    pub async fn load(paths: &CertKeyPaths) -> Result<Self> {
        let cert_pem = read_pem(&paths.cert).await?;
        let key_pem = read_pem(&paths.key).await?;
        Ok(Self {
            paths: paths.clone(),
            cert_pem,
            key_pem,
        })
    }

    #[must_use]
    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    fn issuer(&self) -> Result<Issuer<'static, KeyPair>> {
        let key = KeyPair::from_pem(&self.key_pem)
            .map_err(|e| BootstrapError::crypto("Failed to parse CA key", e))?;
        Issuer::from_ca_cert_pem(&self.cert_pem, key)
            .map_err(|e| BootstrapError::crypto("Failed to parse CA certificate", e))
    }

    /// Signs a leaf for `leaf_key` and returns `cert || ca cert` as PEM.
    ///
    /// # Errors
    /// Returns a crypto error if the CA material cannot be parsed or signing fails.
    pub fn sign(&self, spec: &LeafSpec, leaf_key: &KeyPair) -> Result<String> {
        let issuer = self.issuer()?;
        let cert = spec
            .params()?
            .signed_by(leaf_key, &issuer)
            .map_err(|e| {
                BootstrapError::crypto(&format!("Failed to sign '{}'", spec.common_name), e)
            })?;
        let mut chain = cert.pem();
        chain.push_str(&self.cert_pem);
        Ok(chain)
    }
}

/// Returns the CA for `role`, creating it when the cert or key is missing.
///
/// The flag is true when the pair was created or adopted on this call, which
/// forces every leaf signed by it to be re-issued. For the server role an
/// existing legacy `token-ca` pair is linked into place instead of minting a
/// new CA.
///
/// # Errors
/// Returns an error if the key cannot be generated or the files cannot be written.
pub async fn ensure_signing_pair(
    role: CaRole,
    paths: &CertKeyPaths,
    legacy: Option<&CertKeyPaths>,
) -> Result<(SigningPair, bool)> {
    if fs_util::exists_all(&[&paths.cert, &paths.key]).await {
        return Ok((SigningPair::load(paths).await?, false));
    }

    if let Some(legacy) = legacy
        && fs_util::exists_all(&[&legacy.cert, &legacy.key]).await
        && !fs_util::exists_all(&[&paths.cert]).await
        && !fs_util::exists_all(&[&paths.key]).await
    {
        info!(
            "Upgrading {} files to {}",
            legacy.cert.display(),
            paths.cert.display()
        );
        link_or_copy(&legacy.cert, &paths.cert).await?;
        link_or_copy(&legacy.key, &paths.key).await?;
        return Ok((SigningPair::load(paths).await?, true));
    }

    let (key, key_pem) = load_or_generate_key(&paths.key, false).await?;

    let common_name = format!(
        "{}-ca@{}",
        role.prefix(),
        time::OffsetDateTime::now_utc().unix_timestamp()
    );
    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name.as_str());
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    let now = time::OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + time::Duration::days(CA_VALIDITY_DAYS);

    let cert = params
        .self_signed(&key)
        .map_err(|e| BootstrapError::crypto("Failed to self-sign CA", e))?;
    let cert_pem = cert.pem();
    fs_util::write_secret(&paths.cert, &cert_pem).await?;
    info!("Generated signing CA {common_name}");

    Ok((
        SigningPair {
            paths: paths.clone(),
            cert_pem,
            key_pem,
        },
        true,
    ))
}

/// Signs and writes a leaf certificate unless an unexpired pair already exists.
///
/// Returns true only when a new certificate was written.
///
/// # Errors
/// Returns an error if the leaf key or CA material cannot be read or parsed,
/// or the output cannot be written.
pub async fn issue_leaf(
    regen: bool,
    spec: &LeafSpec,
    ca: &SigningPair,
    out: &CertKeyPaths,
) -> Result<bool> {
    let regen = regen || is_expired(&out.cert).await;
    if !regen && fs_util::exists_all(&[&out.cert, &out.key]).await {
        return Ok(false);
    }

    let (key, _) = load_or_generate_key(&out.key, regen).await?;
    let chain = ca.sign(spec, &key)?;
    fs_util::write_secret(&out.cert, chain).await?;
    info!(
        "Issued certificate {} at {}",
        spec.common_name,
        out.cert.display()
    );
    Ok(true)
}

/// Reports whether the first certificate in `cert_file` is past its
/// `notAfter`.
///
/// An unreadable file is not expired. A file that reads but does not parse
/// is treated as expired so that it gets re-issued.
pub async fn is_expired(cert_file: &Path) -> bool {
    let Ok(bytes) = tokio::fs::read(cert_file).await else {
        return false;
    };
    match not_after(&bytes) {
        Ok(not_after) => not_after <= time::OffsetDateTime::now_utc(),
        Err(err) => {
            warn!(
                "Certificate {} is unparsable, forcing re-issue: {err}",
                cert_file.display()
            );
            true
        }
    }
}

fn not_after(cert_bytes: &[u8]) -> Result<time::OffsetDateTime> {
    let (_, pem) = x509_parser::pem::parse_x509_pem(cert_bytes)
        .map_err(|e| BootstrapError::crypto("Failed to parse PEM certificate", e))?;
    let (_, cert) = x509_parser::parse_x509_certificate(&pem.contents)
        .map_err(|e| BootstrapError::crypto("Failed to parse X509 certificate", e))?;
    Ok(cert.validity().not_after.to_datetime())
}

/// Loads the private key at `path`, or generates and writes a new one when
/// it is missing or `regen` is set.
///
/// # Errors
/// Returns an error if an existing key cannot be parsed or a new one cannot be written.
pub async fn load_or_generate_key(path: &Path, regen: bool) -> Result<(KeyPair, String)> {
    if !regen && fs_util::exists_all(&[path]).await {
        return load_key(path).await;
    }

    let key = KeyPair::generate().map_err(|e| BootstrapError::crypto("Failed to generate key", e))?;
    let pem = key.serialize_pem();
    fs_util::write_secret(path, &pem).await?;
    Ok((key, pem))
}

/// Reads and parses an existing private key.
///
/// # Errors
/// Returns an error if the file is missing or not a PEM private key.
pub async fn load_key(path: &Path) -> Result<(KeyPair, String)> {
    let pem = read_pem(path).await?;
    let key = KeyPair::from_pem(&pem).map_err(|e| {
        BootstrapError::crypto(&format!("Failed to parse key {}", path.display()), e)
    })?;
    Ok((key, pem))
}

async fn read_pem(path: &Path) -> Result<String> {
    let bytes = fs_util::read(path).await?;
    String::from_utf8(bytes)
        .map_err(|e| BootstrapError::crypto(&format!("{} is not PEM", path.display()), e))
}

async fn link_or_copy(from: &Path, to: &Path) -> Result<()> {
    if tokio::fs::hard_link(from, to).await.is_ok() {
        return Ok(());
    }
    tokio::fs::copy(from, to)
        .await
        .map_err(|e| BootstrapError::io("Failed to copy", from, e))?;
    fs_util::set_secret_permissions(to).await
}
