//! The flat credential table (`secret,username,role[,extra...]`).
//!
//! Secrets are stored in plaintext; the file mode is the only protection.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use subtle::ConstantTimeEq;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::{BootstrapError, Result};
use crate::{fs_util, token};

const GENERATED_SECRET_BYTES: usize = 16;
const MIN_COLUMNS: usize = 2;
const RESERVED: &[char] = &[',', '\r', '\n'];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswdEntry {
    pub secret: String,
    pub role: String,
    extra: Vec<String>,
}

/// In-memory copy of a credential file, unique by username.
#[derive(Debug, Clone, Default)]
pub struct Passwd {
    entries: BTreeMap<String, PasswdEntry>,
}

impl Passwd {
    /// Parses the credential file. A missing file yields an empty table.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or a line has fewer than
    /// two columns.
    pub async fn read(path: &Path) -> Result<Self> {
        let Some(bytes) = fs_util::read_optional(path).await? else {
            return Ok(Self::default());
        };
        let contents = String::from_utf8(bytes).map_err(|e| BootstrapError::Credential {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::parse(&contents).map_err(|reason| BootstrapError::Credential {
            path: path.to_path_buf(),
            reason,
        })
    }

    fn parse(contents: &str) -> std::result::Result<Self, String> {
        let mut entries = BTreeMap::new();
        for (index, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let columns: Vec<&str> = line.split(',').map(str::trim).collect();
            if columns.len() < MIN_COLUMNS {
                return Err(format!(
                    "line {} must have at least {MIN_COLUMNS} columns (secret, username), found {}",
                    index + 1,
                    columns.len()
                ));
            }
            let entry = PasswdEntry {
                secret: columns[0].to_string(),
                role: columns.get(2).copied().unwrap_or_default().to_string(),
                extra: columns.iter().skip(3).map(ToString::to_string).collect(),
            };
            entries.insert(columns[1].to_string(), entry);
        }
        Ok(Self { entries })
    }

    /// Inserts or updates `username`.
    ///
    /// An empty `secret` keeps the existing one, or generates a random secret
    /// for a new user. A full join token (`K10<hash>::<username>:<secret>`)
    /// is reduced to its secret part.
    ///
    /// # Errors
    /// Returns `InvalidInput` if a field contains a column or line separator,
    /// or an error if a random secret cannot be generated.
    pub fn ensure_user(&mut self, username: &str, role: &str, secret: &str) -> Result<()> {
        let secret = strip_token_prefix(username, secret);
        check_field("username", username)?;
        check_field("role", role)?;
        check_field("secret", secret)?;

        if let Some(entry) = self.entries.get_mut(username) {
            if !secret.is_empty() {
                entry.secret = secret.to_string();
            }
            entry.role = role.to_string();
            return Ok(());
        }

        let secret = if secret.is_empty() {
            token::random(GENERATED_SECRET_BYTES)?
        } else {
            secret.to_string()
        };
        self.entries.insert(
            username.to_string(),
            PasswdEntry {
                secret,
                role: role.to_string(),
                extra: Vec::new(),
            },
        );
        Ok(())
    }

    /// Compares `secret` to the stored one in constant time.
    ///
    /// Returns `(matches, exists)`.
    #[must_use]
    pub fn check(&self, username: &str, secret: &str) -> (bool, bool) {
        match self.entries.get(username) {
            Some(entry) => {
                let matches: bool = entry.secret.as_bytes().ct_eq(secret.as_bytes()).into();
                (matches, true)
            }
            None => (false, false),
        }
    }

    #[must_use]
    pub fn pass(&self, username: &str) -> Option<&str> {
        self.entries.get(username).map(|e| e.secret.as_str())
    }

    #[must_use]
    pub fn role(&self, username: &str) -> Option<&str> {
        self.entries.get(username).map(|e| e.role.as_str())
    }

    /// Rewrites the whole file with owner-only permissions.
    ///
    /// # Errors
    /// Returns an error if the file cannot be written.
    pub async fn write(&self, path: &Path) -> Result<()> {
        fs_util::write_secret(path, self.render()).await
    }

    fn render(&self) -> String {
        let mut out = String::new();
        for (username, entry) in &self.entries {
            out.push_str(&entry.secret);
            out.push(',');
            out.push_str(username);
            out.push(',');
            out.push_str(&entry.role);
            for extra in &entry.extra {
                out.push(',');
                out.push_str(extra);
            }
            out.push('\n');
        }
        out
    }
}

fn check_field(name: &str, value: &str) -> Result<()> {
    if value.contains(RESERVED) {
        return Err(BootstrapError::InvalidInput(format!(
            "{name} must not contain ',' or line breaks"
        )));
    }
    Ok(())
}

fn strip_token_prefix<'a>(username: &str, secret: &'a str) -> &'a str {
    if !secret.starts_with(token::TOKEN_PREFIX) {
        return secret;
    }
    let marker = format!("::{username}:");
    match secret.find(&marker) {
        Some(idx) if idx > 0 => &secret[idx + marker.len()..],
        _ => secret,
    }
}

/// Trust-on-first-use node secrets, serialized under one lock.
#[derive(Debug)]
pub struct NodePasswords {
    path: PathBuf,
    lock: Mutex<()>,
}

impl NodePasswords {
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }

    /// Accepts `secret` for `node_name` if it matches the stored one, or
    /// records it when the node has never been seen.
    ///
    /// # Errors
    /// Returns `Auth` when the node is known with a different secret, or an
    /// error if the file cannot be read or written.
    pub async fn ensure(&self, node_name: &str, secret: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut table = Passwd::read(&self.path).await?;
        match table.check(node_name, secret) {
            (true, true) => Ok(()),
            (false, true) => {
                warn!(
                    "Node password validation failed for '{node_name}', using passwd file '{}'",
                    self.path.display()
                );
                Err(BootstrapError::Auth(format!(
                    "node password validation failed for '{node_name}'"
                )))
            }
            (_, false) => {
                table.ensure_user(node_name, "", secret)?;
                table.write(&self.path).await?;
                info!("Registered password for new node '{node_name}'");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tempfile::tempdir;

    use super::*;

    #[tokio::test]
    async fn test_read_missing_file_is_empty() {
        let dir = tempdir().unwrap();
        let table = Passwd::read(&dir.path().join("passwd")).await.unwrap();
        assert!(table.pass("admin").is_none());
    }

    #[tokio::test]
    async fn test_read_rejects_single_column_line() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("passwd");
        tokio::fs::write(&path, "secret-only\n").await.unwrap();

        let err = Passwd::read(&path).await.unwrap_err();
        assert!(matches!(err, BootstrapError::Credential { .. }));
    }

    #[tokio::test]
    async fn test_write_then_read_keeps_extra_columns() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("passwd");
        tokio::fs::write(&path, "s3cret,server,k2s:server,uid=0\n")
            .await
            .unwrap();

        let table = Passwd::read(&path).await.unwrap();
        table.write(&path).await.unwrap();

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(contents, "s3cret,server,k2s:server,uid=0\n");
    }

    #[test]
    fn test_first_contact_then_mismatch() {
        let mut table = Passwd::default();
        assert_eq!(table.check("worker-1", "abc"), (false, false));

        table.ensure_user("worker-1", "", "abc").unwrap();
        assert_eq!(table.check("worker-1", "abc"), (true, true));
        assert_eq!(table.check("worker-1", "other"), (false, true));
    }

    #[test]
    fn test_ensure_user_with_empty_secret() {
        let mut table = Passwd::default();
        table.ensure_user("admin", "system:masters", "").unwrap();
        let generated = table.pass("admin").unwrap().to_string();
        assert_eq!(generated.len(), GENERATED_SECRET_BYTES * 2);

        table.ensure_user("admin", "system:masters", "").unwrap();
        assert_eq!(table.pass("admin"), Some(generated.as_str()));
    }

    #[test]
    fn test_ensure_user_overwrites_secret_and_role() {
        let mut table = Passwd::default();
        table.ensure_user("node", "k2s:agent", "one").unwrap();
        table.ensure_user("node", "k2s:agent-v2", "two").unwrap();
        assert_eq!(table.pass("node"), Some("two"));
        assert_eq!(table.role("node"), Some("k2s:agent-v2"));
    }

    #[test]
    fn test_ensure_user_accepts_full_join_token() {
        let mut table = Passwd::default();
        let token = format!("K10{}::server:abc123", "ab".repeat(32));
        table.ensure_user("server", "k2s:server", &token).unwrap();
        assert_eq!(table.pass("server"), Some("abc123"));
    }

    #[test]
    fn test_ensure_user_rejects_separators() {
        let mut table = Passwd::default();
        for (username, secret) in [
            ("worker-1", "pw,with-comma"),
            ("worker-1", "pw\nextra"),
            ("worker,1", "pw"),
        ] {
            let err = table.ensure_user(username, "", secret).unwrap_err();
            assert!(matches!(err, BootstrapError::InvalidInput(_)));
        }
        assert!(table.render().is_empty());
    }

    #[tokio::test]
    async fn test_node_passwords_keep_first_use_after_rejected_secret() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("node-passwd");
        let nodes = NodePasswords::new(path.clone());

        let err = nodes.ensure("worker-1", "pw,with-comma").await.unwrap_err();
        assert!(matches!(err, BootstrapError::InvalidInput(_)));
        assert!(!path.exists());

        nodes.ensure("worker-1", "first").await.unwrap();
        let err = nodes.ensure("worker-1", "attacker").await.unwrap_err();
        assert!(matches!(err, BootstrapError::Auth(_)));
        let table = Passwd::read(&path).await.unwrap();
        assert_eq!(table.check("worker-1", "first"), (true, true));
    }

    #[tokio::test]
    async fn test_node_passwords_trust_on_first_use() {
        let dir = tempdir().unwrap();
        let nodes = NodePasswords::new(dir.path().join("node-passwd"));

        nodes.ensure("worker-1", "first").await.unwrap();
        nodes.ensure("worker-1", "first").await.unwrap();
        let err = nodes.ensure("worker-1", "second").await.unwrap_err();
        assert!(matches!(err, BootstrapError::Auth(_)));
    }

    #[tokio::test]
    async fn test_node_passwords_concurrent_registration() {
        let dir = tempdir().unwrap();
        let nodes = Arc::new(NodePasswords::new(dir.path().join("node-passwd")));

        let mut handles = Vec::new();
        for i in 0..8 {
            let nodes = Arc::clone(&nodes);
            handles.push(tokio::spawn(async move {
                nodes.ensure(&format!("worker-{i}"), "pw").await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let table = Passwd::read(&dir.path().join("node-passwd")).await.unwrap();
        for i in 0..8 {
            assert_eq!(table.check(&format!("worker-{i}"), "pw"), (true, true));
        }
    }
}
