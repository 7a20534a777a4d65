use std::path::{Path, PathBuf};

/// Failure classes of the trust bootstrap.
///
/// `Config` problems only disable the feature that hit them. `Crypto`,
/// `Transport`, `Bundle` and `Io` abort control-plane startup. `Auth` and
/// `InvalidInput` reject a single request.
#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("key-value transport error: {0}")]
    Transport(String),

    #[error("malformed bootstrap data: {0}")]
    Bundle(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid credential file {path}: {reason}")]
    Credential { path: PathBuf, reason: String },

    #[error("invalid join token: {0}")]
    Token(String),

    #[error("{context} {path}: {source}")]
    Io {
        context: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T, E = BootstrapError> = std::result::Result<T, E>;

impl BootstrapError {
    pub(crate) fn io(context: &'static str, path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            context,
            path: path.to_path_buf(),
            source,
        }
    }

    pub(crate) fn crypto(context: &str, err: impl std::fmt::Display) -> Self {
        Self::Crypto(format!("{context}: {err}"))
    }

    /// Returns true when the error must abort control-plane startup.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Config(_) | Self::Auth(_) | Self::InvalidInput(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_scoped_errors_are_not_fatal() {
        assert!(!BootstrapError::Config("bad mode".to_string()).is_fatal());
        assert!(!BootstrapError::Auth("mismatch".to_string()).is_fatal());
        assert!(!BootstrapError::InvalidInput("comma".to_string()).is_fatal());
        assert!(BootstrapError::Bundle("bad json".to_string()).is_fatal());
        assert!(BootstrapError::Transport("refused".to_string()).is_fatal());
        assert!(BootstrapError::Crypto("bad key".to_string()).is_fatal());
    }

    #[test]
    fn test_io_error_includes_path() {
        let err = BootstrapError::io(
            "Failed to read",
            Path::new("/tmp/missing.crt"),
            std::io::Error::from(std::io::ErrorKind::NotFound),
        );
        assert!(err.to_string().contains("/tmp/missing.crt"));
    }
}
