use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use tokio::fs;

use crate::error::{BootstrapError, Result};

const SECRET_FILE_MODE: u32 = 0o600;
const SECRETS_DIR_MODE: u32 = 0o700;
const TEMP_SUFFIX: &str = ".tmp";

/// Ensures the directory exists and is only accessible by its owner.
///
/// # Errors
/// Returns an error if the directory cannot be created or permissions cannot be set.
pub async fn ensure_secrets_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)
        .await
        .map_err(|e| BootstrapError::io("Failed to create directory", path, e))?;
    fs::set_permissions(path, std::fs::Permissions::from_mode(SECRETS_DIR_MODE))
        .await
        .map_err(|e| BootstrapError::io("Failed to set directory permissions", path, e))?;
    Ok(())
}

/// Applies owner-only permissions to a file.
///
/// # Errors
/// Returns an error if permissions cannot be set.
pub async fn set_secret_permissions(path: &Path) -> Result<()> {
    fs::set_permissions(path, std::fs::Permissions::from_mode(SECRET_FILE_MODE))
        .await
        .map_err(|e| BootstrapError::io("Failed to set file permissions", path, e))
}

/// Replaces the file contents by writing a sibling temp file and renaming it
/// over the target. The result is always mode 0600.
///
/// # Errors
/// Returns an error if the parent directory is missing or any write fails.
pub async fn write_secret(path: &Path, contents: impl AsRef<[u8]>) -> Result<()> {
    let parent = path.parent().ok_or_else(|| {
        BootstrapError::io(
            "Path has no parent directory",
            path,
            std::io::Error::from(std::io::ErrorKind::InvalidInput),
        )
    })?;
    if !parent.as_os_str().is_empty() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| BootstrapError::io("Failed to create directory", parent, e))?;
    }

    let mut temp = path.as_os_str().to_owned();
    temp.push(TEMP_SUFFIX);
    let temp = Path::new(&temp);

    fs::write(temp, contents.as_ref())
        .await
        .map_err(|e| BootstrapError::io("Failed to write", temp, e))?;
    set_secret_permissions(temp).await?;
    fs::rename(temp, path)
        .await
        .map_err(|e| BootstrapError::io("Failed to replace", path, e))?;
    Ok(())
}

/// Reads a whole file, attaching the path to any error.
///
/// # Errors
/// Returns an error if the file cannot be read.
pub async fn read(path: &Path) -> Result<Vec<u8>> {
    fs::read(path)
        .await
        .map_err(|e| BootstrapError::io("Failed to read", path, e))
}

/// Reads a file, returning `None` when it does not exist.
///
/// # Errors
/// Returns an error for any failure other than a missing file.
pub async fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
    match fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(BootstrapError::io("Failed to read", path, err)),
    }
}

/// Returns true only when every path exists.
pub async fn exists_all(paths: &[&Path]) -> bool {
    for path in paths {
        if !fs::try_exists(path).await.unwrap_or(false) {
            return false;
        }
    }
    true
}
