//! File operation utilities
//!
//! Partial downloads live next to their destination with a `.part` suffix and
//! are promoted with a rename once verified, so the destination path either
//! holds a complete file or nothing at all.

use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

use super::error::{DownloadError, FileOperation, Result};
use super::hash::{HashAlgorithm, HashVerifier};

/// Path of the partial file for `dest_path`
///
/// The suffix is appended rather than replacing the extension, so
/// `a.tar.gz` and `a.tar.bz2` never share a partial file.
pub fn create_temp_path(dest_path: &Path) -> PathBuf {
    let mut name = dest_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    dest_path.with_file_name(name)
}

/// Size of the partial file, or 0 when none exists
pub async fn partial_len(temp_path: &Path) -> Result<u64> {
    match fs::metadata(temp_path).await {
        Ok(meta) => Ok(meta.len()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(DownloadError::fs(temp_path, FileOperation::Metadata, e)),
    }
}

/// Create the parent directory of `dest_path` if needed
pub async fn ensure_parent_dir(dest_path: &Path) -> Result<()> {
    if let Some(parent) = dest_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| DownloadError::fs(parent, FileOperation::CreateDir, e))?;
        }
    }
    Ok(())
}

/// Atomically rename a temporary file to its final destination
pub async fn atomic_rename(temp_path: &Path, dest_path: &Path) -> Result<()> {
    fs::rename(temp_path, dest_path)
        .await
        .map_err(|e| DownloadError::fs(dest_path, FileOperation::Move, e))?;
    debug!("Atomically renamed {} to {}", temp_path.display(), dest_path.display());
    Ok(())
}

/// Remove a file, treating a missing file as already removed
pub async fn remove_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path).await {
        Ok(()) => {
            debug!("Removed {}", path.display());
            Ok(true)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(DownloadError::fs(path, FileOperation::Delete, e)),
    }
}

/// Best-effort cleanup that only logs failures
pub async fn discard(path: &Path) {
    if let Err(e) = remove_if_exists(path).await {
        warn!("Failed to remove {}: {}", path.display(), e);
    }
}

/// Check whether the destination already holds the expected file
///
/// Verifies by digest when one is expected, otherwise by size, otherwise by
/// presence alone. An existing file that fails verification is removed and
/// `None` is returned so the caller downloads it again.
pub async fn check_existing_file(
    dest_path: &Path,
    expected_size: Option<u64>,
    expected_hash: Option<&str>,
    algorithm: HashAlgorithm,
) -> Result<Option<u64>> {
    let size = match fs::metadata(dest_path).await {
        Ok(meta) if meta.is_file() => meta.len(),
        Ok(_) => return Ok(None),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(DownloadError::fs(dest_path, FileOperation::Metadata, e)),
    };
    debug!("File already exists: {} ({} bytes)", dest_path.display(), size);

    if let Some(expected) = expected_size {
        if expected != size {
            warn!(
                "Existing file {} has {} bytes, expected {}; removing",
                dest_path.display(),
                size,
                expected
            );
            remove_if_exists(dest_path).await?;
            return Ok(None);
        }
    }

    if let Some(expected) = expected_hash {
        let digest = HashVerifier::hash_file(algorithm, dest_path).await?;
        if !digest.matches(expected) {
            warn!(
                "Existing file {} fails {} verification; removing",
                dest_path.display(),
                algorithm
            );
            remove_if_exists(dest_path).await?;
            return Ok(None);
        }
    }

    Ok(Some(size))
}
