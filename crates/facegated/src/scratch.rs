//! Scratch directory layout: cached registered images and per-request captures.

use chrono::{DateTime, Local};
use sha2::{Digest, Sha256};
use std::ffi::OsString;
use std::fmt::Write;
use std::path::{Path, PathBuf};

/// Suffix of the file recording the SHA-256 of a cached registered image.
const DIGEST_SUFFIX: &str = ".sha256";

/// Shared filesystem location for registered-image caches and captures.
#[derive(Debug, Clone)]
pub struct ScratchDir {
    root: PathBuf,
}

impl ScratchDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the directory (and parents) if it is missing.
    pub async fn ensure(&self) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.root).await
    }

    pub async fn exists(&self) -> bool {
        tokio::fs::try_exists(&self.root).await.unwrap_or(false)
    }

    /// Cache file for a voter's registered image: `reg_<voter_id>.jpg`.
    pub fn registered_path(&self, voter_id: &str) -> PathBuf {
        self.root.join(format!("reg_{}.jpg", file_component(voter_id)))
    }

    /// Single-use file for a captured image:
    /// `capture_<voter_id>_<YYYYmmdd_HHMMSS_ffffff>.jpg`. Microseconds keep
    /// back-to-back requests for one voter on separate files.
    pub fn capture_path(&self, voter_id: &str, at: DateTime<Local>) -> PathBuf {
        self.root.join(format!(
            "capture_{}_{}.jpg",
            file_component(voter_id),
            at.format("%Y%m%d_%H%M%S_%6f")
        ))
    }
}

/// Make a voter id safe to embed in a file name. Bytes outside
/// `[A-Za-z0-9_-]` are percent-encoded (`.` becomes `%2E`), so ids cannot
/// escape the scratch directory and distinct ids never share a file.
fn file_component(voter_id: &str) -> String {
    let mut out = String::with_capacity(voter_id.len());
    for b in voter_id.bytes() {
        if b.is_ascii_alphanumeric() || b == b'-' || b == b'_' {
            out.push(char::from(b));
        } else {
            let _ = write!(out, "%{b:02X}");
        }
    }
    out
}

fn digest_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(DIGEST_SUFFIX);
    PathBuf::from(name)
}

/// Write `bytes` to `path` unless the digest recorded beside it
/// (`<path>.sha256`) shows the file already holds that content.
///
/// Returns `true` when the file was (re)written.
pub async fn write_if_changed(path: &Path, bytes: &[u8]) -> std::io::Result<bool> {
    let digest = format!("{:x}", Sha256::digest(bytes));
    let sidecar = digest_path(path);

    let recorded = tokio::fs::read_to_string(&sidecar).await.ok();
    if recorded.as_deref().map(str::trim) == Some(digest.as_str())
        && tokio::fs::try_exists(path).await.unwrap_or(false)
    {
        return Ok(false);
    }

    tokio::fs::write(path, bytes).await?;
    tokio::fs::write(&sidecar, &digest).await?;
    Ok(true)
}

/// Drop the recorded digest of `path`; call before writing it by other means.
pub async fn forget_digest(path: &Path) {
    match tokio::fs::remove_file(digest_path(path)).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "cannot remove cache digest"),
    }
}
