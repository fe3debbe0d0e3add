//! Locate a voter's registered photo as a local, readable file.
//!
//! Sources, in order of precedence:
//! 1. `profilePicture.localPath` when the file exists on this host;
//! 2. a `data:image` URL, decoded into the scratch cache;
//! 3. an `http(s)` URL, downloaded into the scratch cache.
//!
//! A source that fails falls through to the next one. Cached files are
//! keyed by voter id and are never deleted by this service. Data-URL
//! caches are rewritten only when their SHA-256 changes; downloads are
//! fetched again on every lookup.

use crate::fetcher::RemoteFetcher;
use crate::payload;
use crate::scratch::{self, ScratchDir};
use crate::store::{VoterRecord, VoterStore};
use std::path::PathBuf;
use std::sync::Arc;

/// Which representation the registered image came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageSource {
    LocalPath,
    DataUrl,
    RemoteUrl,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// No record for this voter id (or the lookup failed).
    UnknownVoter,
    /// The voter exists but none of its image sources is usable.
    NoUsableImage { name: String },
    Found {
        path: PathBuf,
        name: String,
        source: ImageSource,
    },
}

impl Resolution {
    pub fn name(&self) -> Option<&str> {
        match self {
            Resolution::UnknownVoter => None,
            Resolution::NoUsableImage { name } | Resolution::Found { name, .. } => Some(name.as_str()),
        }
    }
}

#[derive(Clone)]
pub struct ImageResolver {
    store: Arc<dyn VoterStore>,
    scratch: ScratchDir,
    fetcher: RemoteFetcher,
}

impl ImageResolver {
    pub fn new(store: Arc<dyn VoterStore>, scratch: ScratchDir, fetcher: RemoteFetcher) -> Self {
        Self { store, scratch, fetcher }
    }

    pub async fn resolve(&self, voter_id: &str) -> Resolution {
        let record = match self.store.find_voter(voter_id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                tracing::warn!(voter_id, "no voter record");
                return Resolution::UnknownVoter;
            }
            Err(e) => {
                tracing::error!(voter_id, error = %e, "voter lookup failed");
                return Resolution::UnknownVoter;
            }
        };

        let name = record.display_name();
        tracing::info!(
            voter_id,
            name = %name,
            local_path = record.local_path(),
            has_url = record.url().is_some(),
            "voter record found"
        );

        match self.materialize(voter_id, &record).await {
            Some((path, source)) => Resolution::Found { path, name, source },
            None => {
                tracing::warn!(voter_id, "no usable registered image source");
                Resolution::NoUsableImage { name }
            }
        }
    }

    async fn materialize(&self, voter_id: &str, record: &VoterRecord) -> Option<(PathBuf, ImageSource)> {
        if let Some(local) = record.local_path() {
            let path = PathBuf::from(local);
            if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                tracing::info!(path = %path.display(), "using registered image from local path");
                return Some((path, ImageSource::LocalPath));
            }
            tracing::debug!(path = %path.display(), "local path not present on this host");
        }

        let url = record.url()?;
        let cache = self.scratch.registered_path(voter_id);

        if payload::is_data_url(url) {
            match self.cache_data_url(url, &cache).await {
                Ok(()) => return Some((cache, ImageSource::DataUrl)),
                Err(e) => tracing::error!(voter_id, error = %e, "cannot decode registered data URL"),
            }
        }

        if url.starts_with("http://") || url.starts_with("https://") {
            scratch::forget_digest(&cache).await;
            match self.fetcher.download(url, &cache).await {
                Ok(_) => return Some((cache, ImageSource::RemoteUrl)),
                Err(e) => {
                    tracing::error!(voter_id, error = %e, "cannot download registered image");
                    // remove a partially written body
                    let _ = tokio::fs::remove_file(&cache).await;
                }
            }
        }

        None
    }

    /// Decode a data URL into the cache file, rewriting it only when the
    /// content changed.
    async fn cache_data_url(&self, url: &str, cache: &std::path::Path) -> Result<(), CacheError> {
        let bytes = payload::decode(url)?;
        let rewritten = scratch::write_if_changed(cache, &bytes).await?;
        tracing::info!(
            path = %cache.display(),
            bytes = bytes.len(),
            rewritten,
            "registered image cached from data URL"
        );
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
enum CacheError {
    #[error(transparent)]
    Payload(#[from] payload::PayloadError),
    #[error("cache write: {0}")]
    Io(#[from] std::io::Error),
}
