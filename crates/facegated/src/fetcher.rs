//! Streaming download of remotely hosted registered images.

use futures_util::StreamExt;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncWriteExt, BufWriter};

/// Write buffer size; bounds memory per download regardless of image size.
const CHUNK_SIZE: usize = 8 * 1024;

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("cannot write {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// HTTP(S) image downloader with a fixed per-request timeout.
#[derive(Clone)]
pub struct RemoteFetcher {
    client: reqwest::Client,
}

impl RemoteFetcher {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("facegated/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }

    /// Stream `url` into `dest`. Non-2xx responses are errors.
    /// Returns the bytes written.
    pub async fn download(&self, url: &str, dest: &Path) -> Result<u64, FetchError> {
        let http_err = |source| FetchError::Http { url: url.to_string(), source };
        let write_err = |source| FetchError::Write { path: dest.display().to_string(), source };

        tracing::info!(url, path = %dest.display(), "downloading image");

        let response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(http_err)?;

        let file = tokio::fs::File::create(dest).await.map_err(write_err)?;
        let mut writer = BufWriter::with_capacity(CHUNK_SIZE, file);
        let mut stream = response.bytes_stream();
        let mut total = 0u64;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(http_err)?;
            writer.write_all(&chunk).await.map_err(write_err)?;
            total += chunk.len() as u64;
        }
        writer.flush().await.map_err(write_err)?;

        tracing::info!(url, bytes = total, "image downloaded");
        Ok(total)
    }
}
