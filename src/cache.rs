//! Host-side download cache for artifacts copied into sandboxes.
//!
//! Entries are keyed by the SHA-256 of the URL and never expire. A file is
//! only ever visible under its final name once it has been fully written.

use futures_util::StreamExt;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, info};

use crate::sandbox::{random_id, Deadline, Result, SandboxError};

const WRITE_BUFFER_BYTES: usize = 64 * 1024;

/// Directory of downloaded artifacts shared by every sandbox on the host.
#[derive(Debug, Clone)]
pub struct ArtifactCache {
    dir: PathBuf,
    client: reqwest::Client,
}

impl ArtifactCache {
    /// Creates a cache rooted at `dir`. The directory is created lazily.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| SandboxError::io("building HTTP client", std::io::Error::other(e)))?;
        Ok(Self {
            dir: dir.into(),
            client,
        })
    }

    /// Cache directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Where the artifact for `url` lives once cached.
    pub fn path_for(&self, url: &str) -> PathBuf {
        let key = hex::encode(Sha256::digest(url.as_bytes()));
        self.dir.join(format!("{key}{}", url_extension(url)))
    }

    /// Returns the cached file for `url`, downloading it first on a miss.
    ///
    /// A present, non-empty file counts as a hit. Concurrent misses for the
    /// same URL each download to their own temporary file; the last rename wins.
    pub async fn fetch(&self, url: &str, deadline: Deadline) -> Result<PathBuf> {
        let path = self.path_for(url);
        if let Ok(meta) = fs::metadata(&path).await {
            if meta.len() > 0 {
                debug!(url, path = %path.display(), "download cache hit");
                return Ok(path);
            }
        }

        if deadline.is_expired() {
            return Err(SandboxError::deadline_exceeded(format!("downloading {url}")));
        }
        fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| SandboxError::io(format!("creating {}", self.dir.display()), e))?;

        let nanos = chrono::Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or_default();
        let part = PathBuf::from(format!("{}.{nanos}.{}.part", path.display(), random_id()));

        info!(url, "downloading artifact");
        let outcome = match deadline.bound(None, self.download_to(url, &part)).await {
            Some(result) => result,
            None => Err(SandboxError::deadline_exceeded(format!("downloading {url}"))),
        };
        if let Err(e) = outcome {
            let _ = fs::remove_file(&part).await;
            return Err(e);
        }

        fs::rename(&part, &path)
            .await
            .map_err(|e| SandboxError::io(format!("moving {} into place", part.display()), e))?;
        info!(url, path = %path.display(), "artifact cached");
        Ok(path)
    }

    async fn download_to(&self, url: &str, part: &Path) -> Result<()> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| SandboxError::download_failed(url, e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(SandboxError::download_failed(url, format!("HTTP {status}")));
        }

        let write_err = |e| SandboxError::io(format!("writing {}", part.display()), e);
        let file = fs::File::create(part).await.map_err(write_err)?;
        let mut writer = BufWriter::with_capacity(WRITE_BUFFER_BYTES, file);

        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| SandboxError::download_failed(url, e.to_string()))?;
            writer.write_all(&chunk).await.map_err(write_err)?;
        }
        writer.flush().await.map_err(write_err)?;
        writer.get_ref().sync_all().await.map_err(write_err)?;
        Ok(())
    }
}

/// Best-effort extension of the URL's last path segment, with its dot.
fn url_extension(url: &str) -> String {
    reqwest::Url::parse(url)
        .ok()
        .and_then(|parsed| {
            Path::new(parsed.path())
                .extension()
                .map(|ext| format!(".{}", ext.to_string_lossy()))
        })
        .unwrap_or_default()
}
