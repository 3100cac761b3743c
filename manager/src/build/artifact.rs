//! Package artifact acquisition
//!
//! Fetches the versioned agent package into the build directory. Downloads
//! land in a temp file first and are renamed into place, so a partial
//! download never passes for a finished artifact. An artifact already on
//! disk is reused unless the caller forces a refresh.

use async_trait::async_trait;
use futures_util::StreamExt;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::info;

use crate::error::Result;

/// Package acquisition collaborator: resolves a source to a local artifact
/// path, or `None` when nothing could be located.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn fetch(&self, force_refresh: bool) -> Result<Option<PathBuf>>;
}

/// Store backed by a direct download URL. The artifact filename is the last
/// URL segment.
pub struct HttpArtifactStore {
    url: String,
    dir: PathBuf,
    http: reqwest::Client,
}

impl HttpArtifactStore {
    pub fn new(url: &str, dir: &Path) -> Self {
        Self {
            url: url.to_string(),
            dir: dir.to_path_buf(),
            http: reqwest::Client::new(),
        }
    }

    fn artifact_name(&self) -> String {
        self.url.rsplit('/').next().unwrap_or_default().to_string()
    }
}

#[async_trait]
impl ArtifactStore for HttpArtifactStore {
    async fn fetch(&self, force_refresh: bool) -> Result<Option<PathBuf>> {
        let name = self.artifact_name();
        if name.is_empty() {
            return Ok(None);
        }
        let target = self.dir.join(&name);

        if target.exists() {
            if !force_refresh {
                info!(artifact = %name, "package artifact already downloaded");
                return Ok(Some(target));
            }
            tokio::fs::remove_file(&target).await?;
        }

        tokio::fs::create_dir_all(&self.dir).await?;
        info!(url = %self.url, "downloading package artifact");
        let response = self.http.get(&self.url).send().await?.error_for_status()?;

        let tmp = target.with_extension("tmp");
        let mut file = tokio::fs::File::create(&tmp).await?;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            file.write_all(&chunk?).await?;
        }
        file.flush().await?;
        drop(file);
        tokio::fs::rename(&tmp, &target).await?;

        Ok(Some(target))
    }
}

/// Hex SHA-256 digest of a file, recorded as build provenance.
pub fn file_digest(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}
