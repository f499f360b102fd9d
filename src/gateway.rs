//! Download gateway: resolves an artifact id to an open file inside the output root

use chrono::Utc;
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tracing::{info, warn};

use crate::artifact::{is_valid_token, OutputArtifact};
use crate::error::{PipelineError, Result};
use crate::metrics::Metrics;
use crate::store::OutputStore;

/// An opened artifact ready to stream.
#[derive(Debug)]
pub struct Download {
    pub artifact: OutputArtifact,
    pub file: File,
    /// Length of the opened file
    pub len: u64,
}

pub struct DownloadGateway {
    store: Arc<OutputStore>,
    metrics: Arc<Metrics>,
}

impl DownloadGateway {
    pub fn new(store: Arc<OutputStore>, metrics: Arc<Metrics>) -> Self {
        Self { store, metrics }
    }

    fn not_found(id: &str) -> PipelineError {
        PipelineError::NotFound(format!("download '{}'", id))
    }

    /// Open the artifact for `id`.
    ///
    /// Unknown, expired and malformed ids all look the same to the caller:
    /// `NotFound`. The data path is canonicalized and must stay beneath the
    /// store root.
    pub async fn open(&self, id: &str) -> Result<Download> {
        if !is_valid_token(id) {
            return Err(Self::not_found(id));
        }
        let artifact = self.store.load(id).await?;
        if artifact.is_expired_at(Utc::now()) {
            return Err(Self::not_found(id));
        }

        let resolved = match tokio::fs::canonicalize(artifact.stored_path()).await {
            Ok(path) => path,
            Err(e) => {
                warn!(id = %id, error = %e, "artifact data missing");
                return Err(Self::not_found(id));
            }
        };
        if !resolved.starts_with(self.store.root()) {
            warn!(id = %id, path = %resolved.display(), "artifact path escapes output root");
            return Err(Self::not_found(id));
        }

        let file = File::open(&resolved).await.map_err(|_| Self::not_found(id))?;
        let len = file.metadata().await?.len();
        let artifact = self.store.record_download(id).await?;
        self.metrics.record_download();

        info!(id = %id, name = %artifact.display_name, downloads = artifact.download_count, "📤 Download served");
        Ok(Download { artifact, file, len })
    }

    /// Open and read the whole artifact.
    pub async fn read(&self, id: &str) -> Result<(OutputArtifact, Vec<u8>)> {
        let mut download = self.open(id).await?;
        let mut bytes = Vec::with_capacity(download.len as usize);
        download.file.read_to_end(&mut bytes).await?;
        Ok((download.artifact, bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ArtifactSource;
    use std::time::Duration;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_repeated_downloads_identical() {
        let dir = tempdir().unwrap();
        let store = Arc::new(OutputStore::new(dir.path(), Duration::from_secs(60)).unwrap());
        let gateway = DownloadGateway::new(store.clone(), Metrics::new());
        let artifact = store.store(ArtifactSource::Bytes(b"payload"), "p.txt").await.unwrap();

        let (_, first) = gateway.read(&artifact.id).await.unwrap();
        let (meta, second) = gateway.read(&artifact.id).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(meta.download_count, 2);
    }

    #[tokio::test]
    async fn test_expired_is_not_found() {
        let dir = tempdir().unwrap();
        let store = Arc::new(OutputStore::new(dir.path(), Duration::from_millis(1)).unwrap());
        let gateway = DownloadGateway::new(store.clone(), Metrics::new());
        let artifact = store.store(ArtifactSource::Bytes(b"x"), "x.txt").await.unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(matches!(gateway.open(&artifact.id).await, Err(PipelineError::NotFound(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlink_outside_root_rejected() {
        let dir = tempdir().unwrap();
        let outside = tempdir().unwrap();
        let store = Arc::new(OutputStore::new(dir.path(), Duration::from_secs(60)).unwrap());
        let gateway = DownloadGateway::new(store.clone(), Metrics::new());
        let artifact = store.store(ArtifactSource::Bytes(b"x"), "x.txt").await.unwrap();

        let secret = outside.path().join("secret");
        std::fs::write(&secret, b"secret").unwrap();
        std::fs::remove_file(store.data_path(&artifact.id)).unwrap();
        std::os::unix::fs::symlink(&secret, store.data_path(&artifact.id)).unwrap();

        assert!(matches!(gateway.open(&artifact.id).await, Err(PipelineError::NotFound(_))));
    }
}
