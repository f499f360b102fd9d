//! Output store
//!
//! Each artifact is two files under the output root: the data at `<id>.bin`
//! and its metadata at `<id>.json`. The sidecar is written last, through a temp
//! file and rename, so an artifact is visible only once its data is complete.

use chrono::Utc;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::artifact::{detect_mime, extension_of, generate_token, is_valid_token, remove_quietly_async, OutputArtifact};
use crate::error::{PipelineError, Result};
use crate::handler::run_blocking;

pub const DATA_EXTENSION: &str = "bin";
pub const META_EXTENSION: &str = "json";

/// Where the bytes of a new artifact come from.
#[derive(Debug)]
pub enum ArtifactSource<'a> {
    Bytes(&'a [u8]),
    /// Moved into the store when on the same filesystem, copied otherwise
    Path(&'a Path),
}

pub struct OutputStore {
    root: PathBuf,
    ttl: Duration,
    /// Serializes sidecar read-modify-write cycles
    meta_lock: Mutex<()>,
}

impl OutputStore {
    /// Open (creating if needed) the store rooted at `root`.
    pub fn new(root: impl AsRef<Path>, ttl: Duration) -> Result<Self> {
        std::fs::create_dir_all(root.as_ref())?;
        let root = std::fs::canonicalize(root.as_ref())?;
        Ok(Self {
            root,
            ttl,
            meta_lock: Mutex::new(()),
        })
    }

    /// Canonical output root. Every data path resolves beneath it.
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn data_path(&self, id: &str) -> PathBuf {
        self.root.join(format!("{}.{}", id, DATA_EXTENSION))
    }

    pub fn meta_path(&self, id: &str) -> PathBuf {
        self.root.join(format!("{}.{}", id, META_EXTENSION))
    }

    pub async fn store(&self, source: ArtifactSource<'_>, display_name: &str) -> Result<OutputArtifact> {
        let id = generate_token();
        let data_path = self.data_path(&id);

        let written = self.write_data(source, &data_path).await;
        let size = match written {
            Ok(size) => size,
            Err(e) => {
                let _ = remove_quietly_async(&data_path).await;
                return Err(e);
            }
        };

        let created_at = Utc::now();
        let ttl = chrono::Duration::from_std(self.ttl)
            .map_err(|e| PipelineError::Config(format!("output TTL out of range: {}", e)))?;
        let ext = extension_of(display_name);
        let artifact = OutputArtifact {
            id: id.clone(),
            display_name: display_name.to_string(),
            size,
            mime: detect_mime(&data_path, ext.as_deref()),
            created_at,
            expires_at: created_at + ttl,
            download_count: 0,
            stored_path: data_path.clone(),
        };

        if let Err(e) = self.write_meta(&artifact).await {
            let _ = remove_quietly_async(&data_path).await;
            return Err(e);
        }

        debug!(id = %id, name = %display_name, size, "artifact stored");
        Ok(artifact)
    }

    async fn write_data(&self, source: ArtifactSource<'_>, data_path: &Path) -> Result<u64> {
        match source {
            ArtifactSource::Bytes(bytes) => {
                tokio::fs::write(data_path, bytes).await?;
                Ok(bytes.len() as u64)
            }
            ArtifactSource::Path(path) => {
                if tokio::fs::rename(path, data_path).await.is_err() {
                    tokio::fs::copy(path, data_path).await?;
                }
                Ok(tokio::fs::metadata(data_path).await?.len())
            }
        }
    }

    async fn write_meta(&self, artifact: &OutputArtifact) -> Result<()> {
        let body = serde_json::to_vec_pretty(artifact)
            .map_err(|e| PipelineError::processing(format!("failed to serialize metadata: {}", e)))?;
        let root = self.root.clone();
        let target = self.meta_path(&artifact.id);
        run_blocking(move || {
            let mut tmp = tempfile::NamedTempFile::new_in(&root)?;
            tmp.write_all(&body)?;
            tmp.as_file().sync_all()?;
            tmp.persist(&target).map_err(|e| PipelineError::Io(e.error))?;
            Ok(())
        })
        .await
    }

    /// Metadata for `id`. Unknown or malformed ids are `NotFound`.
    pub async fn load(&self, id: &str) -> Result<OutputArtifact> {
        if !is_valid_token(id) {
            return Err(PipelineError::NotFound(format!("download '{}'", id)));
        }
        let raw = match tokio::fs::read(self.meta_path(id)).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(PipelineError::NotFound(format!("download '{}'", id)));
            }
            Err(e) => return Err(e.into()),
        };
        let mut artifact: OutputArtifact = serde_json::from_slice(&raw)
            .map_err(|e| PipelineError::processing(format!("corrupt metadata for {}: {}", id, e)))?;
        if artifact.id != id {
            return Err(PipelineError::processing(format!("metadata id mismatch for {}", id)));
        }
        artifact.stored_path = self.data_path(id);
        Ok(artifact)
    }

    /// Bump the download counter, returning the updated record.
    pub async fn record_download(&self, id: &str) -> Result<OutputArtifact> {
        let _guard = self.meta_lock.lock().await;
        let mut artifact = self.load(id).await?;
        artifact.download_count += 1;
        self.write_meta(&artifact).await?;
        Ok(artifact)
    }

    /// Delete both files of an artifact. Returns whether anything was removed.
    pub async fn remove(&self, id: &str) -> Result<bool> {
        if !is_valid_token(id) {
            return Ok(false);
        }
        let _guard = self.meta_lock.lock().await;
        // metadata first, so a half-removed artifact is never served
        let meta = remove_quietly_async(&self.meta_path(id)).await?;
        let data = remove_quietly_async(&self.data_path(id)).await?;
        if meta || data {
            info!(id = %id, "🗑️ Artifact removed");
        }
        Ok(meta || data)
    }

    /// All readable artifact records. Corrupt sidecars are skipped.
    pub async fn list(&self) -> Result<Vec<OutputArtifact>> {
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        let mut artifacts = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(META_EXTENSION) {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match self.load(id).await {
                Ok(artifact) => artifacts.push(artifact),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable artifact record"),
            }
        }
        Ok(artifacts)
    }
}
