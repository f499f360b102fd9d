//! Periodic reclamation of expired outputs and crash leftovers

use chrono::Utc;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::artifact::{is_valid_token, remove_quietly_async};
use crate::metrics::Metrics;
use crate::store::{OutputStore, DATA_EXTENSION, META_EXTENSION};

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub expired: u64,
    /// Data files without metadata, corrupt records and stray temp files
    pub orphaned_outputs: u64,
    /// Upload and scratch entries left behind by an interrupted request
    pub stale_uploads: u64,
    pub errors: u64,
}

impl SweepReport {
    pub fn removed(&self) -> u64 {
        self.expired + self.orphaned_outputs + self.stale_uploads
    }
}

pub struct CleanupSweeper {
    store: Arc<OutputStore>,
    upload_root: PathBuf,
    interval: Duration,
    orphan_grace: Duration,
    metrics: Arc<Metrics>,
}

fn age_of(modified: std::io::Result<SystemTime>) -> Duration {
    modified
        .ok()
        .and_then(|m| SystemTime::now().duration_since(m).ok())
        .unwrap_or_default()
}

impl CleanupSweeper {
    pub fn new(
        store: Arc<OutputStore>,
        upload_root: impl Into<PathBuf>,
        interval: Duration,
        orphan_grace: Duration,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            store,
            upload_root: upload_root.into(),
            interval,
            orphan_grace,
            metrics,
        }
    }

    /// One full pass over the output and upload roots.
    pub async fn sweep_once(&self) -> SweepReport {
        let mut report = SweepReport::default();
        self.sweep_outputs(&mut report).await;
        self.sweep_uploads(&mut report).await;

        self.metrics.record_sweep(report.removed());
        if report.removed() > 0 || report.errors > 0 {
            info!(
                expired = report.expired,
                orphaned = report.orphaned_outputs,
                stale_uploads = report.stale_uploads,
                errors = report.errors,
                "🧹 Sweep finished"
            );
        } else {
            debug!("sweep found nothing to reclaim");
        }
        report
    }

    async fn sweep_outputs(&self, report: &mut SweepReport) {
        let root = self.store.root();
        let mut entries = match tokio::fs::read_dir(root).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(root = %root.display(), error = %e, "cannot scan output root");
                report.errors += 1;
                return;
            }
        };
        let now = Utc::now();

        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "output scan interrupted");
                    report.errors += 1;
                    break;
                }
            };
            let path = entry.path();
            let age = match entry.metadata().await {
                Ok(meta) => age_of(meta.modified()),
                Err(_) => continue,
            };
            let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default().to_string();
            let ext = path.extension().and_then(|e| e.to_str()).unwrap_or_default().to_string();

            if ext == META_EXTENSION && is_valid_token(&stem) {
                match self.store.load(&stem).await {
                    Ok(artifact) if artifact.is_expired_at(now) => match self.store.remove(&stem).await {
                        Ok(_) => report.expired += 1,
                        Err(e) => {
                            warn!(id = %stem, error = %e, "failed to remove expired artifact");
                            report.errors += 1;
                        }
                    },
                    Ok(_) => {}
                    Err(_) if age >= self.orphan_grace => {
                        if self.store.remove(&stem).await.unwrap_or(false) {
                            report.orphaned_outputs += 1;
                        }
                    }
                    Err(_) => {}
                }
            } else if ext == DATA_EXTENSION && is_valid_token(&stem) {
                let has_meta = tokio::fs::try_exists(self.store.meta_path(&stem)).await.unwrap_or(true);
                if !has_meta && age >= self.orphan_grace && self.remove_entry(&path, false, report).await {
                    report.orphaned_outputs += 1;
                }
            } else if age >= self.orphan_grace {
                let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
                if self.remove_entry(&path, is_dir, report).await {
                    report.orphaned_outputs += 1;
                }
            }
        }
    }

    async fn sweep_uploads(&self, report: &mut SweepReport) {
        let mut entries = match tokio::fs::read_dir(&self.upload_root).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(root = %self.upload_root.display(), error = %e, "cannot scan upload root");
                report.errors += 1;
                return;
            }
        };

        while let Ok(Some(entry)) = entries.next_entry().await {
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            if age_of(meta.modified()) < self.orphan_grace {
                continue;
            }
            if self.remove_entry(&entry.path(), meta.is_dir(), report).await {
                report.stale_uploads += 1;
            }
        }
    }

    /// Whether something was actually removed. Failures count as errors.
    async fn remove_entry(&self, path: &Path, is_dir: bool, report: &mut SweepReport) -> bool {
        let result = if is_dir {
            tokio::fs::remove_dir_all(path).await.map(|_| true)
        } else {
            remove_quietly_async(path).await
        };
        match result {
            Ok(true) => {
                debug!(path = %path.display(), "reclaimed leftover");
                true
            }
            Ok(false) => false,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to reclaim leftover");
                report.errors += 1;
                false
            }
        }
    }

    /// Run [`sweep_once`](Self::sweep_once) every interval until cancelled.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("sweeper stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        self.sweep_once().await;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ArtifactSource;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_sweeps_expired_and_keeps_live() {
        let dir = tempdir().unwrap();
        let uploads = dir.path().join("uploads");
        std::fs::create_dir_all(&uploads).unwrap();
        let short = Arc::new(OutputStore::new(dir.path().join("out"), Duration::from_millis(1)).unwrap());
        let expired = short.store(ArtifactSource::Bytes(b"old"), "old.txt").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let long = OutputStore::new(dir.path().join("out"), Duration::from_secs(3600)).unwrap();
        let live = long.store(ArtifactSource::Bytes(b"new"), "new.txt").await.unwrap();

        let sweeper = CleanupSweeper::new(short.clone(), &uploads, Duration::from_secs(60), Duration::from_secs(3600), Metrics::new());
        let report = sweeper.sweep_once().await;

        assert_eq!(report.expired, 1);
        assert!(!short.data_path(&expired.id).exists());
        assert!(short.data_path(&live.id).exists());
        assert!(short.load(&live.id).await.is_ok());
    }

    #[tokio::test]
    async fn test_orphans_respect_grace() {
        let dir = tempdir().unwrap();
        let uploads = dir.path().join("uploads");
        std::fs::create_dir_all(uploads.join("pdf-merge-work-abc")).unwrap();
        std::fs::write(uploads.join("pdf-merge_0123.pdf"), b"leftover").unwrap();
        let store = Arc::new(OutputStore::new(dir.path().join("out"), Duration::from_secs(60)).unwrap());
        let orphan = store.data_path(&crate::artifact::generate_token());
        std::fs::write(&orphan, b"no metadata").unwrap();

        let patient = CleanupSweeper::new(store.clone(), &uploads, Duration::from_secs(60), Duration::from_secs(3600), Metrics::new());
        assert_eq!(patient.sweep_once().await.removed(), 0);
        assert!(orphan.exists());

        let eager = CleanupSweeper::new(store.clone(), &uploads, Duration::from_secs(60), Duration::ZERO, Metrics::new());
        let report = eager.sweep_once().await;
        assert_eq!(report.orphaned_outputs, 1);
        assert_eq!(report.stale_uploads, 2);
        assert!(!orphan.exists());
        assert_eq!(std::fs::read_dir(&uploads).unwrap().count(), 0);
    }
}
