//! Metrics and observability for the processing pipeline

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::error::PipelineError;
use crate::registry::ToolCategory;

#[derive(Default)]
struct CategoryCounters {
    completed: AtomicU64,
    failed: AtomicU64,
}

/// Global metrics collector
#[derive(Default)]
pub struct Metrics {
    pub total_requests: AtomicU64,
    pub successful_requests: AtomicU64,
    pub failed_requests: AtomicU64,
    /// Turned away before processing (bad input or a full video queue)
    pub rejected_requests: AtomicU64,
    pub busy_rejections: AtomicU64,
    pub total_latency_ms: AtomicU64,
    pub bytes_received: AtomicU64,
    pub bytes_produced: AtomicU64,
    pub downloads: AtomicU64,
    pub swept_artifacts: AtomicU64,

    pdf: CategoryCounters,
    image: CategoryCounters,
    video: CategoryCounters,
    text: CategoryCounters,
    utility: CategoryCounters,
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn category(&self, category: ToolCategory) -> &CategoryCounters {
        match category {
            ToolCategory::Pdf => &self.pdf,
            ToolCategory::Image => &self.image,
            ToolCategory::Video => &self.video,
            ToolCategory::Text => &self.text,
            ToolCategory::Utility => &self.utility,
        }
    }

    pub fn record_request(&self, category: ToolCategory, outcome: Result<(), &PipelineError>, latency_ms: u64) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.total_latency_ms.fetch_add(latency_ms, Ordering::Relaxed);

        let counters = self.category(category);
        match outcome {
            Ok(()) => {
                self.successful_requests.fetch_add(1, Ordering::Relaxed);
                counters.completed.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                self.failed_requests.fetch_add(1, Ordering::Relaxed);
                counters.failed.fetch_add(1, Ordering::Relaxed);
                match err {
                    PipelineError::ResourceExhausted { .. } => {
                        self.rejected_requests.fetch_add(1, Ordering::Relaxed);
                        self.busy_rejections.fetch_add(1, Ordering::Relaxed);
                    }
                    PipelineError::InvalidInput(_) | PipelineError::NotFound(_) => {
                        self.rejected_requests.fetch_add(1, Ordering::Relaxed);
                    }
                    _ => {}
                }
            }
        }
    }

    pub fn record_bytes(&self, received: u64, produced: u64) {
        self.bytes_received.fetch_add(received, Ordering::Relaxed);
        self.bytes_produced.fetch_add(produced, Ordering::Relaxed);
    }

    pub fn record_download(&self) {
        self.downloads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sweep(&self, removed: u64) {
        self.swept_artifacts.fetch_add(removed, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let total = self.total_requests.load(Ordering::Relaxed);
        let failed = self.failed_requests.load(Ordering::Relaxed);
        let total_latency = self.total_latency_ms.load(Ordering::Relaxed);

        let category = |c: ToolCategory| {
            let counters = self.category(c);
            CategoryMetrics {
                category: c,
                completed: counters.completed.load(Ordering::Relaxed),
                failed: counters.failed.load(Ordering::Relaxed),
            }
        };

        MetricsSnapshot {
            total_requests: total,
            successful_requests: self.successful_requests.load(Ordering::Relaxed),
            failed_requests: failed,
            rejected_requests: self.rejected_requests.load(Ordering::Relaxed),
            busy_rejections: self.busy_rejections.load(Ordering::Relaxed),
            error_rate: if total > 0 { failed as f64 / total as f64 } else { 0.0 },
            avg_latency_ms: if total > 0 { total_latency / total } else { 0 },
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_produced: self.bytes_produced.load(Ordering::Relaxed),
            downloads: self.downloads.load(Ordering::Relaxed),
            swept_artifacts: self.swept_artifacts.load(Ordering::Relaxed),
            categories: ToolCategory::ALL.iter().copied().map(category).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub rejected_requests: u64,
    pub busy_rejections: u64,
    pub error_rate: f64,
    pub avg_latency_ms: u64,
    pub bytes_received: u64,
    pub bytes_produced: u64,
    pub downloads: u64,
    pub swept_artifacts: u64,
    pub categories: Vec<CategoryMetrics>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryMetrics {
    pub category: ToolCategory,
    pub completed: u64,
    pub failed: u64,
}

/// Timer for tracking operation latency
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn new() -> Self {
        Self { start: Instant::now() }
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_snapshot_counts() {
        let metrics = Metrics::new();
        metrics.record_request(ToolCategory::Pdf, Ok(()), 10);
        metrics.record_request(ToolCategory::Pdf, Err(&PipelineError::invalid("bad")), 30);
        metrics.record_request(
            ToolCategory::Video,
            Err(&PipelineError::ResourceExhausted {
                retry_after: Duration::from_secs(1),
            }),
            2,
        );

        let snap = metrics.snapshot();
        assert_eq!(snap.total_requests, 3);
        assert_eq!(snap.failed_requests, 2);
        assert_eq!(snap.rejected_requests, 2);
        assert_eq!(snap.busy_rejections, 1);
        assert_eq!(snap.avg_latency_ms, 14);

        let pdf = snap.categories.iter().find(|c| c.category == ToolCategory::Pdf).unwrap();
        assert_eq!((pdf.completed, pdf.failed), (1, 1));
        assert_eq!(snap.categories.len(), ToolCategory::ALL.len());
    }
}
