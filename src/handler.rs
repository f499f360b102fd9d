//! Shared capability interface for category handlers
//!
//! Each [`ToolCategory`] has one handler. The dispatcher hands it a
//! [`ProcessingJob`] holding validated options, the request's input paths and
//! a private scratch directory; the handler writes its outputs into that
//! directory and returns them as [`ProducedFile`]s.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::error::{PipelineError, Result};
use crate::registry::{Operation, ToolCategory, ToolDescriptor};

#[derive(Debug, Clone)]
pub struct JobInput {
    pub path: PathBuf,
    /// Sanitized client filename, used to derive output names
    pub original_filename: String,
    pub extension: String,
}

/// Everything a handler needs to run one request.
#[derive(Debug, Clone)]
pub struct ProcessingJob {
    pub request_id: String,
    pub tool: Arc<ToolDescriptor>,
    pub inputs: Vec<JobInput>,
    pub options: Map<String, Value>,
    pub work_dir: PathBuf,
    pub cancel: CancellationToken,
}

impl ProcessingJob {
    pub fn operation(&self) -> Operation {
        self.tool.operation
    }

    /// The single input of a one-file tool.
    pub fn input(&self) -> Result<&JobInput> {
        self.inputs
            .first()
            .ok_or_else(|| PipelineError::invalid(format!("{} requires an input file", self.tool.display_name)))
    }

    /// Path for an output inside the scratch directory.
    pub fn output_path(&self, file_name: &str) -> PathBuf {
        self.work_dir.join(file_name)
    }

    pub fn str_opt(&self, key: &str) -> Option<&str> {
        self.options.get(key).and_then(Value::as_str)
    }

    pub fn str_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.str_opt(key).unwrap_or(default)
    }

    pub fn require_str(&self, key: &str) -> Result<&str> {
        self.str_opt(key)
            .ok_or_else(|| PipelineError::invalid(format!("Missing required option: {}", key)))
    }

    pub fn u64_opt(&self, key: &str) -> Option<u64> {
        self.options.get(key).and_then(Value::as_u64)
    }

    pub fn u64_or(&self, key: &str, default: u64) -> u64 {
        self.u64_opt(key).unwrap_or(default)
    }

    pub fn f64_opt(&self, key: &str) -> Option<f64> {
        self.options.get(key).and_then(Value::as_f64)
    }

    pub fn f64_or(&self, key: &str, default: f64) -> f64 {
        self.f64_opt(key).unwrap_or(default)
    }

    pub fn bool_or(&self, key: &str, default: bool) -> bool {
        self.options.get(key).and_then(Value::as_bool).unwrap_or(default)
    }
}

#[derive(Debug, Clone)]
pub struct ProducedFile {
    pub path: PathBuf,
    pub display_name: String,
}

impl ProducedFile {
    pub fn new(path: impl Into<PathBuf>, display_name: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            display_name: display_name.into(),
        }
    }
}

#[derive(Debug, Default)]
pub struct HandlerOutput {
    pub files: Vec<ProducedFile>,
    /// Inline value returned alongside the download (text and utility tools)
    pub result: Option<Value>,
}

impl HandlerOutput {
    pub fn file(path: impl Into<PathBuf>, display_name: impl Into<String>) -> Self {
        Self {
            files: vec![ProducedFile::new(path, display_name)],
            result: None,
        }
    }

    pub fn with_result(mut self, result: Value) -> Self {
        self.result = Some(result);
        self
    }
}

#[async_trait]
pub trait ToolHandler: Send + Sync {
    fn category(&self) -> ToolCategory;

    /// Whether this handler can run `operation`. Checked for every tool at startup.
    fn supports(&self, operation: &Operation) -> bool {
        operation.category() == self.category()
    }

    /// Cross-field option checks beyond the schema. Runs before anything is dispatched.
    fn validate(&self, _tool: &ToolDescriptor, _options: &Map<String, Value>) -> Result<()> {
        Ok(())
    }

    async fn process(&self, job: &ProcessingJob) -> Result<HandlerOutput>;
}

/// Run CPU-bound work off the async executor.
pub async fn run_blocking<T, F>(task: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .map_err(|e| PipelineError::processing(format!("worker task failed: {}", e)))?
}

/// `prefix` + stem of `original` + `.ext`
pub fn output_name(prefix: &str, original: &str, ext: &str) -> String {
    format!("{}{}.{}", prefix, crate::artifact::stem_of(original), ext)
}

pub fn ensure_exists(path: &Path) -> Result<()> {
    match std::fs::metadata(path) {
        Ok(meta) if meta.len() > 0 => Ok(()),
        _ => Err(PipelineError::processing(format!(
            "expected output {} was not produced",
            path.display()
        ))),
    }
}
