//! Request dispatch
//!
//! The dispatcher owns one handler per [`ToolCategory`] and drives a
//! [`ProcessingRequest`] through its lifecycle: option and file validation,
//! a private scratch directory, the handler call under a wall-clock timeout,
//! and hand-off of the produced files to the [`OutputStore`]. Whatever the
//! outcome, the request's uploads and scratch directory are gone when
//! [`Dispatcher::run`] returns.

use bytes::Bytes;
use futures::FutureExt;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::{PipelineError, Result};
use crate::handler::{HandlerOutput, JobInput, ProcessingJob, ToolHandler};
use crate::intake::UploadIntake;
use crate::metrics::{Metrics, Timer};
use crate::registry::{ToolCategory, ToolDescriptor, ToolRegistry};
use crate::request::{ProcessingRequest, ProcessingResult, RequestState};
use crate::store::{ArtifactSource, OutputStore};
use crate::validation;

pub struct Dispatcher {
    registry: Arc<ToolRegistry>,
    handlers: HashMap<ToolCategory, Arc<dyn ToolHandler>>,
    intake: UploadIntake,
    store: Arc<OutputStore>,
    metrics: Arc<Metrics>,
    processing_timeout: Duration,
}

impl Dispatcher {
    /// Wire handlers to the registry. Every registered tool must have a
    /// handler that supports its operation.
    pub fn new(
        registry: Arc<ToolRegistry>,
        handlers: Vec<Arc<dyn ToolHandler>>,
        intake: UploadIntake,
        store: Arc<OutputStore>,
        metrics: Arc<Metrics>,
        processing_timeout: Duration,
    ) -> Result<Self> {
        let mut by_category: HashMap<ToolCategory, Arc<dyn ToolHandler>> = HashMap::new();
        for handler in handlers {
            if by_category.insert(handler.category(), handler.clone()).is_some() {
                return Err(PipelineError::Config(format!(
                    "more than one handler registered for {}",
                    handler.category()
                )));
            }
        }

        for tool in registry.iter() {
            let supported = by_category
                .get(&tool.category())
                .is_some_and(|h| h.supports(&tool.operation));
            if !supported {
                return Err(PipelineError::Config(format!("no handler supports tool '{}'", tool.id)));
            }
        }

        Ok(Self {
            registry,
            handlers: by_category,
            intake,
            store,
            metrics,
            processing_timeout,
        })
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn intake(&self) -> &UploadIntake {
        &self.intake
    }

    pub fn store(&self) -> &Arc<OutputStore> {
        &self.store
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    fn handler_for(&self, tool: &ToolDescriptor) -> Result<&Arc<dyn ToolHandler>> {
        self.handlers
            .get(&tool.category())
            .ok_or_else(|| PipelineError::Config(format!("no handler for category {}", tool.category())))
    }

    /// Start a request for `tool_id`. Unknown tools are `NotFound`.
    pub fn begin(&self, tool_id: &str) -> Result<ProcessingRequest> {
        let tool = self.registry.resolve(tool_id)?;
        Ok(ProcessingRequest::new(tool))
    }

    /// Resolve, receive in-memory files and run in one call.
    pub async fn dispatch(
        &self,
        tool_id: &str,
        files: Vec<(String, Bytes)>,
        options: Map<String, Value>,
    ) -> Result<ProcessingResult> {
        let mut request = self.begin(tool_id)?;
        for (filename, data) in files {
            if let Err(e) = self.intake.receive_bytes(&mut request, &filename, data).await {
                return Err(self.reject(request, e));
            }
        }
        request.merge_options(options);
        self.run(request).await
    }

    /// Fail a request that never reached [`run`](Self::run), e.g. on an intake error.
    pub fn reject(&self, mut request: ProcessingRequest, err: PipelineError) -> PipelineError {
        request.terminate(RequestState::Failed);
        let err = err.normalize();
        self.metrics.record_request(request.tool.category(), Err(&err), 0);
        warn!(request_id = %request.id, tool_id = %request.tool_id(), kind = err.kind(), error = %err, "request rejected");
        err
    }

    /// Drive `request` to a terminal state.
    ///
    /// Errors come back normalized: callers only ever see `InvalidInput`,
    /// `NotFound`, `ProcessingError` or `ResourceExhausted`.
    pub async fn run(&self, mut request: ProcessingRequest) -> Result<ProcessingResult> {
        let timer = Timer::new();
        let category = request.tool.category();
        let received = request.total_bytes();

        let outcome = self.execute(&mut request, &timer).await;
        let terminal = if outcome.is_ok() {
            RequestState::Completed
        } else {
            RequestState::Failed
        };
        request.terminate(terminal);
        let elapsed_ms = timer.elapsed_ms();

        match outcome {
            Ok(result) => {
                let produced = result.outputs.iter().map(|o| o.size).sum();
                self.metrics.record_request(category, Ok(()), elapsed_ms);
                self.metrics.record_bytes(received, produced);
                info!(
                    request_id = %request.id,
                    tool_id = %request.tool_id(),
                    outputs = result.outputs.len(),
                    elapsed_ms,
                    "✅ Request completed"
                );
                Ok(result)
            }
            Err(err) => {
                match &err {
                    PipelineError::InvalidInput(_) | PipelineError::NotFound(_) | PipelineError::ResourceExhausted { .. } => {
                        warn!(request_id = %request.id, tool_id = %request.tool_id(), kind = err.kind(), error = %err, "request refused");
                    }
                    _ => {
                        error!(request_id = %request.id, tool_id = %request.tool_id(), error = %err, elapsed_ms, "❌ Request failed");
                    }
                }
                let err = err.normalize();
                self.metrics.record_request(category, Err(&err), elapsed_ms);
                Err(err)
            }
        }
    }

    async fn execute(&self, request: &mut ProcessingRequest, timer: &Timer) -> Result<ProcessingResult> {
        let tool = request.tool.clone();
        let handler = self.handler_for(&tool)?.clone();

        let options = validation::normalize_options(&request.options, &tool.options_schema)?;
        validation::validate_files(&tool, &request.files, self.intake.max_request_size())?;
        handler.validate(&tool, &options)?;
        request.options = options;
        request.transition(RequestState::Validated)?;

        // Removed when dropped at the end of this call, whatever the outcome
        let work_dir = tempfile::Builder::new()
            .prefix(&format!("{}-work-", tool.id))
            .tempdir_in(self.intake.root())?;
        request.transition(RequestState::Dispatched)?;

        let job = ProcessingJob {
            request_id: request.id.clone(),
            tool: tool.clone(),
            inputs: request
                .files
                .iter()
                .map(|f| JobInput {
                    path: f.path().to_path_buf(),
                    original_filename: f.original_filename.clone(),
                    extension: f.extension().unwrap_or_default(),
                })
                .collect(),
            options: request.options.clone(),
            work_dir: work_dir.path().to_path_buf(),
            cancel: CancellationToken::new(),
        };
        request.transition(RequestState::Processing)?;

        let output = self.process_bounded(handler.as_ref(), &job).await?;
        if output.files.is_empty() {
            return Err(PipelineError::processing(format!("{} produced no output", tool.id)));
        }

        let mut outputs = Vec::with_capacity(output.files.len());
        for file in &output.files {
            match self.store.store(ArtifactSource::Path(&file.path), &file.display_name).await {
                Ok(artifact) => outputs.push(artifact),
                Err(e) => {
                    for stored in &outputs {
                        let _ = self.store.remove(&stored.id).await;
                    }
                    return Err(e);
                }
            }
        }

        Ok(ProcessingResult {
            request_id: request.id.clone(),
            tool_id: tool.id.clone(),
            outputs,
            result: output.result,
            elapsed_ms: timer.elapsed_ms(),
        })
    }

    /// Handler call under the processing timeout. Panics become `ProcessingError`.
    async fn process_bounded(&self, handler: &dyn ToolHandler, job: &ProcessingJob) -> Result<HandlerOutput> {
        let call = AssertUnwindSafe(handler.process(job)).catch_unwind();
        match tokio::time::timeout(self.processing_timeout, call).await {
            Ok(Ok(result)) => result,
            Ok(Err(_panic)) => Err(PipelineError::processing(format!("handler for {} panicked", job.tool.id))),
            Err(_) => {
                job.cancel.cancel();
                Err(PipelineError::processing(format!(
                    "{} timed out after {}s",
                    job.tool.id,
                    self.processing_timeout.as_secs()
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LimitsConfig;
    use crate::registry::Operation;
    use async_trait::async_trait;
    use serde_json::json;

    struct SlowText;

    #[async_trait]
    impl ToolHandler for SlowText {
        fn category(&self) -> ToolCategory {
            ToolCategory::Text
        }

        async fn process(&self, job: &ProcessingJob) -> Result<HandlerOutput> {
            job.cancel.cancelled().await;
            Err(PipelineError::processing("cancelled"))
        }
    }

    struct Panicking;

    #[async_trait]
    impl ToolHandler for Panicking {
        fn category(&self) -> ToolCategory {
            ToolCategory::Utility
        }

        async fn process(&self, _job: &ProcessingJob) -> Result<HandlerOutput> {
            panic!("boom")
        }
    }

    struct Echo(ToolCategory);

    #[async_trait]
    impl ToolHandler for Echo {
        fn category(&self) -> ToolCategory {
            self.0
        }

        fn supports(&self, operation: &Operation) -> bool {
            operation.category() == self.0
        }

        async fn process(&self, job: &ProcessingJob) -> Result<HandlerOutput> {
            let out = job.output_path("echo.txt");
            std::fs::write(&out, job.tool.id.as_bytes())?;
            Ok(HandlerOutput::file(out, "echo.txt"))
        }
    }

    fn dispatcher(dir: &std::path::Path, handlers: Vec<Arc<dyn ToolHandler>>, timeout: Duration) -> Result<Dispatcher> {
        let registry = Arc::new(ToolRegistry::builtin(&LimitsConfig::default()).unwrap());
        let intake = UploadIntake::new(dir.join("uploads"), 1 << 20).unwrap();
        let store = Arc::new(OutputStore::new(dir.join("outputs"), Duration::from_secs(60)).unwrap());
        Dispatcher::new(registry, handlers, intake, store, Metrics::new(), timeout)
    }

    fn all_echo() -> Vec<Arc<dyn ToolHandler>> {
        ToolCategory::ALL
            .iter()
            .map(|c| Arc::new(Echo(*c)) as Arc<dyn ToolHandler>)
            .collect()
    }

    #[test]
    fn test_missing_handler_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = dispatcher(dir.path(), vec![Arc::new(Echo(ToolCategory::Pdf))], Duration::from_secs(5))
            .err()
            .unwrap();
        assert!(matches!(err, PipelineError::Config(_)));
    }

    #[tokio::test]
    async fn test_unknown_tool() {
        let dir = tempfile::tempdir().unwrap();
        let d = dispatcher(dir.path(), all_echo(), Duration::from_secs(5)).unwrap();
        let err = d.dispatch("no-such-tool", vec![], Map::new()).await.unwrap_err();
        assert!(matches!(err, PipelineError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_missing_option_has_no_side_effects() {
        let dir = tempfile::tempdir().unwrap();
        let d = dispatcher(dir.path(), all_echo(), Duration::from_secs(5)).unwrap();
        let err = d.dispatch("text-case-converter", vec![], Map::new()).await.unwrap_err();
        assert!(matches!(err, PipelineError::InvalidInput(_)));
        assert_eq!(std::fs::read_dir(dir.path().join("outputs")).unwrap().count(), 0);
        assert_eq!(std::fs::read_dir(dir.path().join("uploads")).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_success_stores_output_and_clears_uploads() {
        let dir = tempfile::tempdir().unwrap();
        let d = dispatcher(dir.path(), all_echo(), Duration::from_secs(5)).unwrap();
        let result = d
            .dispatch("image-rotate", vec![("pic.png".into(), Bytes::from_static(b"not really a png"))], Map::new())
            .await
            .unwrap();

        assert_eq!(result.outputs.len(), 1);
        assert_eq!(std::fs::read(result.outputs[0].stored_path()).unwrap(), b"image-rotate");
        assert_eq!(std::fs::read_dir(dir.path().join("uploads")).unwrap().count(), 0);
        assert_eq!(d.metrics().snapshot().successful_requests, 1);
    }

    #[tokio::test]
    async fn test_timeout_cancels_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let mut handlers = all_echo();
        handlers.retain(|h| h.category() != ToolCategory::Text);
        handlers.push(Arc::new(SlowText));
        let d = dispatcher(dir.path(), handlers, Duration::from_millis(50)).unwrap();

        let options = json!({ "text": "hi" }).as_object().cloned().unwrap();
        let err = d.dispatch("text-case-converter", vec![], options).await.unwrap_err();
        assert!(matches!(err, PipelineError::ProcessingError(_)));
        assert_eq!(std::fs::read_dir(dir.path().join("uploads")).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_panic_is_contained() {
        let dir = tempfile::tempdir().unwrap();
        let mut handlers = all_echo();
        handlers.retain(|h| h.category() != ToolCategory::Utility);
        handlers.push(Arc::new(Panicking));
        let d = dispatcher(dir.path(), handlers, Duration::from_secs(5)).unwrap();

        let err = d.dispatch("password-generator", vec![], Map::new()).await.unwrap_err();
        assert!(matches!(err, PipelineError::ProcessingError(_)));
        assert_eq!(d.metrics().snapshot().failed_requests, 1);
    }
}
