//! Processing request lifecycle
//!
//! `Received → Validated → Dispatched → Processing → {Completed | Failed}`.
//! Any state may move to `Failed`. Reaching a terminal state releases every
//! upload the request owns.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::artifact::{generate_token, OutputArtifact, UploadArtifact};
use crate::error::{PipelineError, Result};
use crate::registry::ToolDescriptor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    Received,
    Validated,
    Dispatched,
    Processing,
    Completed,
    Failed,
}

impl RequestState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestState::Completed | RequestState::Failed)
    }

    fn can_advance_to(&self, next: RequestState) -> bool {
        use RequestState::*;
        match (self, next) {
            (s, Failed) => !s.is_terminal(),
            (Received, Validated) => true,
            (Validated, Dispatched) => true,
            (Dispatched, Processing) => true,
            (Processing, Completed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RequestState::Received => "received",
            RequestState::Validated => "validated",
            RequestState::Dispatched => "dispatched",
            RequestState::Processing => "processing",
            RequestState::Completed => "completed",
            RequestState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// One submission of one tool. References exactly one descriptor.
#[derive(Debug)]
pub struct ProcessingRequest {
    pub id: String,
    pub tool: Arc<ToolDescriptor>,
    pub files: Vec<UploadArtifact>,
    pub options: Map<String, Value>,
    pub submitted_at: DateTime<Utc>,
    state: RequestState,
}

impl ProcessingRequest {
    pub fn new(tool: Arc<ToolDescriptor>) -> Self {
        Self {
            id: generate_token(),
            tool,
            files: Vec::new(),
            options: Map::new(),
            submitted_at: Utc::now(),
            state: RequestState::Received,
        }
    }

    pub fn tool_id(&self) -> &str {
        &self.tool.id
    }

    pub fn state(&self) -> RequestState {
        self.state
    }

    pub fn merge_options(&mut self, options: Map<String, Value>) {
        self.options.extend(options);
    }

    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }

    pub fn transition(&mut self, next: RequestState) -> Result<()> {
        if !self.state.can_advance_to(next) {
            return Err(PipelineError::processing(format!(
                "illegal request transition {} -> {}",
                self.state, next
            )));
        }
        debug!(request_id = %self.id, from = %self.state, to = %next, "request state change");
        self.state = next;
        Ok(())
    }

    /// Move to a terminal state and delete every upload. Idempotent.
    pub fn terminate(&mut self, state: RequestState) {
        debug_assert!(state.is_terminal());
        if !self.state.is_terminal() {
            self.state = state;
        }
        for file in &mut self.files {
            if let Err(e) = file.release() {
                warn!(request_id = %self.id, upload_id = %file.id, error = %e, "failed to delete upload");
            }
        }
    }
}

/// Outcome of one successful dispatch. Failures surface as [`PipelineError`].
#[derive(Debug, Clone, Serialize)]
pub struct ProcessingResult {
    pub request_id: String,
    pub tool_id: String,
    pub outputs: Vec<OutputArtifact>,
    /// Inline value for text and utility tools
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    pub elapsed_ms: u64,
}

impl ProcessingResult {
    pub fn primary_output(&self) -> Option<&OutputArtifact> {
        self.outputs.first()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::ScopedFile;
    use crate::config::LimitsConfig;
    use crate::registry::ToolRegistry;

    fn tool() -> Arc<ToolDescriptor> {
        ToolRegistry::builtin(&LimitsConfig::default())
            .unwrap()
            .resolve("pdf-compress")
            .unwrap()
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut request = ProcessingRequest::new(tool());
        for next in [
            RequestState::Validated,
            RequestState::Dispatched,
            RequestState::Processing,
            RequestState::Completed,
        ] {
            request.transition(next).unwrap();
        }
        assert!(request.state().is_terminal());
        assert!(request.transition(RequestState::Failed).is_err());
    }

    #[test]
    fn test_skipping_states_is_rejected() {
        let mut request = ProcessingRequest::new(tool());
        assert!(request.transition(RequestState::Processing).is_err());
        request.transition(RequestState::Failed).unwrap();
    }

    #[test]
    fn test_terminate_releases_uploads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pdf-compress_x.pdf");
        std::fs::write(&path, b"%PDF-1.4").unwrap();

        let mut request = ProcessingRequest::new(tool());
        request.files.push(UploadArtifact {
            id: "x".into(),
            original_filename: "a.pdf".into(),
            size: 8,
            mime: "application/pdf".into(),
            created_at: Utc::now(),
            file: ScopedFile::new(&path),
        });

        request.terminate(RequestState::Failed);
        assert!(!path.exists());
        assert_eq!(request.state(), RequestState::Failed);

        // A second termination is harmless and keeps the first terminal state
        request.terminate(RequestState::Completed);
        assert_eq!(request.state(), RequestState::Failed);
    }
}
