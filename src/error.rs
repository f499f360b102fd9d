use std::time::Duration;
use thiserror::Error;

use crate::subprocess::CommandError;

/// Pipeline error taxonomy.
///
/// `InvalidInput`, `NotFound`, `ProcessingError` and `ResourceExhausted` are the
/// variants callers see. `Io` and `Command` carry internal detail and are folded
/// into `ProcessingError` by [`PipelineError::normalize`] at the dispatcher
/// boundary.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Processing failed: {0}")]
    ProcessingError(String),

    #[error("Resource exhausted, retry after {}s", retry_after.as_secs())]
    ResourceExhausted { retry_after: Duration },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Command error: {0}")]
    Command(#[from] CommandError),
}

impl PipelineError {
    pub fn invalid(message: impl Into<String>) -> Self {
        PipelineError::InvalidInput(message.into())
    }

    pub fn processing(detail: impl Into<String>) -> Self {
        PipelineError::ProcessingError(detail.into())
    }

    /// Fold plumbing variants into the caller-facing taxonomy.
    pub fn normalize(self) -> Self {
        match self {
            PipelineError::Io(e) => PipelineError::ProcessingError(format!("io: {}", e)),
            PipelineError::Command(e) => PipelineError::ProcessingError(e.to_string()),
            PipelineError::Config(msg) => PipelineError::ProcessingError(format!("config: {}", msg)),
            other => other,
        }
    }

    /// Short machine-readable kind, used in responses and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::InvalidInput(_) => "InvalidInput",
            PipelineError::NotFound(_) => "NotFound",
            PipelineError::ResourceExhausted { .. } => "ResourceExhausted",
            PipelineError::ProcessingError(_)
            | PipelineError::Config(_)
            | PipelineError::Io(_)
            | PipelineError::Command(_) => "ProcessingError",
        }
    }

    /// HTTP status code for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            PipelineError::InvalidInput(_) => 400,
            PipelineError::NotFound(_) => 404,
            PipelineError::ResourceExhausted { .. } => 503,
            _ => 500,
        }
    }

    /// Returns a user-safe message. Processing failures never expose internal detail.
    pub fn user_message(&self) -> String {
        match self {
            PipelineError::InvalidInput(msg) => msg.clone(),
            PipelineError::NotFound(what) => format!("{} not found", what),
            PipelineError::ResourceExhausted { retry_after } => format!(
                "Server is busy processing other jobs, please retry in {} seconds",
                retry_after.as_secs().max(1)
            ),
            _ => "Processing failed. Please check your file and try again.".to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
