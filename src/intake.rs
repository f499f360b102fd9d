//! Upload intake
//!
//! Streams file data straight to disk under `<tool-id>_<token>.<ext>` names in
//! the upload root. Count and extension are checked before the file is
//! created; size limits are enforced chunk by chunk, so an oversize or
//! interrupted upload never lands completely on disk and its partial file is
//! removed by the owning [`ScopedFile`].

use bytes::Bytes;
use chrono::Utc;
use futures::{Stream, StreamExt};
use std::convert::Infallible;
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::artifact::{detect_mime, generate_token, sanitize_filename, ScopedFile, UploadArtifact};
use crate::error::{PipelineError, Result};
use crate::request::{ProcessingRequest, RequestState};
use crate::validation;

#[derive(Debug, Clone)]
pub struct UploadIntake {
    root: PathBuf,
    max_request_size: u64,
}

impl UploadIntake {
    pub fn new(root: impl Into<PathBuf>, max_request_size: u64) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root, max_request_size })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn max_request_size(&self) -> u64 {
        self.max_request_size
    }

    /// Persist one streamed file into `request`.
    ///
    /// On any error the partial file is gone by the time this returns and the
    /// request is unchanged.
    pub async fn receive<S, E>(&self, request: &mut ProcessingRequest, filename: &str, stream: S) -> Result<()>
    where
        S: Stream<Item = std::result::Result<Bytes, E>>,
        E: fmt::Display,
    {
        if request.state() != RequestState::Received {
            return Err(PipelineError::processing(format!(
                "cannot accept uploads in state {}",
                request.state()
            )));
        }

        let display_name = sanitize_filename(filename);
        let ext = validation::check_incoming(&request.tool, request.files.len(), &display_name)?;

        let id = generate_token();
        let path = self.root.join(format!("{}_{}.{}", request.tool.id, id, ext));

        let guard = ScopedFile::new(&path);
        let mut file = OpenOptions::new().write(true).create_new(true).open(&path).await?;

        let already = request.total_bytes();
        let mut size = 0u64;
        let mut stream = std::pin::pin!(stream);

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| {
                warn!(request_id = %request.id, filename = %display_name, error = %e, "upload stream aborted");
                PipelineError::invalid("Upload was interrupted before it completed")
            })?;

            size += chunk.len() as u64;
            validation::check_file_size(&request.tool, size)?;
            if already + size > self.max_request_size {
                return Err(PipelineError::invalid("Combined upload size exceeds the request limit"));
            }
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        drop(file);

        if size == 0 {
            return Err(PipelineError::invalid(format!("File '{}' is empty", display_name)));
        }

        let mime = detect_mime(&path, Some(&ext));
        debug!(request_id = %request.id, upload_id = %id, mime = %mime, "upload sniffed");
        info!(
            request_id = %request.id,
            tool_id = %request.tool.id,
            filename = %display_name,
            size,
            "📥 Upload received"
        );

        request.files.push(UploadArtifact {
            id,
            original_filename: display_name,
            size,
            mime,
            created_at: Utc::now(),
            file: guard,
        });
        Ok(())
    }

    /// Convenience for in-memory payloads.
    pub async fn receive_bytes(
        &self,
        request: &mut ProcessingRequest,
        filename: &str,
        data: impl Into<Bytes>,
    ) -> Result<()> {
        let data = data.into();
        let stream = futures::stream::once(async move { Ok::<_, Infallible>(data) });
        self.receive(request, filename, stream).await
    }
}
