//! HTTP surface
//!
//! - `POST /api/tools/{tool_id}`: multipart upload. `file`/`files` parts carry
//!   inputs, an `options` part may hold a JSON object, and any other text part
//!   becomes a string option.
//! - `GET /api/download/{id}`: stream a stored artifact
//! - `GET /api/tools`, `GET /health`, `GET /api/metrics`

use axum::body::Body;
use axum::extract::{DefaultBodyLimit, Multipart, Path, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::io::ReaderStream;
use tower_http::trace::TraceLayer;
use tracing::debug;

use crate::artifact::{sanitize_filename, OutputArtifact};
use crate::config::Config;
use crate::dispatcher::Dispatcher;
use crate::error::PipelineError;
use crate::gateway::DownloadGateway;
use crate::handler::ToolHandler;
use crate::image::ImageHandler;
use crate::intake::UploadIntake;
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::pdf::PdfHandler;
use crate::pool::WorkerPool;
use crate::registry::{ToolCard, ToolRegistry};
use crate::request::ProcessingResult;
use crate::store::OutputStore;
use crate::sweeper::CleanupSweeper;
use crate::text::TextHandler;
use crate::utility::UtilityHandler;
use crate::video::MediaHandler;

/// Multipart framing and option parts on top of the file payload
pub const BODY_OVERHEAD: u64 = 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub gateway: Arc<DownloadGateway>,
    pub video_pool: Arc<WorkerPool>,
    pub started: Instant,
}

impl AppState {
    /// Build every pipeline component from configuration.
    ///
    /// Returns the shared state plus the sweeper, which the caller spawns.
    pub fn from_config(config: &Config) -> Result<(Self, Arc<CleanupSweeper>), PipelineError> {
        let metrics = Metrics::new();
        let registry = Arc::new(ToolRegistry::builtin(&config.limits)?);
        let intake = UploadIntake::new(&config.storage.upload_dir, config.limits.max_request_size)?;
        let store = Arc::new(OutputStore::new(&config.storage.output_dir, config.storage.output_ttl)?);
        let video_pool = Arc::new(WorkerPool::new(
            config.video.worker_count(),
            config.video.queue_limit,
            config.video.queue_timeout,
        ));

        let handlers: Vec<Arc<dyn ToolHandler>> = vec![
            Arc::new(PdfHandler::new(&config.pdf.qpdf_path, config.subprocess_timeout)),
            Arc::new(ImageHandler::new()),
            Arc::new(MediaHandler::new(
                &config.video.ffmpeg_path,
                &config.video.ffprobe_path,
                config.subprocess_timeout,
                video_pool.clone(),
            )),
            Arc::new(TextHandler),
            Arc::new(UtilityHandler),
        ];

        let sweeper = Arc::new(CleanupSweeper::new(
            store.clone(),
            intake.root(),
            config.storage.sweep_interval,
            config.storage.orphan_grace,
            metrics.clone(),
        ));
        let gateway = Arc::new(DownloadGateway::new(store.clone(), metrics.clone()));
        let dispatcher = Arc::new(Dispatcher::new(
            registry,
            handlers,
            intake,
            store,
            metrics,
            config.processing_timeout,
        )?);

        Ok((
            Self {
                dispatcher,
                gateway,
                video_pool,
                started: Instant::now(),
            },
            sweeper,
        ))
    }
}

impl IntoResponse for PipelineError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        debug!(status = status.as_u16(), kind = self.kind(), "error response");

        let body = Json(json!({
            "success": false,
            "error": self.user_message(),
            "kind": self.kind(),
        }));
        let mut response = (status, body).into_response();
        if let PipelineError::ResourceExhausted { retry_after } = &self {
            if let Ok(value) = HeaderValue::from_str(&retry_after.as_secs().max(1).to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

#[derive(Debug, Serialize)]
pub struct FileEntry {
    pub download_id: String,
    pub filename: String,
    pub size: u64,
    pub mime: String,
    pub download_url: String,
    pub expires_at: DateTime<Utc>,
}

impl From<&OutputArtifact> for FileEntry {
    fn from(artifact: &OutputArtifact) -> Self {
        Self {
            download_id: artifact.id.clone(),
            filename: artifact.display_name.clone(),
            size: artifact.size,
            mime: artifact.mime.clone(),
            download_url: download_url(&artifact.id),
            expires_at: artifact.expires_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ToolResponse {
    pub success: bool,
    pub request_id: String,
    pub tool_id: String,
    pub download_id: Option<String>,
    pub download_url: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub files: Vec<FileEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    pub elapsed_ms: u64,
}

impl From<ProcessingResult> for ToolResponse {
    fn from(result: ProcessingResult) -> Self {
        let primary = result.primary_output();
        Self {
            success: true,
            download_id: primary.map(|a| a.id.clone()),
            download_url: primary.map(|a| download_url(&a.id)),
            expires_at: primary.map(|a| a.expires_at),
            files: result.outputs.iter().map(FileEntry::from).collect(),
            request_id: result.request_id,
            tool_id: result.tool_id,
            result: result.result,
            elapsed_ms: result.elapsed_ms,
        }
    }
}

fn download_url(id: &str) -> String {
    format!("/api/download/{}", id)
}

pub fn router(state: AppState, max_request_size: u64) -> Router {
    let body_limit = usize::try_from(max_request_size.saturating_add(BODY_OVERHEAD)).unwrap_or(usize::MAX);
    Router::new()
        .route("/api/tools", get(list_tools))
        .route("/api/tools/{tool_id}", post(run_tool))
        .route("/api/download/{id}", get(download))
        .route("/api/metrics", get(metrics))
        .route("/health", get(health))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn list_tools(State(state): State<AppState>) -> Json<Vec<ToolCard>> {
    Json(state.dispatcher.registry().describe())
}

fn is_file_part(name: &str) -> bool {
    matches!(name, "file" | "files" | "files[]")
}

async fn run_tool(
    State(state): State<AppState>,
    Path(tool_id): Path<String>,
    mut multipart: Multipart,
) -> Result<Json<ToolResponse>, PipelineError> {
    let dispatcher = &state.dispatcher;
    let mut request = dispatcher.begin(&tool_id)?;
    let mut json_options = Map::new();
    let mut form_options = Map::new();

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => {
                let err = PipelineError::invalid(format!("Failed to parse multipart data: {}", e));
                return Err(dispatcher.reject(request, err));
            }
        };
        let name = field.name().unwrap_or_default().to_string();
        let filename = field.file_name().map(str::to_string);

        if is_file_part(&name) {
            // browsers send an empty part for an untouched file input
            let Some(filename) = filename.filter(|f| !f.is_empty()) else {
                continue;
            };
            if let Err(e) = dispatcher.intake().receive(&mut request, &filename, field).await {
                return Err(dispatcher.reject(request, e));
            }
            continue;
        }

        let text = match field.text().await {
            Ok(text) => text,
            Err(e) => {
                let err = PipelineError::invalid(format!("Failed to read field '{}': {}", name, e));
                return Err(dispatcher.reject(request, err));
            }
        };
        if name == "options" {
            if text.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Value>(&text) {
                Ok(Value::Object(map)) => json_options.extend(map),
                _ => {
                    let err = PipelineError::invalid("options must be a JSON object");
                    return Err(dispatcher.reject(request, err));
                }
            }
        } else if !name.is_empty() {
            form_options.insert(name, Value::String(text));
        }
    }

    // Individual form fields win over the JSON blob
    request.merge_options(json_options);
    request.merge_options(form_options);
    let result = dispatcher.run(request).await?;
    Ok(Json(ToolResponse::from(result)))
}

async fn download(State(state): State<AppState>, Path(id): Path<String>) -> Result<Response, PipelineError> {
    let download = state.gateway.open(&id).await?;
    let disposition = format!(
        "attachment; filename=\"{}\"",
        sanitize_filename(&download.artifact.display_name)
    );

    let body = Body::from_stream(ReaderStream::new(download.file));
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, download.artifact.mime.as_str())
        .header(header::CONTENT_LENGTH, download.len)
        .header(header::CONTENT_DISPOSITION, disposition)
        .header(header::CACHE_CONTROL, "private, no-store")
        .body(body)
        .map_err(|e| PipelineError::processing(format!("failed to build download response: {}", e)))
}

async fn metrics(State(state): State<AppState>) -> Json<MetricsSnapshot> {
    Json(state.dispatcher.metrics().snapshot())
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    let pool = &state.video_pool;
    Json(json!({
        "status": "ok",
        "uptime_secs": state.started.elapsed().as_secs(),
        "tools": state.dispatcher.registry().len(),
        "video_workers": {
            "capacity": pool.capacity(),
            "running": pool.running(),
            "waiting": pool.waiting(),
        },
    }))
}
