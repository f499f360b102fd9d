//! Video/audio processing via FFmpeg
//!
//! Every job first takes a slot in the shared [`WorkerPool`], then probes its
//! input with `ffprobe` and runs one `ffmpeg` invocation. Both processes are
//! bounded by the subprocess timeout and killed if the job's cancellation
//! token fires. Transcoder diagnostics stay in the logs.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::audio::AudioFormat;
use crate::error::{PipelineError, Result};
use crate::handler::{ensure_exists, output_name, HandlerOutput, ProcessingJob, ToolHandler};
use crate::pool::WorkerPool;
use crate::registry::{MediaOperation, Operation, ToolCategory};
use crate::subprocess::ExternalCommand;

/// Centered 9:16 window, even dimensions, never larger than the source
const VERTICAL_CROP: &str = "crop=w='min(iw,trunc(ih*9/16/2)*2)':h='min(ih,trunc(iw*16/9/2)*2)'";

/// What `ffprobe` reports about an input.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MediaProbe {
    pub duration: Option<f64>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub has_video: bool,
    pub has_audio: bool,
    pub format_name: Option<String>,
}

impl MediaProbe {
    /// Parse `ffprobe -print_format json -show_format -show_streams` output.
    pub fn from_json(parsed: &Value) -> Self {
        let format = parsed.get("format").and_then(|f| f.as_object());
        let streams = parsed.get("streams").and_then(|s| s.as_array());

        let stream_of = |kind: &str| {
            streams.and_then(|s| {
                s.iter()
                    .find(|st| st.get("codec_type").and_then(|t| t.as_str()) == Some(kind))
            })
        };
        let video_stream = stream_of("video");
        let audio_stream = stream_of("audio");

        let duration = format
            .and_then(|f| f.get("duration"))
            .and_then(|d| d.as_str())
            .and_then(|s| s.parse::<f64>().ok())
            .or_else(|| {
                video_stream
                    .and_then(|v| v.get("duration"))
                    .and_then(|d| d.as_str())
                    .and_then(|s| s.parse::<f64>().ok())
            });

        let dimension = |key: &str| {
            video_stream
                .and_then(|v| v.get(key))
                .and_then(|x| x.as_u64())
                .map(|x| x as u32)
        };

        MediaProbe {
            duration,
            width: dimension("width"),
            height: dimension("height"),
            has_video: video_stream.is_some(),
            has_audio: audio_stream.is_some(),
            format_name: format
                .and_then(|f| f.get("format_name"))
                .and_then(|v| v.as_str())
                .map(str::to_string),
        }
    }
}

pub async fn probe_media(ffprobe: &Path, input: &Path, timeout: Duration, cancel: &CancellationToken) -> Result<MediaProbe> {
    let output = ExternalCommand::new(ffprobe, timeout)
        .args(&["-v", "error", "-print_format", "json", "-show_format", "-show_streams"])
        .arg(input)
        .execute(cancel)
        .await?;

    let parsed: Value = serde_json::from_slice(&output.stdout)
        .map_err(|e| PipelineError::processing(format!("ffprobe JSON parse error: {}", e)))?;
    Ok(MediaProbe::from_json(&parsed))
}

/// Container-specific encoder arguments for format conversion.
fn container_args(format: &str) -> Result<&'static [&'static str]> {
    Ok(match format {
        "mp4" | "mov" | "mkv" => &[
            "-c:v", "libx264", "-preset", "medium", "-crf", "23", "-pix_fmt", "yuv420p", "-c:a", "aac", "-b:a", "128k",
        ],
        "webm" => &["-c:v", "libvpx-vp9", "-crf", "32", "-b:v", "0", "-c:a", "libopus", "-b:a", "128k"],
        "avi" => &["-c:v", "mpeg4", "-q:v", "5", "-c:a", "libmp3lame", "-b:a", "192k"],
        other => return Err(PipelineError::invalid(format!("Unsupported video format '{}'", other))),
    })
}

fn seconds(value: f64) -> String {
    format!("{:.3}", value)
}

pub struct MediaHandler {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
    timeout: Duration,
    pool: Arc<WorkerPool>,
}

impl MediaHandler {
    pub fn new(ffmpeg: impl Into<PathBuf>, ffprobe: impl Into<PathBuf>, timeout: Duration, pool: Arc<WorkerPool>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            ffprobe: ffprobe.into(),
            timeout,
            pool,
        }
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    fn ffmpeg(&self) -> ExternalCommand {
        ExternalCommand::new(&self.ffmpeg, self.timeout).args(&["-hide_banner", "-nostdin", "-y", "-loglevel", "error"])
    }

    async fn probe(&self, path: &Path, cancel: &CancellationToken) -> Result<MediaProbe> {
        probe_media(&self.ffprobe, path, self.timeout, cancel).await
    }

    async fn trim(&self, job: &ProcessingJob, probe: &MediaProbe) -> Result<HandlerOutput> {
        let input = job.input()?;
        let start = job.f64_or("start", 0.0);
        let mut duration = job.f64_opt("duration").ok_or_else(|| PipelineError::invalid("Missing required option: duration"))?;

        if let Some(total) = probe.duration {
            if start >= total {
                return Err(PipelineError::invalid(format!(
                    "Start time {:.1}s is beyond the end of the video ({:.1}s)",
                    start, total
                )));
            }
            duration = duration.min(total - start);
        }

        let precise = job.bool_or("precise", true);
        let ext = if precise { "mp4" } else { input.extension.as_str() };
        let name = output_name("trimmed_", &input.original_filename, ext);
        let out = job.output_path(&name);

        // -ss before -i seeks the input; with re-encoding the cut is frame accurate
        let mut cmd = self
            .ffmpeg()
            .arg("-ss")
            .arg(seconds(start))
            .input(&input.path)
            .arg("-t")
            .arg(seconds(duration));
        cmd = if precise {
            cmd.args(&[
                "-c:v", "libx264", "-preset", "veryfast", "-crf", "20", "-pix_fmt", "yuv420p", "-c:a", "aac", "-b:a",
                "128k", "-movflags", "+faststart",
            ])
        } else {
            cmd.args(&["-c", "copy", "-avoid_negative_ts", "make_zero"])
        };
        cmd.output(&out).execute(&job.cancel).await?;

        ensure_exists(&out)?;
        let produced = self.probe(&out, &job.cancel).await?;
        Ok(HandlerOutput::file(out, name).with_result(json!({
            "start": start,
            "duration": produced.duration,
        })))
    }

    async fn extract_audio(&self, job: &ProcessingJob, probe: &MediaProbe) -> Result<HandlerOutput> {
        let input = job.input()?;
        if !probe.has_audio {
            return Err(PipelineError::invalid("The video has no audio track"));
        }
        let format = AudioFormat::parse(job.str_or("format", "mp3"))?;
        let bitrate = job.str_or("bitrate", "192k");
        let name = output_name("audio_", &input.original_filename, format.extension());
        let out = job.output_path(&name);

        let codec: Vec<String> = format.codec_args(bitrate);
        let mut cmd = self.ffmpeg().input(&input.path);
        for arg in &codec {
            cmd = cmd.arg(arg);
        }
        cmd.output(&out).execute(&job.cancel).await?;

        ensure_exists(&out)?;
        Ok(HandlerOutput::file(out, name))
    }

    async fn remove_audio(&self, job: &ProcessingJob) -> Result<HandlerOutput> {
        let input = job.input()?;
        let name = output_name("no_audio_", &input.original_filename, &input.extension);
        let out = job.output_path(&name);

        self.ffmpeg()
            .input(&input.path)
            .args(&["-map", "0:v?", "-c:v", "copy", "-an"])
            .output(&out)
            .execute(&job.cancel)
            .await?;

        ensure_exists(&out)?;
        Ok(HandlerOutput::file(out, name))
    }

    async fn compress(&self, job: &ProcessingJob) -> Result<HandlerOutput> {
        let input = job.input()?;
        let crf = job.u64_or("crf", 23).to_string();
        let preset = job.str_or("preset", "medium");
        let name = output_name("compressed_", &input.original_filename, "mp4");
        let out = job.output_path(&name);

        self.ffmpeg()
            .input(&input.path)
            .args(&["-c:v", "libx264", "-crf", &crf, "-preset", preset, "-pix_fmt", "yuv420p"])
            .args(&["-c:a", "aac", "-b:a", "128k", "-movflags", "+faststart"])
            .output(&out)
            .execute(&job.cancel)
            .await?;

        ensure_exists(&out)?;
        let original_size = std::fs::metadata(&input.path)?.len();
        let compressed_size = std::fs::metadata(&out)?.len();
        Ok(HandlerOutput::file(out, name).with_result(json!({
            "original_size": original_size,
            "compressed_size": compressed_size,
        })))
    }

    async fn convert(&self, job: &ProcessingJob) -> Result<HandlerOutput> {
        let input = job.input()?;
        let format = job.require_str("format")?;
        let codec = container_args(format)?;
        let name = output_name("converted_", &input.original_filename, format);
        let out = job.output_path(&name);

        let mut cmd = self.ffmpeg().input(&input.path).args(codec);
        if matches!(format, "mp4" | "mov") {
            cmd = cmd.args(&["-movflags", "+faststart"]);
        }
        cmd.output(&out).execute(&job.cancel).await?;

        ensure_exists(&out)?;
        Ok(HandlerOutput::file(out, name))
    }

    async fn vertical_crop(&self, job: &ProcessingJob, probe: &MediaProbe) -> Result<HandlerOutput> {
        let input = job.input()?;
        if !probe.has_video {
            return Err(PipelineError::invalid("The file has no video stream"));
        }
        let mut filter = VERTICAL_CROP.to_string();
        if let Some(height) = job.u64_opt("height") {
            filter.push_str(&format!(",scale=-2:{}", height - height % 2));
        }
        let name = output_name("vertical_", &input.original_filename, "mp4");
        let out = job.output_path(&name);

        self.ffmpeg()
            .input(&input.path)
            .arg("-vf")
            .arg(&filter)
            .args(&["-c:v", "libx264", "-preset", "veryfast", "-crf", "23", "-pix_fmt", "yuv420p"])
            .args(&["-c:a", "aac", "-b:a", "128k", "-movflags", "+faststart"])
            .output(&out)
            .execute(&job.cancel)
            .await?;

        ensure_exists(&out)?;
        Ok(HandlerOutput::file(out, name))
    }
}

#[async_trait]
impl ToolHandler for MediaHandler {
    fn category(&self) -> ToolCategory {
        ToolCategory::Video
    }

    async fn process(&self, job: &ProcessingJob) -> Result<HandlerOutput> {
        let Operation::Video(op) = job.operation() else {
            return Err(PipelineError::processing(format!("{} is not a video tool", job.tool.id)));
        };

        let queued_at = Instant::now();
        let _permit = self.pool.admit().await?;
        debug!(
            request_id = %job.request_id,
            waited_ms = queued_at.elapsed().as_millis() as u64,
            running = self.pool.running(),
            "worker slot acquired"
        );

        let input = job.input()?;
        let probe = self.probe(&input.path, &job.cancel).await?;
        if !probe.has_video && !probe.has_audio {
            return Err(PipelineError::processing(format!(
                "{} contains no decodable media streams",
                input.path.display()
            )));
        }

        let started = Instant::now();
        let output = match op {
            MediaOperation::Trim => self.trim(job, &probe).await,
            MediaOperation::ExtractAudio => self.extract_audio(job, &probe).await,
            MediaOperation::RemoveAudio => self.remove_audio(job).await,
            MediaOperation::Compress => self.compress(job).await,
            MediaOperation::Convert => self.convert(job).await,
            MediaOperation::VerticalCrop => self.vertical_crop(job, &probe).await,
        }?;

        info!(
            request_id = %job.request_id,
            tool_id = %job.tool.id,
            source_duration = probe.duration,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "🎬 Transcode finished"
        );
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_from_json() {
        let parsed = json!({
            "streams": [
                { "codec_type": "video", "width": 1920, "height": 1080 },
                { "codec_type": "audio", "sample_rate": "48000" }
            ],
            "format": { "duration": "10.000000", "format_name": "mov,mp4,m4a,3gp,3g2,mj2" }
        });
        let probe = MediaProbe::from_json(&parsed);
        assert_eq!(probe.duration, Some(10.0));
        assert_eq!((probe.width, probe.height), (Some(1920), Some(1080)));
        assert!(probe.has_video && probe.has_audio);
    }

    #[test]
    fn test_probe_without_audio() {
        let parsed = json!({
            "streams": [{ "codec_type": "video", "width": 320, "height": 240, "duration": "4.5" }],
            "format": {}
        });
        let probe = MediaProbe::from_json(&parsed);
        assert!(!probe.has_audio);
        assert_eq!(probe.duration, Some(4.5));
    }

    #[test]
    fn test_container_args() {
        assert!(container_args("webm").unwrap().contains(&"libvpx-vp9"));
        assert!(matches!(container_args("flv"), Err(PipelineError::InvalidInput(_))));
    }

    #[test]
    fn test_seconds_format() {
        assert_eq!(seconds(2.0), "2.000");
        assert_eq!(seconds(0.1234), "0.123");
    }
}
