//! Video admission through the dispatcher, with stand-in ffmpeg/ffprobe scripts
#![cfg(unix)]

mod common;

use bytes::Bytes;
use serde_json::Map;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use common::*;
use toolora::config::Config;
use toolora::server::AppState;
use toolora::PipelineError;

const PROBE_JSON: &str = r#"{"format":{"duration":"10.0","format_name":"mov,mp4,m4a"},"streams":[{"codec_type":"video","width":320,"height":240},{"codec_type":"audio"}]}"#;

fn write_script(path: &Path, body: &str) {
    std::fs::write(path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

/// Installs a fake transcoder that records how many copies of itself are live.
///
/// Returns the file holding one live-count sample per invocation.
fn fake_tools(dir: &Path, config: &mut Config, sleep_secs: &str) -> PathBuf {
    let bin = dir.join("bin");
    let live = dir.join("live");
    std::fs::create_dir_all(&bin).unwrap();
    std::fs::create_dir_all(&live).unwrap();
    let samples = dir.join("samples.log");

    write_script(&bin.join("ffprobe"), &format!("printf '%s' '{}'", PROBE_JSON));
    write_script(
        &bin.join("ffmpeg"),
        &format!(
            r#"touch "{live}/$$"
ls "{live}" | wc -l >> "{samples}"
sleep {sleep_secs}
rm -f "{live}/$$"
for arg in "$@"; do out="$arg"; done
printf 'transcoded' > "$out""#,
            live = live.display(),
            samples = samples.display(),
        ),
    );

    config.video.ffmpeg_path = bin.join("ffmpeg");
    config.video.ffprobe_path = bin.join("ffprobe");
    samples
}

fn peak(samples: &Path) -> usize {
    std::fs::read_to_string(samples)
        .unwrap_or_default()
        .lines()
        .filter_map(|line| line.trim().parse::<usize>().ok())
        .max()
        .unwrap_or(0)
}

async fn remove_audio_burst(state: &AppState, jobs: usize) -> Vec<Result<(), PipelineError>> {
    let mut handles = Vec::new();
    for i in 0..jobs {
        let dispatcher = state.dispatcher.clone();
        handles.push(tokio::spawn(async move {
            dispatcher
                .dispatch(
                    "audio-remover",
                    vec![(format!("clip{}.mp4", i), Bytes::from_static(b"not really a movie"))],
                    Map::new(),
                )
                .await
                .map(|_| ())
        }));
    }
    let mut results = Vec::new();
    for handle in handles {
        results.push(handle.await.unwrap());
    }
    results
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_video_jobs_hold_pool_permits() {
    // queued jobs wait their turn and never run more than capacity at once
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.video.max_concurrent_jobs = Some(2);
    config.video.queue_limit = 16;
    config.video.queue_timeout = Duration::from_secs(30);
    let samples = fake_tools(dir.path(), &mut config, "0.3");
    let (state, _) = AppState::from_config(&config).unwrap();

    let results = remove_audio_burst(&state, 6).await;
    assert!(results.iter().all(Result::is_ok), "{:?}", results);
    let observed = peak(&samples);
    assert!((1..=2).contains(&observed), "peak concurrency {}", observed);
    assert_eq!(state.video_pool.running(), 0);
    assert_eq!(count_files(&dir.path().join("uploads")), 0);

    // with no queue, overflow is turned away with a retry hint
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.video.max_concurrent_jobs = Some(1);
    config.video.queue_limit = 0;
    config.video.queue_timeout = Duration::from_secs(1);
    let samples = fake_tools(dir.path(), &mut config, "1");
    let (state, _) = AppState::from_config(&config).unwrap();

    let results = remove_audio_burst(&state, 3).await;
    let completed = results.iter().filter(|r| r.is_ok()).count();
    let exhausted: Vec<Duration> = results
        .iter()
        .filter_map(|r| match r {
            Err(PipelineError::ResourceExhausted { retry_after }) => Some(*retry_after),
            _ => None,
        })
        .collect();
    assert!(completed >= 1, "{:?}", results);
    assert!(!exhausted.is_empty(), "{:?}", results);
    assert_eq!(completed + exhausted.len(), 3, "{:?}", results);
    assert!(exhausted.iter().all(|d| *d >= Duration::from_secs(1)));
    assert_eq!(peak(&samples), 1);
    assert_eq!(state.dispatcher.metrics().snapshot().busy_rejections as usize, exhausted.len());
}
