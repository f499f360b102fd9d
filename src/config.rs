//! Configuration management.
//!
//! Loaded from a YAML file and overridden by `TOOLORA_`-prefixed environment
//! variables; nested keys use `__` as separator.
//!
//! ```bash
//! TOOLORA_PORT=8080
//! TOOLORA_STORAGE__OUTPUT_TTL=2h
//! TOOLORA_VIDEO__MAX_CONCURRENT_JOBS=2
//! ```

use clap::Parser;
use figment::{
    providers::{Env, Format, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, path::PathBuf, time::Duration};

use crate::error::PipelineError;
use crate::registry::ToolCategory;

const MIB: u64 = 1024 * 1024;

/// Simple CLI args - just for specifying config file
#[derive(Parser, Debug)]
#[command(name = "toolora", version, about = "Toolora tool processing daemon")]
pub struct Args {
    /// Path to configuration file
    #[arg(short = 'f', long, env = "TOOLORA_CONFIG", default_value = "config.yaml")]
    pub config: String,

    /// Validate configuration and exit without starting the server.
    #[arg(long)]
    pub validate: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub storage: StorageConfig,
    pub limits: LimitsConfig,
    pub video: VideoConfig,
    pub pdf: PdfConfig,
    /// Hard wall-clock limit for a single external command
    #[serde(with = "humantime_serde")]
    pub subprocess_timeout: Duration,
    /// Upper bound on a whole request once it has been dispatched
    #[serde(with = "humantime_serde")]
    pub processing_timeout: Duration,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageConfig {
    /// Root for streamed uploads and per-request scratch directories
    pub upload_dir: PathBuf,
    /// Root for produced artifacts served by the download gateway
    pub output_dir: PathBuf,
    #[serde(with = "humantime_serde")]
    pub output_ttl: Duration,
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
    /// Age after which unowned files in the upload/output roots are reclaimed
    #[serde(with = "humantime_serde")]
    pub orphan_grace: Duration,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct LimitsConfig {
    /// Per-file ceiling applied to every tool
    pub max_file_size: u64,
    /// Aggregate ceiling for all files of one request
    pub max_request_size: u64,
    /// Per-category overrides
    pub categories: HashMap<ToolCategory, CategoryLimits>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct CategoryLimits {
    pub max_file_size: Option<u64>,
    /// Restricts the accepted extensions of every tool in the category
    pub extensions: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct VideoConfig {
    /// Concurrent transcoder processes; defaults to the number of available cores
    pub max_concurrent_jobs: Option<usize>,
    /// Requests allowed to wait for a free worker
    pub queue_limit: usize,
    #[serde(with = "humantime_serde")]
    pub queue_timeout: Duration,
    pub ffmpeg_path: PathBuf,
    pub ffprobe_path: PathBuf,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct PdfConfig {
    pub qpdf_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            storage: StorageConfig::default(),
            limits: LimitsConfig::default(),
            video: VideoConfig::default(),
            pdf: PdfConfig::default(),
            subprocess_timeout: Duration::from_secs(600),
            processing_timeout: Duration::from_secs(900),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            upload_dir: PathBuf::from("uploads"),
            output_dir: PathBuf::from("outputs"),
            output_ttl: Duration::from_secs(60 * 60),
            sweep_interval: Duration::from_secs(60),
            orphan_grace: Duration::from_secs(6 * 60 * 60),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_file_size: 512 * MIB,
            max_request_size: 1024 * MIB,
            categories: HashMap::new(),
        }
    }
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: None,
            queue_limit: 16,
            queue_timeout: Duration::from_secs(30),
            ffmpeg_path: PathBuf::from("ffmpeg"),
            ffprobe_path: PathBuf::from("ffprobe"),
        }
    }
}

impl Default for PdfConfig {
    fn default() -> Self {
        Self {
            qpdf_path: PathBuf::from("qpdf"),
        }
    }
}

impl LimitsConfig {
    /// Effective per-file ceiling for a category.
    pub fn max_file_size_for(&self, category: ToolCategory) -> u64 {
        let category_limit = self
            .categories
            .get(&category)
            .and_then(|c| c.max_file_size)
            .unwrap_or_else(|| category.default_max_file_size());
        category_limit.min(self.max_file_size)
    }

    pub fn extensions_for(&self, category: ToolCategory) -> Option<&[String]> {
        self.categories
            .get(&category)
            .and_then(|c| c.extensions.as_deref())
    }
}

impl VideoConfig {
    pub fn worker_count(&self) -> usize {
        self.max_concurrent_jobs.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }
}

impl Config {
    #[allow(clippy::result_large_err)]
    pub fn load(args: &Args) -> Result<Self, figment::Error> {
        let config: Self = Self::figment(args).extract()?;
        config.validate().map_err(|e| figment::Error::from(e.to_string()))?;
        Ok(config)
    }

    pub fn figment(args: &Args) -> Figment {
        Figment::new()
            .merge(Yaml::file(&args.config))
            .merge(Env::prefixed("TOOLORA_").split("__"))
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.limits.max_file_size == 0 || self.limits.max_request_size == 0 {
            return Err(PipelineError::Config("file size limits must be greater than zero".into()));
        }
        if self.limits.max_request_size < self.limits.max_file_size {
            return Err(PipelineError::Config(format!(
                "max_request_size ({}) cannot be smaller than max_file_size ({})",
                self.limits.max_request_size, self.limits.max_file_size
            )));
        }
        if self.video.max_concurrent_jobs == Some(0) {
            return Err(PipelineError::Config("video.max_concurrent_jobs must be at least 1".into()));
        }
        if self.storage.output_ttl.is_zero() {
            return Err(PipelineError::Config("storage.output_ttl must be greater than zero".into()));
        }
        if self.subprocess_timeout.is_zero() || self.processing_timeout.is_zero() {
            return Err(PipelineError::Config("timeouts must be greater than zero".into()));
        }
        if self.storage.orphan_grace <= self.processing_timeout {
            return Err(PipelineError::Config(
                "storage.orphan_grace must exceed processing_timeout so in-flight files are never swept".into(),
            ));
        }
        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    fn args(file: &str) -> Args {
        Args {
            config: file.to_string(),
            validate: false,
        }
    }

    #[test]
    fn test_defaults_without_file() {
        Jail::expect_with(|_jail| {
            let config = Config::load(&args("missing.yaml"))?;
            assert_eq!(config.port, 3000);
            assert_eq!(config.storage.output_ttl, Duration::from_secs(3600));
            assert!(config.video.worker_count() >= 1);
            Ok(())
        });
    }

    #[test]
    fn test_yaml_and_category_limits() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "test.yaml",
                r#"
storage:
  upload_dir: /tmp/up
  output_ttl: 2h
limits:
  max_file_size: 1000
  max_request_size: 5000
  categories:
    image:
      max_file_size: 200
      extensions: [png]
video:
  max_concurrent_jobs: 2
  queue_timeout: 5s
"#,
            )?;

            let config = Config::load(&args("test.yaml"))?;
            assert_eq!(config.storage.upload_dir, PathBuf::from("/tmp/up"));
            assert_eq!(config.storage.output_ttl, Duration::from_secs(7200));
            assert_eq!(config.limits.max_file_size_for(ToolCategory::Image), 200);
            assert_eq!(config.limits.max_file_size_for(ToolCategory::Pdf), 1000);
            assert_eq!(
                config.limits.extensions_for(ToolCategory::Image),
                Some(&["png".to_string()][..])
            );
            assert_eq!(config.video.worker_count(), 2);
            assert_eq!(config.video.queue_timeout, Duration::from_secs(5));
            Ok(())
        });
    }

    #[test]
    fn test_env_override() {
        Jail::expect_with(|jail| {
            jail.create_file("test.yaml", "port: 4000\n")?;
            jail.set_env("TOOLORA_PORT", "8080");
            jail.set_env("TOOLORA_VIDEO__QUEUE_LIMIT", "3");

            let config = Config::load(&args("test.yaml"))?;
            assert_eq!(config.port, 8080);
            assert_eq!(config.video.queue_limit, 3);
            Ok(())
        });
    }

    #[test]
    fn test_rejects_zero_pool() {
        Jail::expect_with(|jail| {
            jail.create_file("test.yaml", "video:\n  max_concurrent_jobs: 0\n")?;
            assert!(Config::load(&args("test.yaml")).is_err());
            Ok(())
        });
    }
}
