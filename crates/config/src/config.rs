//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Configuration parsed but holds unusable values
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Locations of the external executables the pipeline drives
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolsConfig {
    /// ffmpeg binary (frame extraction, reassembly, merging)
    #[serde(default = "default_ffmpeg")]
    pub ffmpeg: PathBuf,
    /// ffprobe binary (metadata and audio detection)
    #[serde(default = "default_ffprobe")]
    pub ffprobe: PathBuf,
    /// Real-ESRGAN ncnn binary (per-frame upscaling)
    #[serde(default = "default_realesrgan")]
    pub realesrgan: PathBuf,
}

fn default_ffmpeg() -> PathBuf {
    PathBuf::from("ffmpeg")
}

fn default_ffprobe() -> PathBuf {
    PathBuf::from("ffprobe")
}

fn default_realesrgan() -> PathBuf {
    PathBuf::from("realesrgan-ncnn-vulkan")
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            ffmpeg: default_ffmpeg(),
            ffprobe: default_ffprobe(),
            realesrgan: default_realesrgan(),
        }
    }
}

/// Batch pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineConfig {
    /// Frames per batch (default 150)
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    /// Root for per-job scratch trees (system temp dir if None)
    pub temp_root: Option<PathBuf>,
}

fn default_batch_size() -> u32 {
    150
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            temp_root: None,
        }
    }
}

impl PipelineConfig {
    /// Scratch root actually used for jobs
    ///
    /// Always absolute: a relative root is resolved against the current
    /// directory, since ffmpeg reads concat manifest entries relative to the
    /// manifest itself.
    pub fn resolved_temp_root(&self) -> PathBuf {
        let root = self
            .temp_root
            .clone()
            .unwrap_or_else(|| env::temp_dir().join("revive-pixels"));
        std::path::absolute(&root).unwrap_or(root)
    }
}

/// Upscaler invocation configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpscalerConfig {
    /// Number of logical cores (auto-detected if None)
    pub logical_cores: Option<u32>,
    /// Concurrent upscaler processes (0 = auto-derive)
    #[serde(default)]
    pub workers: u32,
    /// GPU device passed to the upscaler (`-g`)
    #[serde(default = "default_gpu_id")]
    pub gpu_id: String,
    /// load:proc:save thread counts passed to the upscaler (`-j`)
    #[serde(default = "default_threads")]
    pub threads: String,
}

fn default_gpu_id() -> String {
    "auto".to_string()
}

fn default_threads() -> String {
    "2:2:2".to_string()
}

impl Default for UpscalerConfig {
    fn default() -> Self {
        Self {
            logical_cores: None,
            workers: 0,
            gpu_id: default_gpu_id(),
            threads: default_threads(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub upscaler: UpscalerConfig,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the config.toml file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - FFMPEG_PATH -> tools.ffmpeg
    /// - FFPROBE_PATH -> tools.ffprobe
    /// - REALESRGAN_PATH -> tools.realesrgan
    /// - PIPELINE_BATCH_SIZE -> pipeline.batch_size
    /// - PIPELINE_TEMP_ROOT -> pipeline.temp_root
    /// - UPSCALER_LOGICAL_CORES -> upscaler.logical_cores
    /// - UPSCALER_WORKERS -> upscaler.workers
    /// - UPSCALER_GPU_ID -> upscaler.gpu_id
    /// - UPSCALER_THREADS -> upscaler.threads
    pub fn apply_env_overrides(&mut self) {
        if let Some(path) = non_empty_var("FFMPEG_PATH") {
            self.tools.ffmpeg = PathBuf::from(path);
        }
        if let Some(path) = non_empty_var("FFPROBE_PATH") {
            self.tools.ffprobe = PathBuf::from(path);
        }
        if let Some(path) = non_empty_var("REALESRGAN_PATH") {
            self.tools.realesrgan = PathBuf::from(path);
        }

        if let Ok(val) = env::var("PIPELINE_BATCH_SIZE") {
            if let Ok(size) = val.parse::<u32>() {
                self.pipeline.batch_size = size;
            }
        }
        if let Some(root) = non_empty_var("PIPELINE_TEMP_ROOT") {
            self.pipeline.temp_root = Some(PathBuf::from(root));
        }

        if let Ok(val) = env::var("UPSCALER_LOGICAL_CORES") {
            if let Ok(cores) = val.parse::<u32>() {
                self.upscaler.logical_cores = Some(cores);
            }
        }
        if let Ok(val) = env::var("UPSCALER_WORKERS") {
            if let Ok(workers) = val.parse::<u32>() {
                self.upscaler.workers = workers;
            }
        }
        if let Some(gpu) = non_empty_var("UPSCALER_GPU_ID") {
            self.upscaler.gpu_id = gpu;
        }
        if let Some(threads) = non_empty_var("UPSCALER_THREADS") {
            self.upscaler.threads = threads;
        }
    }

    /// Reject values the pipeline cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pipeline.batch_size == 0 {
            return Err(ConfigError::Invalid(
                "pipeline.batch_size must be greater than 0".to_string(),
            ));
        }

        let tools = [
            ("tools.ffmpeg", &self.tools.ffmpeg),
            ("tools.ffprobe", &self.tools.ffprobe),
            ("tools.realesrgan", &self.tools.realesrgan),
        ];
        for (name, path) in tools {
            if path.as_os_str().is_empty() {
                return Err(ConfigError::Invalid(format!("{} must not be empty", name)));
            }
        }

        Ok(())
    }

    /// Load configuration from file, apply environment overrides and validate
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides, for runs without a config file
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}
