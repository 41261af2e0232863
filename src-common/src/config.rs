//! Configuration management for framecap.
//!
//! Handles loading and saving user configuration to platform-standard config directories:
//! - Linux: `~/.config/framecap/config.json`
//! - macOS: `~/Library/Application Support/framecap/config.json`
//! - Windows: `%APPDATA%\framecap\config.json`

use crate::types::{ImageFormat, ResolutionPolicy};
use crate::validation::{self, ValidationError};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Name of the per-session cache directory under the cache root.
pub const CACHE_DIR_NAME: &str = "RecordingCache";

/// Capture cadence and frame ring settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Target capture rate in frames per second.
    #[serde(default = "default_target_fps")]
    pub target_fps: u32,
    /// Frame interval is `interval_multiplier / target_fps` seconds.
    /// Values above 1.0 under-sample the render loop.
    #[serde(default = "default_interval_multiplier")]
    pub interval_multiplier: f64,
    /// Number of frame-file slots before the ring wraps and overwrites.
    #[serde(default = "default_ring_size")]
    pub ring_size: u32,
    /// Preload the frame timer so the very first tick captures.
    #[serde(default)]
    pub prime_first_frame: bool,
    /// Handling of resolutions that are not a multiple of the kernel tile.
    #[serde(default)]
    pub resolution_policy: ResolutionPolicy,
    /// Worker threads for the pixel kernel. None uses one per core.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kernel_threads: Option<usize>,
}

fn default_target_fps() -> u32 {
    30
}

fn default_interval_multiplier() -> f64 {
    2.0
}

fn default_ring_size() -> u32 {
    100
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            target_fps: default_target_fps(),
            interval_multiplier: default_interval_multiplier(),
            ring_size: default_ring_size(),
            prime_first_frame: false,
            resolution_policy: ResolutionPolicy::default(),
            kernel_threads: None,
        }
    }
}

/// Background frame encoder settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncoderConfig {
    /// Upper bound on concurrently running encode tasks (clamped to the ring size).
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    /// Attempts after the first failure before a frame is reported as failed.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// zstd compression level (1-21).
    #[serde(default = "default_compression_level")]
    pub compression_level: i32,
    /// How long finalization waits for outstanding encode tasks.
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,
}

fn default_max_in_flight() -> usize {
    8
}

fn default_max_retries() -> u32 {
    2
}

fn default_compression_level() -> i32 {
    3
}

fn default_drain_timeout_secs() -> u64 {
    30
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            max_in_flight: default_max_in_flight(),
            max_retries: default_max_retries(),
            compression_level: default_compression_level(),
            drain_timeout_secs: default_drain_timeout_secs(),
        }
    }
}

/// Archive settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfig {
    /// Fixed archive password. When unset a random key is generated per session.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// File name of the archive written next to the cache directory.
    #[serde(default = "default_archive_name")]
    pub file_name: String,
}

fn default_archive_name() -> String {
    "result.zip".to_string()
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            password: None,
            file_name: default_archive_name(),
        }
    }
}

/// Frame reconstruction and video assembly settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoConfig {
    /// Video codec passed to ffmpeg.
    #[serde(default = "default_codec")]
    pub codec: String,
    /// Constant rate factor for the codec.
    #[serde(default = "default_crf")]
    pub crf: u32,
    /// Output pixel format.
    #[serde(default = "default_pix_fmt")]
    pub pix_fmt: String,
    /// Output video file name.
    #[serde(default = "default_video_name")]
    pub file_name: String,
    /// Still-image format for reconstructed frames.
    #[serde(default)]
    pub image_format: ImageFormat,
    /// JPEG quality (1-100) for reconstructed frames.
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
    /// Flip reconstructed frames vertically (bottom-up surfaces).
    #[serde(default)]
    pub flip_vertical: bool,
}

fn default_codec() -> String {
    "libx264".to_string()
}

fn default_crf() -> u32 {
    25
}

fn default_pix_fmt() -> String {
    "yuv420p".to_string()
}

fn default_video_name() -> String {
    "ScreenCapture.mp4".to_string()
}

fn default_jpeg_quality() -> u8 {
    90
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            codec: default_codec(),
            crf: default_crf(),
            pix_fmt: default_pix_fmt(),
            file_name: default_video_name(),
            image_format: ImageFormat::default(),
            jpeg_quality: default_jpeg_quality(),
            flip_vertical: false,
        }
    }
}

/// Directory overrides.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PathsConfig {
    /// Root for the recording cache, archive and extraction scratch space.
    /// If None, uses the platform cache directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_root: Option<String>,
    /// Where assembled videos are written. If None, uses the cache root.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_dir: Option<String>,
}

/// Application configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub encoder: EncoderConfig,
    #[serde(default)]
    pub archive: ArchiveConfig,
    #[serde(default)]
    pub video: VideoConfig,
    #[serde(default)]
    pub paths: PathsConfig,
}

impl AppConfig {
    /// Create a new config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Check every field that would otherwise fail later in the pipeline.
    pub fn validate(&self) -> Result<(), ValidationError> {
        validation::validate_target_fps(self.capture.target_fps)?;
        validation::validate_interval_multiplier(self.capture.interval_multiplier)?;
        validation::validate_ring_size(self.capture.ring_size)?;
        if self.encoder.max_in_flight == 0 {
            return Err(ValidationError::OutOfRange {
                field: "encoder.max_in_flight",
                value: 0,
                min: 1,
                max: u32::MAX as i64,
            });
        }
        validation::validate_compression_level(self.encoder.compression_level)?;
        validation::validate_file_name("archive.file_name", &self.archive.file_name)?;
        validation::validate_file_name("video.file_name", &self.video.file_name)?;
        if let Some(password) = &self.archive.password {
            if password.is_empty() {
                return Err(ValidationError::Empty("archive.password"));
            }
        }
        if !(1..=100).contains(&self.video.jpeg_quality) {
            return Err(ValidationError::OutOfRange {
                field: "video.jpeg_quality",
                value: self.video.jpeg_quality as i64,
                min: 1,
                max: 100,
            });
        }
        Ok(())
    }

    /// Resolve the cache root, falling back to the platform cache directory.
    pub fn cache_root(&self) -> Result<PathBuf, String> {
        match &self.paths.cache_root {
            Some(dir) if !dir.is_empty() => Ok(PathBuf::from(dir)),
            _ => get_default_cache_root(),
        }
    }

    /// Resolve the video output directory, falling back to the cache root.
    pub fn output_dir(&self) -> Result<PathBuf, String> {
        match &self.paths.output_dir {
            Some(dir) if !dir.is_empty() => Ok(PathBuf::from(dir)),
            _ => self.cache_root(),
        }
    }
}

/// Get the path to the config file.
pub fn get_config_path() -> Result<PathBuf, String> {
    let proj_dirs = ProjectDirs::from("", "", "framecap")
        .ok_or("Could not determine config directory")?;

    Ok(proj_dirs.config_dir().join("config.json"))
}

/// Platform cache directory used when no cache root is configured.
pub fn get_default_cache_root() -> Result<PathBuf, String> {
    let proj_dirs = ProjectDirs::from("", "", "framecap")
        .ok_or("Could not determine cache directory")?;

    Ok(proj_dirs.cache_dir().to_path_buf())
}

/// Load configuration from disk.
/// Returns default config if file doesn't exist or is invalid.
pub fn load_config() -> AppConfig {
    match get_config_path() {
        Ok(path) => load_config_from(&path),
        Err(e) => {
            warn!("Failed to get config path: {}", e);
            AppConfig::default()
        }
    }
}

/// Load configuration from an explicit path.
pub fn load_config_from(config_path: &Path) -> AppConfig {
    if !config_path.exists() {
        debug!("No config file at {:?}, using defaults", config_path);
        return AppConfig::default();
    }

    match fs::read_to_string(config_path) {
        Ok(contents) => match serde_json::from_str::<AppConfig>(&contents) {
            Ok(config) => {
                info!("Loaded config from {:?}", config_path);
                config
            }
            Err(e) => {
                warn!("Failed to parse config file: {}. Using defaults.", e);
                AppConfig::default()
            }
        },
        Err(e) => {
            warn!("Failed to read config file: {}. Using defaults.", e);
            AppConfig::default()
        }
    }
}

/// Save configuration to disk.
/// Creates the config directory if it doesn't exist.
pub fn save_config(config: &AppConfig) -> Result<(), String> {
    let config_path = get_config_path()?;
    save_config_to(config, &config_path)
}

/// Save configuration to an explicit path.
pub fn save_config_to(config: &AppConfig, config_path: &Path) -> Result<(), String> {
    if let Some(parent) = config_path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
    }

    let json = serde_json::to_string_pretty(config)
        .map_err(|e| format!("Failed to serialize config: {}", e))?;

    fs::write(config_path, json).map_err(|e| format!("Failed to write config file: {}", e))?;

    info!("Saved config to {:?}", config_path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.capture.target_fps, 30);
        assert_eq!(config.capture.interval_multiplier, 2.0);
        assert_eq!(config.capture.ring_size, 100);
        assert!(!config.capture.prime_first_frame);
        assert_eq!(config.capture.resolution_policy, ResolutionPolicy::Pad);
        assert!(config.archive.password.is_none());
        assert_eq!(config.video.crf, 25);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_serialization() {
        let mut config = AppConfig::default();
        config.paths.cache_root = Some("/custom/path".to_string());
        config.archive.password = Some("secret".to_string());
        config.capture.ring_size = 640;

        let json = serde_json::to_string(&config).unwrap();
        let parsed: AppConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.paths.cache_root, Some("/custom/path".to_string()));
        assert_eq!(parsed.archive.password, Some("secret".to_string()));
        assert_eq!(parsed.capture.ring_size, 640);
    }

    #[test]
    fn test_unset_password_not_serialized() {
        let config = AppConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("password"));
        assert!(!json.contains("cache_root"));
    }

    #[test]
    fn test_config_backward_compatible() {
        // Older files may only carry a subset of groups.
        let json = r#"{"capture": {"target_fps": 60}}"#;
        let parsed: AppConfig = serde_json::from_str(json).unwrap();

        assert_eq!(parsed.capture.target_fps, 60);
        assert_eq!(parsed.capture.interval_multiplier, 2.0);
        assert_eq!(parsed.encoder.max_retries, 2);
        assert_eq!(parsed.video.codec, "libx264");
    }

    #[test]
    fn test_validate_rejects_zero_fps() {
        let mut config = AppConfig::default();
        config.capture.target_fps = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_empty_password() {
        let mut config = AppConfig::default();
        config.archive.password = Some(String::new());
        assert!(matches!(
            config.validate(),
            Err(ValidationError::Empty("archive.password"))
        ));
    }

    #[test]
    fn test_validate_rejects_bad_file_name() {
        let mut config = AppConfig::default();
        config.video.file_name = "../escape.mp4".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let mut config = AppConfig::default();
        config.capture.interval_multiplier = 1.5;
        save_config_to(&config, &path).unwrap();

        let loaded = load_config_from(&path);
        assert_eq!(loaded.capture.interval_multiplier, 1.5);
    }

    #[test]
    fn test_load_invalid_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{ not json").unwrap();

        let loaded = load_config_from(&path);
        assert_eq!(loaded.capture.target_fps, 30);
    }

    #[test]
    fn test_output_dir_falls_back_to_cache_root() {
        let mut config = AppConfig::default();
        config.paths.cache_root = Some("/var/cache/demo".to_string());
        assert_eq!(config.output_dir().unwrap(), PathBuf::from("/var/cache/demo"));

        config.paths.output_dir = Some("/videos".to_string());
        assert_eq!(config.output_dir().unwrap(), PathBuf::from("/videos"));
    }
}
