//! Configuration management for the MJPEG streamer

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::camera::jpeg::Rotation;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Main application configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub camera: CameraConfig,

    #[serde(default)]
    pub indicator: IndicatorConfig,

    #[serde(default)]
    pub page: PageConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ServerConfig {
    #[serde(default = "default_bind_ip")]
    pub bind_ip: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Upper bound for handing one part to a client before it is dropped
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,

    /// How long a snapshot waits for the first frame in streaming mode
    #[serde(default = "default_snapshot_timeout_ms")]
    pub snapshot_timeout_ms: u64,
}

/// Where frames come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum CaptureSource {
    /// Synthetic moving pattern, no hardware needed
    TestPattern,
    /// V4L2 device delivering MJPEG
    V4l2,
    /// libcamera through GStreamer
    Libcamera,
}

/// How sessions and snapshots obtain frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum CaptureMode {
    /// Continuous capture thread feeding a shared frame buffer
    Stream,
    /// One still capture per requested frame
    Still,
}

/// Camera configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct CameraConfig {
    #[serde(default = "default_source")]
    pub source: CaptureSource,

    #[serde(default = "default_mode")]
    pub mode: CaptureMode,

    /// Device path (V4L2) or camera name (libcamera)
    #[serde(default = "default_device")]
    pub device: String,

    #[serde(default = "default_width")]
    pub width: u32,

    #[serde(default = "default_height")]
    pub height: u32,

    #[serde(default = "default_fps")]
    pub fps: u32,

    /// Clockwise rotation in degrees: 0, 90, 180 or 270
    #[serde(default)]
    pub rotation: u16,

    /// JPEG quality (1-100)
    #[serde(default = "default_quality")]
    pub quality: u8,

    /// Pause after a failed capture before trying again
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

/// Capture indicator LED
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct IndicatorConfig {
    /// Drive a GPIO pin; when false transitions are only logged
    #[serde(default = "default_indicator_enabled")]
    pub enabled: bool,

    /// BCM pin number
    #[serde(default = "default_gpio_pin")]
    pub gpio_pin: u8,
}

/// Text of the viewer page
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct PageConfig {
    #[serde(default = "default_title")]
    pub title: String,

    #[serde(default = "default_heading")]
    pub heading: String,
}

// Default value functions
fn default_bind_ip() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 8000 }
fn default_write_timeout_ms() -> u64 { 5_000 }
fn default_snapshot_timeout_ms() -> u64 { 2_000 }
fn default_source() -> CaptureSource { CaptureSource::TestPattern }
fn default_mode() -> CaptureMode { CaptureMode::Stream }
fn default_device() -> String { "/dev/video0".to_string() }
fn default_width() -> u32 { 640 }
fn default_height() -> u32 { 480 }
fn default_fps() -> u32 { 24 }
fn default_quality() -> u8 { 85 }
fn default_retry_delay_ms() -> u64 { 1_000 }
fn default_indicator_enabled() -> bool { true }
fn default_gpio_pin() -> u8 { 4 }
fn default_title() -> String { "Raspberry Pi - Chicken Cam!".to_string() }
fn default_heading() -> String { "All the chickens in the house?".to_string() }

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_ip: default_bind_ip(),
            port: default_port(),
            write_timeout_ms: default_write_timeout_ms(),
            snapshot_timeout_ms: default_snapshot_timeout_ms(),
        }
    }
}

impl ServerConfig {
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.bind_ip, self.port)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn snapshot_timeout(&self) -> Duration {
        Duration::from_millis(self.snapshot_timeout_ms)
    }
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            source: default_source(),
            mode: default_mode(),
            device: default_device(),
            width: default_width(),
            height: default_height(),
            fps: default_fps(),
            rotation: 0,
            quality: default_quality(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

impl CameraConfig {
    /// Parsed rotation; `validate` guarantees this is one of the four right angles
    pub fn rotation(&self) -> Rotation {
        Rotation::from_degrees(self.rotation).unwrap_or_default()
    }

    /// Resolution of the emitted frames after rotation
    pub fn output_size(&self) -> (u32, u32) {
        self.rotation().output_size(self.width, self.height)
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs(1) / self.fps.max(1)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

impl Default for IndicatorConfig {
    fn default() -> Self {
        Self {
            enabled: default_indicator_enabled(),
            gpio_pin: default_gpio_pin(),
        }
    }
}

impl Default for PageConfig {
    fn default() -> Self {
        Self {
            title: default_title(),
            heading: default_heading(),
        }
    }
}

impl Config {
    /// Loads configuration from TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Loads the file if it exists, otherwise falls back to defaults
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(path)
        } else {
            tracing::info!(path = %path.display(), "Config file not found, using defaults");
            Ok(Self::default())
        }
    }

    /// Loads configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validates configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let server = &self.server;
        if server.port == 0 {
            return Err(ConfigError::Invalid("server port must be > 0".to_string()));
        }

        if server.write_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "write-timeout-ms must be > 0".to_string(),
            ));
        }

        let cam = &self.camera;
        if cam.width == 0 || cam.height == 0 {
            return Err(ConfigError::Invalid(
                "camera width and height must be > 0".to_string(),
            ));
        }

        if cam.fps == 0 || cam.fps > 120 {
            return Err(ConfigError::Invalid(format!(
                "camera fps must be between 1 and 120, got {}",
                cam.fps
            )));
        }

        if cam.quality == 0 || cam.quality > 100 {
            return Err(ConfigError::Invalid(format!(
                "camera quality must be between 1 and 100, got {}",
                cam.quality
            )));
        }

        if Rotation::from_degrees(cam.rotation).is_none() {
            return Err(ConfigError::Invalid(format!(
                "camera rotation must be 0, 90, 180 or 270, got {}",
                cam.rotation
            )));
        }

        Ok(())
    }
}
