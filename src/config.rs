//! Application configuration
//!
//! Loaded from TOML. Every section falls back to defaults so a partial file
//! (or no file at all) is valid.

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::audio::buffer::PcmFormat;
use crate::constants::*;
use crate::error::Error;

const CONFIG_FILE: &str = "config.toml";

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("", "", "pcm-stream-client")
}

/// Peer connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub host: String,
    pub port: u16,
    pub connect_timeout_ms: u64,
}

impl NetworkConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_PEER_HOST.to_string(),
            port: DEFAULT_PEER_PORT,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
        }
    }
}

/// Recording settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub sample_rate: u32,
    pub channels: u16,
    pub bytes_per_sample: u16,
    /// Nominal recording length
    pub duration_ms: u64,
    /// Hard ceiling for one capture attempt
    pub max_duration_ms: u64,
    pub poll_interval_ms: u64,
}

impl CaptureConfig {
    pub fn format(&self) -> PcmFormat {
        PcmFormat {
            sample_rate: self.sample_rate,
            channels: self.channels,
            bytes_per_sample: self.bytes_per_sample,
        }
    }

    /// Exact number of bytes one recording holds
    /// Length of one recording
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }

    pub fn total_bytes(&self) -> usize {
        self.format().bytes_for(self.duration())
    }

    pub fn max_duration(&self) -> Duration {
        Duration::from_millis(self.max_duration_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            channels: DEFAULT_CHANNELS,
            bytes_per_sample: BYTES_PER_SAMPLE,
            duration_ms: DEFAULT_RECORDING_MS,
            max_duration_ms: DEFAULT_CAPTURE_DEADLINE_MS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
        }
    }
}

/// Output device settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Output device name, or the host default when unset
    pub device: Option<String>,
    /// Bytes per device write; the device's preferred size when unset
    pub chunk_bytes: Option<usize>,
}

/// Where recordings are written
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub recordings_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let base = project_dirs()
            .map(|dirs| dirs.data_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));
        Self {
            recordings_dir: base.join("recordings"),
        }
    }
}

/// Complete application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub network: NetworkConfig,
    pub capture: CaptureConfig,
    pub playback: PlaybackConfig,
    pub storage: StorageConfig,
}

impl AppConfig {
    /// Default config file location in the platform config directory
    pub fn default_path() -> Option<PathBuf> {
        project_dirs().map(|dirs| dirs.config_dir().join(CONFIG_FILE))
    }

    /// Load and validate a config file
    pub fn load(path: &Path) -> Result<Self, Error> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&text)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path` if given, otherwise from the default location.
    ///
    /// A missing default file yields the defaults; a missing explicit file is an error.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, Error> {
        if let Some(path) = path {
            return Self::load(path);
        }

        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => {
                tracing::debug!("No config file found, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Write the config as TOML, creating parent directories
    pub fn save(&self, path: &Path) -> Result<(), Error> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let text = toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))?;
        std::fs::write(path, text)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.network.host.is_empty() {
            return Err(Error::Config("network.host is empty".into()));
        }
        if self.network.connect_timeout_ms == 0 {
            return Err(Error::Config("network.connect_timeout_ms must be positive".into()));
        }
        if self.capture.sample_rate == 0 {
            return Err(Error::Config("capture.sample_rate must be positive".into()));
        }
        if self.capture.channels != 1 {
            return Err(Error::Config(format!(
                "unsupported channel count: {}",
                self.capture.channels
            )));
        }
        if self.capture.bytes_per_sample != 2 {
            return Err(Error::Config(format!(
                "unsupported sample width: {} bytes",
                self.capture.bytes_per_sample
            )));
        }
        if self.capture.max_duration_ms == 0 {
            return Err(Error::Config("capture.max_duration_ms must be positive".into()));
        }
        if self.playback.chunk_bytes == Some(0) {
            return Err(Error::Config("playback.chunk_bytes must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.network.host, "192.168.4.1");
        assert_eq!(config.network.port, 80);
        assert_eq!(config.network.connect_timeout(), Duration::from_secs(5));
        assert_eq!(config.capture.duration(), Duration::from_secs(10));
        assert_eq!(config.capture.total_bytes(), 882_000);
        assert_eq!(config.capture.max_duration(), Duration::from_secs(15));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml() {
        let config: AppConfig = toml::from_str(
            r#"
            [network]
            host = "10.0.0.7"

            [capture]
            duration_ms = 2000
            "#,
        )
        .unwrap();

        assert_eq!(config.network.host, "10.0.0.7");
        assert_eq!(config.network.port, 80);
        assert_eq!(config.capture.total_bytes(), 176_400);
        assert_eq!(config.capture.max_duration_ms, 15_000);
    }

    #[test]
    fn test_validate_rejects_stereo() {
        let mut config = AppConfig::default();
        config.capture.channels = 2;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = AppConfig::default();
        config.network.port = 8080;
        config.playback.chunk_bytes = Some(2048);
        config.save(&path).unwrap();

        let loaded = AppConfig::load(&path).unwrap();
        assert_eq!(loaded.network.port, 8080);
        assert_eq!(loaded.playback.chunk_bytes, Some(2048));
    }

    #[test]
    fn test_missing_explicit_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = AppConfig::load_or_default(Some(&dir.path().join("absent.toml")));
        assert!(matches!(result, Err(Error::Io(_))));
    }
}
