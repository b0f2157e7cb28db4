//! Mixer configuration
//!
//! Stored as simple key=value lines at `<config dir>/amix/mixer.conf`.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// Close timeout when nothing else is configured
const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_millis(2000);
/// Below this rate the output is opened at `FALLBACK_SAMPLE_RATE` instead
const LOW_SAMPLE_RATE_CUTOFF: u32 = 32000;
pub(crate) const FALLBACK_SAMPLE_RATE: u32 = 48000;
const DEFAULT_FILTER_FRAME_ALIGNMENT: usize = 64;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid value '{value}' for '{key}'")]
    InvalidValue { key: String, value: String },
}

/// Mixer configuration
#[derive(Debug, Clone, PartialEq)]
pub struct MixerConfig {
    /// Pipeline description file; defaults to `pipeline.json` next to the config
    pub pipeline_path: Option<PathBuf>,
    /// Let sources and `set_num_output_channels` change the channel count
    pub enable_dynamic_channel_count: bool,
    /// Open the output at 48 kHz for streams below 32 kHz
    pub enable_upsampling: bool,
    /// Fixed device channel count
    pub output_channels: Option<usize>,
    /// Fixed device sample rate
    pub output_sample_rate: Option<u32>,
    /// Idle time before the output closes; negative never closes
    pub check_close_timeout_ms: Option<i64>,
    /// Another component manages the output's lifetime; close right away
    pub accept_resource_provider: bool,
    /// Frames per write are rounded down to a multiple of this (power of two)
    pub filter_frame_alignment: usize,
}

impl Default for MixerConfig {
    fn default() -> Self {
        Self {
            pipeline_path: None,
            enable_dynamic_channel_count: false,
            enable_upsampling: false,
            output_channels: None,
            output_sample_rate: None,
            check_close_timeout_ms: None,
            accept_resource_provider: false,
            filter_frame_alignment: DEFAULT_FILTER_FRAME_ALIGNMENT,
        }
    }
}

impl MixerConfig {
    /// Load config from the default location
    ///
    /// Returns default config if the file doesn't exist or can't be parsed.
    pub fn load() -> Self {
        let path = Self::config_path();
        match Self::load_from(&path) {
            Ok(config) => config,
            Err(ConfigError::Io(err)) if err.kind() == io::ErrorKind::NotFound => Self::default(),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "unable to load mixer config, using defaults");
                Self::default()
            }
        }
    }

    /// Load config from a specific path
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Save config to the default location
    pub fn save(&self) -> io::Result<()> {
        self.save_to(&Self::config_path())
    }

    /// Save config to a specific path
    pub fn save_to(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.serialize())
    }

    /// Directory holding the mixer's files
    pub fn config_dir() -> PathBuf {
        dirs::config_dir().unwrap_or_else(|| PathBuf::from(".")).join("amix")
    }

    /// Get the default config file path
    pub fn config_path() -> PathBuf {
        Self::config_dir().join("mixer.conf")
    }

    /// Pipeline description file in effect
    pub fn pipeline_path(&self) -> PathBuf {
        self.pipeline_path
            .clone()
            .unwrap_or_else(|| Self::config_dir().join("pipeline.json"))
    }

    /// Idle time before the output closes; `None` never closes
    pub fn close_timeout(&self) -> Option<Duration> {
        match self.check_close_timeout_ms {
            Some(ms) if ms < 0 => None,
            Some(ms) => Some(Duration::from_millis(ms as u64)),
            None if self.accept_resource_provider => Some(Duration::ZERO),
            None => Some(DEFAULT_CLOSE_TIMEOUT),
        }
    }

    /// Rate below which streams play at the fallback rate
    pub fn low_sample_rate_cutoff(&self) -> Option<u32> {
        self.enable_upsampling.then_some(LOW_SAMPLE_RATE_CUTOFF)
    }

    /// Parse config from simple key=value format
    fn parse(content: &str) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let key = key.trim();
            let value = value.trim();

            match key {
                "pipeline_path" => {
                    if !value.is_empty() {
                        config.pipeline_path = Some(PathBuf::from(value));
                    }
                }
                "enable_dynamic_channel_count" => config.enable_dynamic_channel_count = parse_value(key, value)?,
                "enable_upsampling" => config.enable_upsampling = parse_value(key, value)?,
                "output_channels" => config.output_channels = Some(parse_value(key, value)?),
                "output_sample_rate" => config.output_sample_rate = Some(parse_value(key, value)?),
                "check_close_timeout_ms" => config.check_close_timeout_ms = Some(parse_value(key, value)?),
                "accept_resource_provider" => config.accept_resource_provider = parse_value(key, value)?,
                "filter_frame_alignment" => {
                    let alignment: usize = parse_value(key, value)?;
                    if !alignment.is_power_of_two() {
                        return Err(invalid(key, value));
                    }
                    config.filter_frame_alignment = alignment;
                }
                _ => {} // Ignore unknown keys
            }
        }

        if config.output_channels == Some(0) {
            return Err(invalid("output_channels", "0"));
        }
        if config.output_sample_rate == Some(0) {
            return Err(invalid("output_sample_rate", "0"));
        }
        Ok(config)
    }

    /// Serialize config to simple key=value format
    fn serialize(&self) -> String {
        let mut lines = vec!["# amix mixer configuration".to_string()];

        if let Some(ref path) = self.pipeline_path {
            lines.push(format!("pipeline_path={}", path.display()));
        }
        lines.push(format!("enable_dynamic_channel_count={}", self.enable_dynamic_channel_count));
        lines.push(format!("enable_upsampling={}", self.enable_upsampling));
        if let Some(channels) = self.output_channels {
            lines.push(format!("output_channels={channels}"));
        }
        if let Some(rate) = self.output_sample_rate {
            lines.push(format!("output_sample_rate={rate}"));
        }
        if let Some(ms) = self.check_close_timeout_ms {
            lines.push(format!("check_close_timeout_ms={ms}"));
        }
        lines.push(format!("accept_resource_provider={}", self.accept_resource_provider));
        lines.push(format!("filter_frame_alignment={}", self.filter_frame_alignment));

        lines.join("\n")
    }
}

fn invalid(key: &str, value: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| invalid(key, value))
}
