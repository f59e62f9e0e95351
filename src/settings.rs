//! Log settings and configuration loading helpers.

use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;

use crate::error::LogError;

/// Hook supplying caller-allocated buffers for scan outputs.
pub type GetMemory = Arc<dyn Fn(usize) -> Vec<u8> + Send + Sync>;

/// Settings for opening a [`crate::log::PageLog`].
///
/// All sizes are expressed in bits, so `memory_size_bits = 26` means a 64 MiB
/// in-memory ring. The ring must hold at least two pages.
#[derive(Clone)]
pub struct LogSettings {
    /// Total in-memory ring size as 2^N bytes
    pub memory_size_bits: u32,
    /// Page size as 2^N bytes
    pub page_size_bits: u32,
    /// Device segment size as 2^N bytes
    pub segment_size_bits: u32,
    /// Fraction of the ring kept mutable (0, 1]
    pub mutable_fraction: f64,
    /// Commit metadata file; defaults to a `.commit` sibling of the device
    pub commit_path: Option<PathBuf>,
    /// Optional hook supplying buffers for scan outputs
    pub get_memory: Option<GetMemory>,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            memory_size_bits: 26,
            page_size_bits: 22,
            segment_size_bits: 30,
            mutable_fraction: 0.9,
            commit_path: None,
            get_memory: None,
        }
    }
}

impl fmt::Debug for LogSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogSettings")
            .field("memory_size_bits", &self.memory_size_bits)
            .field("page_size_bits", &self.page_size_bits)
            .field("segment_size_bits", &self.segment_size_bits)
            .field("mutable_fraction", &self.mutable_fraction)
            .field("commit_path", &self.commit_path)
            .field("get_memory", &self.get_memory.as_ref().map(|_| "<hook>"))
            .finish()
    }
}

impl LogSettings {
    /// Page size in bytes
    #[inline]
    pub fn page_size(&self) -> usize {
        1usize << self.page_size_bits
    }

    /// Ring size in bytes
    #[inline]
    pub fn memory_size(&self) -> u64 {
        1u64 << self.memory_size_bits
    }

    /// Number of pages in the in-memory ring
    #[inline]
    pub fn buffer_pages(&self) -> u64 {
        1u64 << (self.memory_size_bits - self.page_size_bits)
    }

    /// Segment size in bytes
    #[inline]
    pub fn segment_size(&self) -> u64 {
        1u64 << self.segment_size_bits
    }

    /// Validate the settings before any allocator state is built.
    pub fn validate(&self) -> Result<(), LogError> {
        if self.page_size_bits < 9 || self.page_size_bits > 30 {
            return Err(LogError::config(format!(
                "page_size_bits must be in [9, 30], got {}",
                self.page_size_bits
            )));
        }
        if self.memory_size_bits <= self.page_size_bits {
            return Err(LogError::config(format!(
                "memory_size_bits ({}) must exceed page_size_bits ({}) so the ring holds at least two pages",
                self.memory_size_bits, self.page_size_bits
            )));
        }
        if self.memory_size_bits > 40 {
            return Err(LogError::config(format!(
                "memory_size_bits must be at most 40, got {}",
                self.memory_size_bits
            )));
        }
        if self.segment_size_bits < self.page_size_bits {
            return Err(LogError::config(format!(
                "segment_size_bits ({}) must be at least page_size_bits ({})",
                self.segment_size_bits, self.page_size_bits
            )));
        }
        if !(self.mutable_fraction > 0.0 && self.mutable_fraction <= 1.0) {
            return Err(LogError::config(format!(
                "mutable_fraction must be in (0, 1], got {}",
                self.mutable_fraction
            )));
        }
        Ok(())
    }
}

/// Errors returned by configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// I/O error while reading config files.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// TOML parse error.
    #[error("toml parse error: {0}")]
    Toml(#[from] toml::de::Error),
    /// Invalid value for a key.
    #[error("invalid value for {key}: {value}")]
    InvalidValue {
        /// Configuration key.
        key: String,
        /// Raw value string.
        value: String,
    },
    /// Unknown configuration key.
    #[error("unknown config key: {0}")]
    UnknownKey(String),
}

/// Top-level configuration schema.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PagelogConfig {
    /// Log settings section.
    pub log: Option<LogConfigSpec>,
}

/// `[log]` section of the configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogConfigSpec {
    /// Ring size as 2^N bytes.
    pub memory_size_bits: Option<u32>,
    /// Page size as 2^N bytes.
    pub page_size_bits: Option<u32>,
    /// Segment size as 2^N bytes.
    pub segment_size_bits: Option<u32>,
    /// Mutable fraction of the ring.
    pub mutable_fraction: Option<f64>,
    /// Commit metadata file path.
    pub commit_path: Option<PathBuf>,
}

impl PagelogConfig {
    /// Load configuration from a TOML file.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Load configuration from the `PAGELOG_CONFIG` env var (if set),
    /// then apply `PAGELOG__log__field` overrides.
    pub fn load_from_env() -> Result<Self, ConfigError> {
        let config_path = env::var("PAGELOG_CONFIG").ok();
        let mut config = match config_path {
            Some(path) => Self::load_from_path(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Apply environment overrides in-place.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        for (key, value) in env::vars() {
            if !key.starts_with("PAGELOG__") {
                continue;
            }
            let path = key["PAGELOG__".len()..].to_ascii_lowercase();
            let parts: Vec<&str> = path.split("__").collect();
            let value = value.trim().to_string();

            match parts.as_slice() {
                ["log", "memory_size_bits"] => {
                    self.log_mut().memory_size_bits = Some(parse_value(&key, &value)?);
                }
                ["log", "page_size_bits"] => {
                    self.log_mut().page_size_bits = Some(parse_value(&key, &value)?);
                }
                ["log", "segment_size_bits"] => {
                    self.log_mut().segment_size_bits = Some(parse_value(&key, &value)?);
                }
                ["log", "mutable_fraction"] => {
                    self.log_mut().mutable_fraction = Some(parse_value(&key, &value)?);
                }
                ["log", "commit_path"] => {
                    self.log_mut().commit_path = Some(PathBuf::from(value));
                }
                _ => return Err(ConfigError::UnknownKey(key)),
            }
        }

        Ok(())
    }

    /// Build `LogSettings` using defaults plus overrides.
    pub fn to_log_settings(&self) -> LogSettings {
        let mut settings = LogSettings::default();
        if let Some(log) = &self.log {
            if let Some(bits) = log.memory_size_bits {
                settings.memory_size_bits = bits;
            }
            if let Some(bits) = log.page_size_bits {
                settings.page_size_bits = bits;
            }
            if let Some(bits) = log.segment_size_bits {
                settings.segment_size_bits = bits;
            }
            if let Some(fraction) = log.mutable_fraction {
                settings.mutable_fraction = fraction;
            }
            if let Some(path) = &log.commit_path {
                settings.commit_path = Some(path.clone());
            }
        }
        settings
    }

    fn log_mut(&mut self) -> &mut LogConfigSpec {
        self.log.get_or_insert_with(LogConfigSpec::default)
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}
