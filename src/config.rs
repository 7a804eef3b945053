// src/config.rs

use crate::models::{DownloadConstraints, DownloadTarget, MediaContentType, SourceType};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(&'static str),
}

/// Whether one download runs with a resume prompt, or two staggered
/// downloads run from a clean slate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
pub enum DownloadMode {
    #[default]
    Single,
    Parallel {
        secondary_dir: PathBuf,
        /// Seconds between the first and the second download.
        #[serde(default = "default_stagger_secs")]
        stagger_secs: u64,
    },
}

fn default_stagger_secs() -> u64 {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct LicenseSettings {
    pub data_dir: PathBuf,
    pub token_path: PathBuf,
    #[serde(default = "default_license_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_license_timeout_secs() -> u64 {
    30
}

impl LicenseSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for LicenseSettings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("license"),
            token_path: PathBuf::from("assets/token.xml"),
            timeout_secs: default_license_timeout_secs(),
        }
    }
}

/// Everything needed to bootstrap a coordinator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct CoordinatorConfig {
    /// The directory treated as authoritative for resume detection and playback.
    pub primary_dir: PathBuf,
    pub target: DownloadTarget,
    #[serde(default)]
    pub content_type: Option<MediaContentType>,
    #[serde(default)]
    pub constraints: DownloadConstraints,
    #[serde(default)]
    pub mode: DownloadMode,
    /// Report a stall after this many seconds without backend notifications.
    #[serde(default)]
    pub stall_timeout_secs: Option<u64>,
    #[serde(default)]
    pub license: LicenseSettings,
    #[serde(default = "default_ledger_path")]
    pub ledger_path: PathBuf,
}

fn default_ledger_path() -> PathBuf {
    PathBuf::from("downloads.db")
}

impl CoordinatorConfig {
    pub fn new(primary_dir: impl Into<PathBuf>, target: DownloadTarget) -> Self {
        Self {
            primary_dir: primary_dir.into(),
            target,
            content_type: None,
            constraints: DownloadConstraints::default(),
            mode: DownloadMode::Single,
            stall_timeout_secs: None,
            license: LicenseSettings::default(),
            ledger_path: default_ledger_path(),
        }
    }

    /// Loads and validates a JSON config file.
    pub async fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.target.media_file_name().is_empty() {
            return Err(ConfigError::Invalid("target.media_file_name is empty"));
        }
        if self.constraints.max_connections == 0 {
            return Err(ConfigError::Invalid("constraints.max_connections must be at least 1"));
        }
        if let DownloadMode::Parallel { secondary_dir, .. } = &self.mode {
            if secondary_dir == &self.primary_dir {
                return Err(ConfigError::Invalid("secondary_dir must differ from primary_dir"));
            }
        }
        Ok(())
    }

    pub fn stall_timeout(&self) -> Option<Duration> {
        self.stall_timeout_secs.map(Duration::from_secs)
    }

    /// Falls back to the manifest kind, then to fragmented MP4.
    pub fn content_type(&self) -> MediaContentType {
        self.content_type.unwrap_or(match self.target.source_type() {
            SourceType::Dash | SourceType::SingleFile => MediaContentType::M4f,
            SourceType::Hls => MediaContentType::Hls,
        })
    }

    /// Where the configured media file lands in the primary directory.
    pub fn offline_media_path(&self) -> PathBuf {
        self.primary_dir.join(self.target.media_file_name())
    }
}
