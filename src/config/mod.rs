//! Configuration storage

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::calling::placeholder::PlaceholderConfig;
use crate::calling::session::CallOptions;
use crate::calling::signaling::CallKey;
use crate::calling::transport::{IceServer, RtcConfiguration};
use crate::calling::{CallRole, MediaMode};

fn default_remote_hangup_delay_ms() -> u64 {
    2000
}

fn default_placeholder_width() -> u32 {
    640
}

fn default_placeholder_height() -> u32 {
    480
}

/// Application configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// How long the ended cue plays when the peer hangs up an unanswered call
    #[serde(default = "default_remote_hangup_delay_ms")]
    pub remote_hangup_delay_ms: u64,
    #[serde(default)]
    pub default_media_mode: MediaMode,
    /// Size of the blank frame sent on audio-only calls
    #[serde(default = "default_placeholder_width")]
    pub placeholder_width: u32,
    #[serde(default = "default_placeholder_height")]
    pub placeholder_height: u32,
    /// STUN/TURN servers handed to every new connection
    #[serde(default)]
    pub ice_servers: Vec<IceServer>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            remote_hangup_delay_ms: default_remote_hangup_delay_ms(),
            default_media_mode: MediaMode::default(),
            placeholder_width: default_placeholder_width(),
            placeholder_height: default_placeholder_height(),
            ice_servers: Vec::new(),
        }
    }
}

impl Config {
    /// Get config directory path
    fn config_dir() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("org", "peercall", "peercall")
            .context("Could not determine config directory")?;
        Ok(proj_dirs.config_dir().to_path_buf())
    }

    /// Get config file path
    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load configuration from the default location
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load configuration from `path`; a missing file yields defaults
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse config file")
    }

    /// Save configuration to the default location
    pub fn save(&self) -> Result<PathBuf> {
        let path = Self::config_path()?;
        self.save_to(&path)?;
        Ok(path)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).context("Failed to create config directory")?;
        }
        fs::write(path, self.to_toml()?).context("Failed to write config file")?;
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize config")
    }

    /// Connection configuration, or `None` when no ICE servers are set.
    pub fn rtc_configuration(&self) -> Option<RtcConfiguration> {
        if self.ice_servers.is_empty() {
            return None;
        }
        Some(RtcConfiguration {
            ice_servers: self.ice_servers.clone(),
        })
    }

    pub fn placeholder(&self) -> PlaceholderConfig {
        PlaceholderConfig {
            width: self.placeholder_width,
            height: self.placeholder_height,
        }
    }

    pub fn remote_hangup_delay(&self) -> Duration {
        Duration::from_millis(self.remote_hangup_delay_ms)
    }

    /// Options for a new call session. `mode` overrides the configured
    /// default media mode.
    pub fn call_options(&self, key: CallKey, role: CallRole, mode: Option<MediaMode>) -> CallOptions {
        let mut options = CallOptions::new(key, role, mode.unwrap_or(self.default_media_mode));
        options.rtc_config = self.rtc_configuration();
        options.remote_hangup_delay = self.remote_hangup_delay();
        options.placeholder = self.placeholder();
        options
    }
}
