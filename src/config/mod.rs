//! Configuration management for the buffer host
//!
//! This module handles loading, parsing, and validating configuration
//! from TOML files. It combines settings for surface submission pacing,
//! protocol strictness and presentation feedback.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Upper bound for the release stall timeout (one minute)
const MAX_STALL_TIMEOUT_MS: u64 = 60_000;

/// Main configuration struct containing all buffer host settings
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct HostConfig {
    /// General settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// Per-surface submission behaviour
    #[serde(default)]
    pub surface: SurfaceConfig,

    /// Presentation feedback settings
    #[serde(default)]
    pub presentation: PresentationConfig,
}

/// General settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct GeneralConfig {
    /// Enable debug logging
    pub debug: bool,
}

/// Per-surface submission behaviour
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SurfaceConfig {
    /// Hold the next commit until the compositor answers the previous frame callback
    pub throttle_on_frame_callback: bool,

    /// Panic on client precondition violations instead of returning an error
    #[serde(default)]
    pub abort_on_violation: bool,

    /// Compositor faults tolerated before the surface is torn down
    #[serde(default = "SurfaceConfig::default_max_protocol_faults")]
    pub max_protocol_faults: u32,

    /// Warn when a submission waits longer than this for a release (milliseconds)
    #[serde(default = "SurfaceConfig::default_release_stall_timeout")]
    pub release_stall_timeout_ms: u64,
}

/// Presentation feedback settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PresentationConfig {
    /// The compositor advertises presentation-time feedback.
    /// When false, a synthetic feedback follows every submission.
    pub enabled: bool,
}

impl Default for SurfaceConfig {
    fn default() -> Self {
        Self {
            throttle_on_frame_callback: true,
            abort_on_violation: false,
            max_protocol_faults: Self::default_max_protocol_faults(),
            release_stall_timeout_ms: Self::default_release_stall_timeout(),
        }
    }
}

impl SurfaceConfig {
    fn default_max_protocol_faults() -> u32 {
        8
    }
    fn default_release_stall_timeout() -> u64 {
        1000
    }

    pub fn release_stall_timeout(&self) -> Duration {
        Duration::from_millis(self.release_stall_timeout_ms)
    }
}

impl Default for PresentationConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl HostConfig {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        // Expand ~ to home directory
        let expanded_path = if path.to_string_lossy().starts_with('~') {
            let home = std::env::var("HOME").context("Failed to get HOME environment variable")?;
            let relative = path.strip_prefix("~").unwrap_or(path);
            Path::new(&home).join(relative)
        } else {
            path.to_path_buf()
        };

        let contents = fs::read_to_string(&expanded_path)
            .with_context(|| format!("Failed to read config file: {}", expanded_path.display()))?;

        let config: HostConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", expanded_path.display()))?;

        config.validate()?;

        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.surface.max_protocol_faults == 0 {
            anyhow::bail!("Invalid max_protocol_faults: must be at least 1");
        }

        let timeout = self.surface.release_stall_timeout_ms;
        if timeout == 0 || timeout > MAX_STALL_TIMEOUT_MS {
            anyhow::bail!(
                "Invalid release_stall_timeout_ms: must be between 1 and {}",
                MAX_STALL_TIMEOUT_MS
            );
        }

        Ok(())
    }

    /// Save configuration to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        fs::write(path, contents).context("Failed to write configuration file")?;

        Ok(())
    }

    /// Merge a partial configuration into this one
    /// Non-default sections from the partial config override this config
    pub fn merge_partial(mut self, partial: HostConfig) -> Self {
        let default_config = HostConfig::default();

        if partial.general != default_config.general {
            self.general = partial.general;
        }
        if partial.surface != default_config.surface {
            self.surface = partial.surface;
        }
        if partial.presentation != default_config.presentation {
            self.presentation = partial.presentation;
        }

        self
    }
}
