//! Rig configuration file
//!
//! One TOML file describes the capture tunables and every receiver channel.
//! A channel may drive a servo; without a `[channels.servo]` table it is only
//! monitored.
//!
//! ```toml
//! [capture]
//! average_window_ms = 200
//!
//! [[channels]]
//! name = "turret"
//! input_line = 17
//! pull = "down"
//! input_mode = "latest"
//!
//! [channels.servo]
//! max_speed_us_per_sec = 500.0
//! max_accel_us_per_sec2 = 2000.0
//! update_rate_hz = 50
//! input_range = { min_us = 1000, max_us = 2000 }
//! output_range = { min_us = 800, max_us = 2200 }
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use color_eyre::eyre::eyre;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::capture::CaptureSettings;
use crate::error::HelifxError;
use crate::gpio::{validate_line, Pull};
use crate::orchestrator::InputMode;
use crate::servo::{MotionConfig, PulseRange};

pub const CONFIG_DIR: &str = ".helifx";
pub const CONFIG_FILE: &str = "config.toml";

/// `[capture]` table
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct CaptureConfig {
    pub max_monitors: usize,
    pub sample_capacity: usize,
    pub average_window_ms: u64,
    pub wait_timeout_ms: u64,
    pub idle_sleep_ms: u64,
    pub stats_interval_secs: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        let settings = CaptureSettings::default();
        Self {
            max_monitors: settings.max_monitors,
            sample_capacity: settings.sample_capacity,
            average_window_ms: millis(settings.average_window),
            wait_timeout_ms: millis(settings.wait_timeout),
            idle_sleep_ms: millis(settings.idle_sleep),
            stats_interval_secs: settings.stats_interval.as_secs(),
        }
    }
}

impl CaptureConfig {
    pub fn to_settings(&self) -> CaptureSettings {
        CaptureSettings {
            max_monitors: self.max_monitors,
            sample_capacity: self.sample_capacity,
            average_window: Duration::from_millis(self.average_window_ms),
            wait_timeout: Duration::from_millis(self.wait_timeout_ms),
            idle_sleep: Duration::from_millis(self.idle_sleep_ms),
            stats_interval: Duration::from_secs(self.stats_interval_secs),
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// One `[[channels]]` entry
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct ChannelConfig {
    pub name: String,
    pub input_line: u8,
    /// Bias resistor on the input line
    #[serde(default)]
    pub pull: Pull,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default)]
    pub input_mode: InputMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub servo: Option<MotionConfig>,
}

impl ChannelConfig {
    /// Label used for the monitor; falls back to the channel name
    pub fn monitor_label(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct RigConfig {
    pub capture: CaptureConfig,
    pub channels: Vec<ChannelConfig>,
}

impl RigConfig {
    /// Starter rig written on first run: one turret servo on line 17
    pub fn starter() -> Self {
        Self {
            capture: CaptureConfig::default(),
            channels: vec![ChannelConfig {
                name: "turret".to_string(),
                input_line: 17,
                pull: Pull::Down,
                label: Some("Turret".to_string()),
                input_mode: InputMode::Latest,
                servo: Some(MotionConfig {
                    max_speed_us_per_sec: 500.0,
                    max_accel_us_per_sec2: 2000.0,
                    update_rate_hz: 50,
                    input_range: PulseRange::new(1000, 2000),
                    output_range: PulseRange::new(800, 2200),
                }),
            }],
        }
    }

    pub fn default_path() -> PathBuf {
        let mut path = get_home_dir();
        path.push(CONFIG_DIR);
        path.push(CONFIG_FILE);
        path
    }

    pub fn from_toml_str(content: &str) -> color_eyre::Result<Self> {
        toml::from_str(content).map_err(|e| eyre!("Failed to parse rig config: {}", e))
    }

    pub fn to_toml_string(&self) -> color_eyre::Result<String> {
        toml::to_string_pretty(self).map_err(|e| eyre!("Failed to serialize rig config: {}", e))
    }

    /// Checks channel lines, names and servo parameters
    pub fn validate(&self) -> crate::Result<()> {
        self.capture.to_settings().validate()?;

        if self.channels.len() > self.capture.max_monitors {
            return Err(HelifxError::InvalidArgument(format!(
                "{} channels configured but only {} monitors allowed",
                self.channels.len(),
                self.capture.max_monitors
            )));
        }

        let mut names = HashSet::new();
        let mut lines = HashSet::new();
        for channel in &self.channels {
            if channel.name.trim().is_empty() {
                return Err(HelifxError::InvalidArgument(
                    "channel name must not be empty".to_string(),
                ));
            }
            if !names.insert(channel.name.as_str()) {
                return Err(HelifxError::InvalidArgument(format!(
                    "duplicate channel name '{}'",
                    channel.name
                )));
            }
            validate_line(channel.input_line)?;
            if !lines.insert(channel.input_line) {
                return Err(HelifxError::InvalidArgument(format!(
                    "line {} used by more than one channel",
                    channel.input_line
                )));
            }
            if let Some(servo) = &channel.servo {
                servo.validate().map_err(|e| {
                    HelifxError::InvalidArgument(format!("channel '{}': {}", channel.name, e))
                })?;
            }
        }
        Ok(())
    }

    /// Reads the rig file; a missing file yields the starter rig
    pub async fn load(path: &Path) -> color_eyre::Result<Self> {
        if !tokio::fs::try_exists(path)
            .await
            .map_err(|e| eyre!("Failed to check if rig config exists: {}", e))?
        {
            warn!(
                "Rig config {} does not exist, using starter rig",
                path.display()
            );
            return Ok(Self::starter());
        }

        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| eyre!("Failed to read rig config {}: {}", path.display(), e))?;
        let config = Self::from_toml_str(&content)?;
        info!(
            "Loaded rig config {} with {} channels",
            path.display(),
            config.channels.len()
        );
        Ok(config)
    }

    pub async fn save(&self, path: &Path) -> color_eyre::Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| eyre!("Failed to create config directory: {}", e))?;
        }
        let content = self.to_toml_string()?;
        tokio::fs::write(path, content)
            .await
            .map_err(|e| eyre!("Failed to write rig config {}: {}", path.display(), e))?;
        debug!("Rig config written to {}", path.display());
        Ok(())
    }

    /// Writes the starter rig if no file exists at `path`
    pub async fn ensure_default_config(path: &Path) -> color_eyre::Result<()> {
        if tokio::fs::try_exists(path)
            .await
            .map_err(|e| eyre!("Failed to check if rig config exists: {}", e))?
        {
            return Ok(());
        }
        Self::starter().save(path).await?;
        info!("Created starter rig config at {}", path.display());
        Ok(())
    }
}

fn get_home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| {
        warn!("Could not determine home directory, using current directory");
        PathBuf::from(".")
    })
}
