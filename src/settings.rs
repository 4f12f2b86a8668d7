use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::audio::PlaythroughConfig;

/// Returns the path to the settings file: `~/.config/playthru/settings.json`
fn settings_path() -> PathBuf {
    let mut path = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
    path.push("playthru");
    path.push("settings.json");
    path
}

/// Persisted application settings.
///
/// Serialized as JSON to the platform config directory.
/// Fields use `#[serde(default)]` so that adding new settings
/// won't break existing config files.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct PlaythroughSettings {
    // Devices (None = host default)
    pub input_device: Option<String>,
    pub output_device: Option<String>,

    // Buffering
    pub buffer_size_frames: u32,
    pub ring_capacity_multiplier: u32,
    pub max_frames_per_slice: usize,

    // Rate matching
    pub max_rate_deviation: f64,

    // Analysis
    pub analysis_enabled: bool,
    pub analysis_window: usize,

    // Reporting
    pub stats_interval_secs: f64,
}

impl Default for PlaythroughSettings {
    fn default() -> Self {
        Self {
            input_device: None,
            output_device: None,

            buffer_size_frames: 512,
            ring_capacity_multiplier: 20,
            max_frames_per_slice: 4096,

            max_rate_deviation: 0.02,

            analysis_enabled: true,
            analysis_window: 4096,

            stats_interval_secs: 2.0,
        }
    }
}

impl PlaythroughSettings {
    /// Load settings from disk, falling back to defaults on any error.
    pub fn load() -> Self {
        let path = settings_path();
        match std::fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(settings) => {
                    log::info!("Loaded settings from {}", path.display());
                    settings
                }
                Err(e) => {
                    log::warn!("Failed to parse settings ({}), using defaults", e);
                    Self::default()
                }
            },
            Err(e) => {
                log::info!("No settings file found ({}), using defaults", e);
                Self::default()
            }
        }
    }

    /// Save settings to disk as pretty JSON.
    pub fn save(&self) {
        let path = settings_path();
        if let Some(parent) = path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                log::warn!("Failed to create config directory: {}", e);
                return;
            }
        }
        match serde_json::to_string_pretty(self) {
            Ok(json) => match std::fs::write(&path, json) {
                Ok(()) => log::info!("Saved settings to {}", path.display()),
                Err(e) => log::warn!("Failed to write settings: {}", e),
            },
            Err(e) => {
                log::warn!("Failed to serialize settings: {}", e);
            }
        }
    }

    /// Session parameters for these settings
    pub fn to_config(&self) -> PlaythroughConfig {
        PlaythroughConfig {
            buffer_size_frames: self.buffer_size_frames.max(1),
            ring_capacity_multiplier: self.ring_capacity_multiplier.max(1),
            max_frames_per_slice: self.max_frames_per_slice.max(1),
            analysis_window: self.analysis_enabled.then_some(self.analysis_window),
            max_rate_deviation: self.max_rate_deviation.abs(),
        }
    }
}
