//! Client configuration.
//!
//! Loaded from `parlor.toml` under the platform config directory, with
//! every field defaulting so a missing file means a usable local-dev
//! setup. CLI flags override the file.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Connection settings for the room service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// WebSocket endpoint for the duplex event channel.
    pub ws_url: String,
    /// Base URL for the HTTP collaborators (room catalog).
    pub api_url: String,
    /// Bounded reconnect budget.
    pub reconnect_attempts: u32,
    /// Fixed backoff between attempts, milliseconds.
    pub reconnect_delay_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            ws_url: "ws://localhost:5000/ws".into(),
            api_url: "http://localhost:5000".into(),
            reconnect_attempts: 5,
            reconnect_delay_ms: 1000,
        }
    }
}

/// Capture settings. The countdown and playback need no tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Target capture sample rate. The device's native rate is used when
    /// it refuses this one; the payload header carries whichever won.
    pub sample_rate: u32,
    /// Chunk interval for buffering during a gesture, milliseconds.
    pub chunk_interval_ms: u64,
    /// Minimum gesture length; shorter gestures are stretched to this.
    pub min_utterance_ms: u64,
    /// Minimum raw payload size before a recording is worth transporting.
    pub min_payload_bytes: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            chunk_interval_ms: 250,
            min_utterance_ms: 1000,
            min_payload_bytes: 8000,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub audio: AudioConfig,
}

impl Config {
    /// Default config file path under the platform config directory.
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "parlor")
            .map(|dirs| dirs.config_dir().join("parlor.toml"))
    }

    /// Load from the default location; a missing file yields defaults.
    pub fn load() -> anyhow::Result<Self> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load_from(&path),
            _ => Ok(Self::default()),
        }
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config = toml::from_str(&text)?;
        tracing::debug!(path = %path.display(), "loaded config");
        Ok(config)
    }
}
