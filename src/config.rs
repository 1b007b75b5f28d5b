//! Application configuration
//!
//! All tuning knobs live here so nothing protocol-critical is an embedded
//! literal. Configuration round-trips through TOML; `load_or_default`
//! falls back to defaults when no file exists yet.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::audio::format::AudioFormat;
use crate::error::{Error, Result};

/// Network ports and socket tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// UDP port for audio packets
    pub audio_port: u16,
    /// TCP port for the control channel
    pub control_port: u16,
    /// UDP port for discovery broadcasts
    pub discovery_port: u16,
    /// OS receive buffer for the audio socket, in bytes
    pub recv_buffer_size: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            audio_port: crate::constants::DEFAULT_AUDIO_PORT,
            control_port: crate::constants::DEFAULT_CONTROL_PORT,
            discovery_port: crate::constants::DEFAULT_DISCOVERY_PORT,
            recv_buffer_size: 1024 * 1024,
        }
    }
}

/// Jitter buffer tuning
///
/// No single value is right for every network, so depth and both
/// sequence windows are configuration rather than constants.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct JitterConfig {
    /// Packets buffered before the first release (latency vs. reorder
    /// tolerance)
    pub playout_depth: usize,
    /// Max modular distance treated as a recoverable gap
    pub ahead_window: u32,
    /// Packets further than this behind the release cursor are purged
    pub behind_window: u32,
}

impl Default for JitterConfig {
    fn default() -> Self {
        Self {
            playout_depth: 5,
            ahead_window: 10,
            behind_window: 100,
        }
    }
}

/// Outgoing audio shaping
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioSettings {
    /// PCM format pushed by the capture collaborator
    pub format: AudioFormat,
    /// Gain multiplier applied before framing; 1.0 is unity
    pub gain: f32,
    /// Downmix 16-bit stereo capture to mono before sending
    pub downmix_to_mono: bool,
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            format: AudioFormat::default(),
            gain: 1.0,
            downmix_to_mono: false,
        }
    }
}

/// Discovery presence timing
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Interval between expiry sweeps
    pub sweep_interval_ms: u64,
    /// Silence after which a device is considered lost
    pub device_timeout_ms: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            sweep_interval_ms: 5_000,
            device_timeout_ms: 30_000,
        }
    }
}

/// Top-level session configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub network: NetworkConfig,
    pub audio: AudioSettings,
    pub jitter: JitterConfig,
    pub discovery: DiscoveryConfig,
}

impl SessionConfig {
    /// Parse a TOML config file
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        toml::from_str(&contents).map_err(|e| Error::Config(e.to_string()))
    }

    /// Write the config as TOML
    pub fn save(&self, path: &Path) -> Result<()> {
        let contents =
            toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Load from the platform config directory, falling back to defaults
    pub fn load_or_default() -> Self {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path).unwrap_or_else(|e| {
                tracing::warn!("Failed to load config from {}: {}", path.display(), e);
                Self::default()
            }),
            _ => Self::default(),
        }
    }

    /// Platform config file location
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "lan-mic-relay")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.network.audio_port, 5000);
        assert_eq!(config.network.control_port, 5001);
        assert_eq!(config.network.discovery_port, 5002);
        assert_eq!(config.jitter.playout_depth, 5);
        assert_eq!(config.jitter.ahead_window, 10);
        assert_eq!(config.jitter.behind_window, 100);
        assert_eq!(config.discovery.device_timeout_ms, 30_000);
        assert_eq!(config.audio.gain, 1.0);
    }

    #[test]
    fn test_toml_roundtrip() {
        let mut config = SessionConfig::default();
        config.network.audio_port = 6000;
        config.jitter.playout_depth = 8;
        config.audio.downmix_to_mono = true;

        let toml = toml::to_string_pretty(&config).unwrap();
        let parsed: SessionConfig = toml::from_str(&toml).unwrap();
        assert_eq!(parsed.network.audio_port, 6000);
        assert_eq!(parsed.jitter.playout_depth, 8);
        assert!(parsed.audio.downmix_to_mono);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let parsed: SessionConfig = toml::from_str(
            r#"
            [network]
            audio_port = 7000
            control_port = 7001
            discovery_port = 7002
            recv_buffer_size = 65536
            "#,
        )
        .unwrap();
        assert_eq!(parsed.network.audio_port, 7000);
        assert_eq!(parsed.jitter.playout_depth, 5);
    }
}
