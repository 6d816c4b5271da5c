//! Application settings structs, defaults and TOML persistence.
//!
//! All structs implement `Serialize`, `Deserialize`, `Default` and `Clone`
//! so they can be round-tripped through TOML files and shared across threads.

use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use super::AppPaths;

// ---------------------------------------------------------------------------
// ServerConfig
// ---------------------------------------------------------------------------

/// Signaling server endpoint and reconnection policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// WebSocket endpoint, e.g. `ws://localhost:8000/ws`.
    pub url: String,
    /// Fixed delay before each reconnection attempt after an unexpected close.
    pub reconnect_delay_ms: u64,
    /// Consecutive failed attempts after which reconnection stops.
    ///
    /// `None` retries forever.
    pub max_reconnect_attempts: Option<u32>,
    /// Depth of the outbound frame queue between callers and the socket task.
    pub outbound_queue: usize,
    /// Environment variable consulted first for the bearer token.
    pub token_env: String,
}

impl ServerConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:8000/ws".into(),
            reconnect_delay_ms: 3_000,
            max_reconnect_attempts: None,
            outbound_queue: 64,
            token_env: "VOICE_CALL_TOKEN".into(),
        }
    }
}

// ---------------------------------------------------------------------------
// CaptureMode
// ---------------------------------------------------------------------------

/// How captured audio is framed for transmission.
///
/// | Variant | Frame                                             |
/// |---------|---------------------------------------------------|
/// | Pcm     | `pcm_block_size` samples as 16-bit little-endian  |
/// | Blob    | one WAV container per `blob_interval_ms`          |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureMode {
    Pcm,
    Blob,
}

impl Default for CaptureMode {
    fn default() -> Self {
        Self::Pcm
    }
}

// ---------------------------------------------------------------------------
// AudioConfig
// ---------------------------------------------------------------------------

/// Settings for audio capture, transmission and playback.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub capture_mode: CaptureMode,
    /// Sample rate of every frame on the wire, in Hz.
    pub wire_sample_rate: u32,
    /// Samples per frame in PCM mode.
    pub pcm_block_size: usize,
    /// Frame length in Blob mode.
    pub blob_interval_ms: u64,
    /// Input device name; `None` means the system default.
    pub input_device: Option<String>,
    /// Output device name; `None` means the system default.
    pub output_device: Option<String>,
    /// Seconds of decoded audio the playback queue may hold before the oldest
    /// samples are discarded.
    pub playback_buffer_secs: f32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            capture_mode: CaptureMode::default(),
            wire_sample_rate: 16_000,
            pcm_block_size: 4_096,
            blob_interval_ms: 1_000,
            input_device: None,
            output_device: None,
            playback_buffer_secs: 2.0,
        }
    }
}

// ---------------------------------------------------------------------------
// IceConfig
// ---------------------------------------------------------------------------

/// ICE servers handed to every new peer session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IceConfig {
    pub stun_servers: Vec<String>,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec!["stun:stun.l.google.com:19302".into()],
        }
    }
}

// ---------------------------------------------------------------------------
// HotkeyConfig
// ---------------------------------------------------------------------------

/// Global hotkey bindings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HotkeyConfig {
    pub enabled: bool,
    /// Key that toggles mute (e.g. `"F8"`).
    pub mute_key: String,
}

impl Default for HotkeyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mute_key: "F8".into(),
        }
    }
}

// ---------------------------------------------------------------------------
// UiConfig
// ---------------------------------------------------------------------------

/// egui window settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UiConfig {
    /// Last saved window position `(x, y)` in screen pixels.
    pub window_position: Option<(f32, f32)>,
    pub always_on_top: bool,
}

impl Default for UiConfig {
    fn default() -> Self {
        Self {
            window_position: None,
            always_on_top: false,
        }
    }
}

// ---------------------------------------------------------------------------
// AppConfig  (top-level)
// ---------------------------------------------------------------------------

/// Top-level application configuration, serialised as `settings.toml`.
///
/// ```rust,no_run
/// use voice_call::config::AppConfig;
///
/// // Returns Default when the file is missing
/// let config = AppConfig::load().unwrap();
/// assert!(config.server.url.starts_with("ws"));
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub audio: AudioConfig,
    pub ice: IceConfig,
    pub hotkey: HotkeyConfig,
    pub ui: UiConfig,
}

impl AppConfig {
    /// Load configuration from the platform-appropriate `settings.toml`.
    ///
    /// Returns `Ok(AppConfig::default())` when the file does not exist yet.
    pub fn load() -> Result<Self> {
        Self::load_from(&AppPaths::new().settings_file)
    }

    /// Load from an explicit path (useful for tests).
    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to the platform-appropriate `settings.toml`,
    /// creating parent directories as needed.
    pub fn save(&self) -> Result<()> {
        self.save_to(&AppPaths::new().settings_file)
    }

    /// Save to an explicit path (useful for tests).
    pub fn save_to(&self, path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn load_missing_returns_default() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("nonexistent.toml");

        let config = AppConfig::load_from(&path).expect("should not error");
        assert_eq!(config.server.url, ServerConfig::default().url);
        assert_eq!(config.audio.capture_mode, CaptureMode::Pcm);
    }

    #[test]
    fn defaults() {
        let cfg = AppConfig::default();

        assert_eq!(cfg.server.reconnect_delay(), Duration::from_secs(3));
        assert!(cfg.server.max_reconnect_attempts.is_none());
        assert_eq!(cfg.server.token_env, "VOICE_CALL_TOKEN");
        assert_eq!(cfg.audio.wire_sample_rate, 16_000);
        assert_eq!(cfg.audio.blob_interval_ms, 1_000);
        assert_eq!(cfg.hotkey.mute_key, "F8");
        assert_eq!(cfg.ice.stun_servers.len(), 1);
    }

    #[test]
    fn modified_values_survive_save_and_load() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("nested").join("settings.toml");

        let mut cfg = AppConfig::default();
        cfg.server.url = "wss://calls.example.com/ws".into();
        cfg.server.max_reconnect_attempts = Some(5);
        cfg.audio.capture_mode = CaptureMode::Blob;
        cfg.audio.input_device = Some("USB Mic".into());
        cfg.ui.window_position = Some((10.0, 20.0));

        cfg.save_to(&path).expect("save");
        let loaded = AppConfig::load_from(&path).expect("load");

        assert_eq!(loaded.server.url, "wss://calls.example.com/ws");
        assert_eq!(loaded.server.max_reconnect_attempts, Some(5));
        assert_eq!(loaded.audio.capture_mode, CaptureMode::Blob);
        assert_eq!(loaded.audio.input_device.as_deref(), Some("USB Mic"));
        assert_eq!(loaded.ui.window_position, Some((10.0, 20.0)));
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("settings.toml");
        std::fs::write(&path, "[server]\nurl = \"ws://10.0.0.2:9000/ws\"\n").unwrap();

        let loaded = AppConfig::load_from(&path).expect("load");
        assert_eq!(loaded.server.url, "ws://10.0.0.2:9000/ws");
        assert_eq!(loaded.server.reconnect_delay_ms, 3_000);
        assert_eq!(loaded.audio.pcm_block_size, 4_096);
    }
}
