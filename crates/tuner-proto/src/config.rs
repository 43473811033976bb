use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::platform;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub resources: ResourcesConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_http_enabled")]
    pub enabled: bool,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Settings handed to the playback engine when a session is opened.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EngineConfig {
    /// Explicit mpv binary; falls back to `platform::find_mpv_binary()`.
    #[serde(default)]
    pub mpv_binary: Option<PathBuf>,
    #[serde(default)]
    pub buffer: BufferConfig,
    #[serde(default)]
    pub live: LiveConfig,
    #[serde(default)]
    pub network: NetworkConfig,
}

/// Buffering targets, sized for a small set-top device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferConfig {
    /// Buffer the engine tries to keep ahead of the playhead.
    #[serde(default = "default_min_buffer_ms")]
    pub min_buffer_ms: u64,
    /// Upper bound on read-ahead.
    #[serde(default = "default_max_buffer_ms")]
    pub max_buffer_ms: u64,
    /// Buffered media required before playback first starts.
    #[serde(default = "default_buffer_for_playback_ms")]
    pub buffer_for_playback_ms: u64,
    /// Buffered media required to resume after a stall.
    #[serde(default = "default_buffer_after_rebuffer_ms")]
    pub buffer_after_rebuffer_ms: u64,
}

/// Live-edge targets for the engine's own catch-up logic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveConfig {
    #[serde(default = "default_target_offset_ms")]
    pub target_offset_ms: u64,
    #[serde(default = "default_min_offset_ms")]
    pub min_offset_ms: u64,
    #[serde(default = "default_max_offset_ms")]
    pub max_offset_ms: u64,
    #[serde(default = "default_min_speed")]
    pub min_playback_speed: f32,
    #[serde(default = "default_max_speed")]
    pub max_playback_speed: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Per-report HTTP timeout.
    #[serde(default = "default_telemetry_timeout")]
    pub timeout_secs: u64,
    /// Concurrent report uploads.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    /// Reports waiting for an upload slot; overflow is dropped.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourcesConfig {
    /// Hold an idle/sleep inhibitor while a session is active.
    #[serde(default = "default_keep_alive")]
    pub keep_alive: bool,
    /// Lock file marking exclusive ownership of audio output.
    #[serde(default = "default_audio_focus_lock")]
    pub audio_focus_lock: PathBuf,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: default_http_enabled(),
            bind_address: default_bind_address(),
            port: default_port(),
        }
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            min_buffer_ms: default_min_buffer_ms(),
            max_buffer_ms: default_max_buffer_ms(),
            buffer_for_playback_ms: default_buffer_for_playback_ms(),
            buffer_after_rebuffer_ms: default_buffer_after_rebuffer_ms(),
        }
    }
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            target_offset_ms: default_target_offset_ms(),
            min_offset_ms: default_min_offset_ms(),
            max_offset_ms: default_max_offset_ms(),
            min_playback_speed: default_min_speed(),
            max_playback_speed: default_max_speed(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            read_timeout_ms: default_read_timeout_ms(),
        }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_telemetry_timeout(),
            max_in_flight: default_max_in_flight(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl Default for ResourcesConfig {
    fn default() -> Self {
        Self {
            keep_alive: default_keep_alive(),
            audio_focus_lock: default_audio_focus_lock(),
        }
    }
}

impl LiveConfig {
    pub fn target_offset(&self) -> Duration {
        Duration::from_millis(self.target_offset_ms)
    }

    pub fn min_offset(&self) -> Duration {
        Duration::from_millis(self.min_offset_ms)
    }

    /// Drift past this is corrected with a seek rather than a speed-up.
    pub fn max_offset(&self) -> Duration {
        Duration::from_millis(self.max_offset_ms)
    }
}

impl NetworkConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

impl TelemetryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_http_enabled() -> bool {
    true
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8991
}

fn default_min_buffer_ms() -> u64 {
    25_000
}

fn default_max_buffer_ms() -> u64 {
    50_000
}

fn default_buffer_for_playback_ms() -> u64 {
    1_500
}

fn default_buffer_after_rebuffer_ms() -> u64 {
    3_000
}

fn default_target_offset_ms() -> u64 {
    5_000
}

fn default_min_offset_ms() -> u64 {
    2_000
}

fn default_max_offset_ms() -> u64 {
    12_000
}

fn default_min_speed() -> f32 {
    1.0
}

fn default_max_speed() -> f32 {
    1.04
}

fn default_connect_timeout_ms() -> u64 {
    8_000
}

fn default_read_timeout_ms() -> u64 {
    15_000
}

fn default_telemetry_timeout() -> u64 {
    5
}

fn default_max_in_flight() -> usize {
    4
}

fn default_queue_capacity() -> usize {
    256
}

fn default_keep_alive() -> bool {
    true
}

fn default_audio_focus_lock() -> PathBuf {
    platform::data_dir().join("audio-focus.lock")
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(config_path: &std::path::Path) -> anyhow::Result<Self> {
        if !config_path.exists() {
            let config = Self::default();
            config.save_to(config_path)?;
            return Ok(config);
        }

        let content = std::fs::read_to_string(config_path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save_to(&self, config_path: &std::path::Path) -> anyhow::Result<()> {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(config_path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        platform::config_dir().join("config.toml")
    }
}
