use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Request to tune into one channel.  Field names follow the JSON used by
/// the channel list front-end (`primaryUrl`, `fallbackUrl`, ...).
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StartRequest {
    pub primary_url: String,
    #[serde(default)]
    pub fallback_url: Option<String>,
    #[serde(default)]
    pub channel_label: Option<String>,
    #[serde(default)]
    pub auth_token: Option<String>,
    #[serde(default)]
    pub report_base_url: Option<String>,
}

/// Playback state as reported by the engine.  The controller reacts to
/// transitions but never owns this value.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum EngineState {
    #[default]
    Idle,
    Buffering,
    Ready,
    Ended,
    Failed,
}

/// Session-level status derived by the controller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum PlaybackStatus {
    #[default]
    Idle, // no session
    Buffering, // preparing, rebuffering, or waiting for a retry
    Playing,   // engine reported Ready
    Ended,     // stream ended; terminal
    Error,     // recovery exhausted; terminal
}

impl PlaybackStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PlaybackStatus::Ended | PlaybackStatus::Error)
    }
}

/// Audio output focus signals delivered by the host.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum FocusChange {
    /// Another owner took audio output for good.
    Loss,
    /// Focus lost for a short while (e.g. notification, call).
    LossTransient,
    /// Focus lost briefly; playing quieter is acceptable.
    LossTransientCanDuck,
    /// Focus (re)granted.
    Gain,
}

impl std::str::FromStr for FocusChange {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "loss" => Ok(FocusChange::Loss),
            "loss-transient" => Ok(FocusChange::LossTransient),
            "loss-transient-can-duck" | "duck" => Ok(FocusChange::LossTransientCanDuck),
            "gain" => Ok(FocusChange::Gain),
            other => anyhow::bail!("unknown focus change '{}'", other),
        }
    }
}

/// What the viewer currently sees.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct UiState {
    pub loading: bool,
    pub error: Option<String>,
    pub channel_overlay: Option<String>,
}

/// Snapshot of the controller, republished after every event.  `rev` is a
/// monotonically increasing counter so readers can detect missed updates.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PlaybackSnapshot {
    #[serde(default)]
    pub rev: u64,
    pub status: PlaybackStatus,
    pub channel_label: Option<String>,
    pub current_url: Option<String>,
    /// True while an unused fallback locator is still available.
    pub fallback_available: bool,
    pub general_retries: u32,
    pub live_window_retries: u32,
    pub volume: f32,
    pub play_when_ready: bool,
    pub last_error: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}
