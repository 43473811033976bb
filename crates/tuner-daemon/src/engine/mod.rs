//! Playback engine contract.
//!
//! The controller never decodes media.  It drives an opaque engine through a
//! handful of commands and consumes the engine's asynchronous reports as
//! tagged `EngineEvent`s funnelled into the controller's single event loop.
//!
//! ```text
//!   SessionController ──commands──▶ dyn Engine (mpv, fake, ...)
//!          ▲                               │
//!          └── ControlEvent::Engine ◀── EngineEvents::emit()
//! ```

pub mod mpv;
pub mod mpv_ipc;

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tuner_proto::config::EngineConfig;
use tuner_proto::protocol::EngineState;

use crate::core::ControlEvent;

/// Error code for an engine whose backing process went away on its own.
pub const ENGINE_EXIT_CODE: &str = "engine-exit";

/// How the controller should treat an engine failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineErrorKind {
    /// The requested position fell outside the server's live window.
    BehindLiveWindow,
    /// Every other cause.
    Other,
}

/// Classified failure reported by the engine.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message}")]
pub struct EngineError {
    pub kind: EngineErrorKind,
    pub message: String,
    /// Engine-specific error code, if any.
    pub code: Option<String>,
    /// Underlying cause, if the engine exposes one.
    pub cause: Option<String>,
}

impl EngineError {
    pub fn behind_live_window(message: impl Into<String>) -> Self {
        Self {
            kind: EngineErrorKind::BehindLiveWindow,
            message: message.into(),
            code: None,
            cause: None,
        }
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self {
            kind: EngineErrorKind::Other,
            message: message.into(),
            code: None,
            cause: None,
        }
    }

    /// The engine died underneath the session; it cannot be re-prepared.
    pub fn engine_exited(message: impl Into<String>) -> Self {
        Self::other(message).with_code(ENGINE_EXIT_CODE)
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_cause(mut self, cause: impl Into<String>) -> Self {
        self.cause = Some(cause.into());
        self
    }

    pub fn is_behind_live_window(&self) -> bool {
        self.kind == EngineErrorKind::BehindLiveWindow
    }

    pub fn is_engine_exit(&self) -> bool {
        self.code.as_deref() == Some(ENGINE_EXIT_CODE)
    }
}

/// Asynchronous report from the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    State(EngineState),
    Error(EngineError),
}

/// Sink handed to an engine at creation.  Every event is tagged with the
/// epoch of the engine instance so the controller can drop reports from an
/// engine it has already torn down.
#[derive(Debug, Clone)]
pub struct EngineEvents {
    tx: mpsc::Sender<ControlEvent>,
    epoch: u64,
}

impl EngineEvents {
    pub fn new(tx: mpsc::Sender<ControlEvent>, epoch: u64) -> Self {
        Self { tx, epoch }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Forward an event to the controller.  Returns false once the
    /// controller loop is gone.
    pub async fn emit(&self, event: EngineEvent) -> bool {
        self.tx
            .send(ControlEvent::Engine {
                epoch: self.epoch,
                event,
            })
            .await
            .is_ok()
    }
}

/// Commands the controller issues to a live engine instance.
///
/// Implementations must not block: long operations belong on the engine's
/// own tasks, with results reported back through `EngineEvents`.
#[async_trait]
pub trait Engine: Send {
    /// (Re)open the configured locator.  Outcome arrives as events.
    async fn prepare(&mut self) -> anyhow::Result<()>;

    async fn set_play_when_ready(&mut self, play: bool) -> anyhow::Result<()>;

    /// Jump to the engine's default live position.
    async fn seek_to_default_position(&mut self) -> anyhow::Result<()>;

    /// Output volume, 0.0..=1.0.
    async fn set_volume(&mut self, volume: f32) -> anyhow::Result<()>;

    /// Distance behind the live edge; `None` when the item is not live or
    /// the engine cannot tell yet.
    async fn live_offset(&mut self) -> Option<Duration>;

    /// Stop playback and free the engine.  Called exactly once per instance.
    async fn release(&mut self);
}

/// Builds engine instances, one per locator.  A fallback switch tears the
/// old instance down and asks the factory for a new one.
#[async_trait]
pub trait EngineFactory: Send + Sync {
    async fn create(
        &self,
        url: &str,
        config: &EngineConfig,
        events: EngineEvents,
    ) -> anyhow::Result<Box<dyn Engine>>;
}

/// Keep URLs readable in logs and telemetry.
pub fn truncate_url(url: &str) -> &str {
    const MAX_URL_CHARS: usize = 120;
    match url.char_indices().nth(MAX_URL_CHARS) {
        Some((idx, _)) => &url[..idx],
        None => url,
    }
}
