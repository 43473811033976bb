//! Error taxonomy for a playback session.

use crate::engine::{EngineError, EngineErrorKind};

pub type Result<T> = std::result::Result<T, PlaybackError>;

/// Everything that can end or interrupt a session.  Only `InvalidInput` and
/// `Terminal` ever reach the caller or the UI; the rest are handled inside
/// the controller.
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum PlaybackError {
    /// Bad start request; rejected before touching the engine.
    #[error("{0}")]
    InvalidInput(String),

    /// Playhead fell out of the server's live window.
    #[error("Behind live window: {0}")]
    BehindLiveWindow(String),

    /// Anything else the engine reported; retried with backoff.
    #[error("Transient playback error: {0}")]
    Transient(String),

    /// Retry budget spent on this locator.
    #[error("Source exhausted after retries: {url}")]
    SourceExhausted { url: String },

    /// No way left to recover; shown to the viewer.
    #[error("Playback error: {0}")]
    Terminal(String),

    /// The stream signalled its own end.
    #[error("Stream ended")]
    StreamEnded,
}

impl From<&EngineError> for PlaybackError {
    fn from(err: &EngineError) -> Self {
        match err.kind {
            EngineErrorKind::BehindLiveWindow => {
                PlaybackError::BehindLiveWindow(err.message.clone())
            }
            EngineErrorKind::Other => PlaybackError::Transient(err.message.clone()),
        }
    }
}
