//! Viewer-facing hooks the controller drives: loading indicator, error
//! banner, channel-name overlay.

use tokio::sync::watch;
use tracing::debug;
use tuner_proto::protocol::UiState;

/// Called on the control thread; implementations must return promptly.
pub trait UiHooks: Send + Sync {
    fn show_loading(&self);
    fn hide_loading(&self);
    fn show_error(&self, message: &str);
    fn hide_error(&self);
    fn show_channel_name(&self, label: &str);
    fn hide_channel_name(&self);
}

/// Publishes the UI state on a watch channel for the HTTP layer and any
/// attached front-end.
pub struct WatchUi {
    tx: watch::Sender<UiState>,
}

impl WatchUi {
    pub fn new() -> (Self, watch::Receiver<UiState>) {
        let (tx, rx) = watch::channel(UiState::default());
        (Self { tx }, rx)
    }

    pub fn subscribe(&self) -> watch::Receiver<UiState> {
        self.tx.subscribe()
    }

    fn update(&self, f: impl FnOnce(&mut UiState) -> bool) {
        self.tx.send_if_modified(f);
    }
}

impl UiHooks for WatchUi {
    fn show_loading(&self) {
        self.update(|s| !std::mem::replace(&mut s.loading, true));
    }

    fn hide_loading(&self) {
        self.update(|s| std::mem::replace(&mut s.loading, false));
    }

    fn show_error(&self, message: &str) {
        debug!("ui: error '{}'", message);
        self.update(|s| {
            s.error = Some(message.to_string());
            true
        });
    }

    fn hide_error(&self) {
        self.update(|s| s.error.take().is_some());
    }

    fn show_channel_name(&self, label: &str) {
        self.update(|s| {
            s.channel_overlay = Some(label.to_string());
            true
        });
    }

    fn hide_channel_name(&self) {
        self.update(|s| s.channel_overlay.take().is_some());
    }
}
