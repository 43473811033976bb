//! `Engine` implementation backed by an mpv child process.
//!
//! mpv integration is property-observation-driven, like the IPC driver it
//! sits on: `paused-for-cache` plus the `start-file` / `playback-restart` /
//! `end-file` events are folded by `MpvStateTracker` into `EngineState`
//! transitions and classified errors.
//!
//! mpv has no live-latency controller of its own, so each engine runs a
//! once-a-second sync task that nudges `speed` toward the configured live
//! offset and seeks back once drift passes the window.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use tuner_proto::config::{EngineConfig, LiveConfig};
use tuner_proto::protocol::EngineState;

use super::mpv_ipc::{MpvEvent, MpvHandle, MpvProcess};
use super::{Engine, EngineError, EngineEvent, EngineEvents, EngineFactory};
use crate::live_edge::{live_correction, LiveCorrection};

pub const OBS_PAUSED_FOR_CACHE: u64 = 1;

const LIVE_SYNC_INTERVAL: Duration = Duration::from_secs(1);

/// Smallest speed change worth an IPC round-trip.
const SPEED_STEP: f64 = 0.005;

fn secs(ms: u64) -> String {
    format!("{:.1}", ms as f64 / 1000.0)
}

/// Substrings of mpv/ffmpeg error text that mean the playhead fell out of
/// the playlist's live window.
const BEHIND_LIVE_PATTERNS: &[&str] = &[
    "behind live window",
    "expired from playlist",
    "outside the live window",
];

/// Translate the engine settings into mpv command-line options.
pub fn mpv_args(config: &EngineConfig) -> Vec<String> {
    let buffer = &config.buffer;
    // mpv has a single network timeout; use the longer read bound so a slow
    // segment is not cut off at the connect limit.
    let network_timeout = config
        .network
        .read_timeout()
        .max(config.network.connect_timeout());
    vec![
        "--cache=yes".to_string(),
        format!("--demuxer-readahead-secs={}", secs(buffer.min_buffer_ms)),
        format!("--cache-secs={}", secs(buffer.max_buffer_ms)),
        // start threshold; raised to the rebuffer threshold after first playback
        "--cache-pause-initial=yes".to_string(),
        format!("--cache-pause-wait={}", secs(buffer.buffer_for_playback_ms)),
        format!("--network-timeout={}", network_timeout.as_secs()),
        "--keep-open=no".to_string(),
    ]
}

/// Classify an mpv `end-file` error.
pub fn classify_file_error(reason: &str, file_error: Option<&str>) -> EngineError {
    let text = file_error.unwrap_or("unknown error");
    let lower = text.to_ascii_lowercase();
    let err = if BEHIND_LIVE_PATTERNS.iter().any(|p| lower.contains(p)) {
        EngineError::behind_live_window(text)
    } else {
        EngineError::other(text)
    };
    err.with_code(format!("end-file:{}", reason))
        .with_cause(text)
}

/// Folds raw mpv events into engine state transitions.
#[derive(Debug, Default)]
pub struct MpvStateTracker {
    state: EngineState,
    loaded: bool,
}

impl MpvStateTracker {
    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn on_event(&mut self, evt: &MpvEvent) -> Option<EngineEvent> {
        if let Some((id, data)) = evt.as_property_change() {
            return match id {
                OBS_PAUSED_FOR_CACHE => match data.as_bool() {
                    Some(true) => self.transition(EngineState::Buffering),
                    Some(false) if self.loaded => self.transition(EngineState::Ready),
                    _ => None,
                },
                _ => None,
            };
        }

        match evt.event_name()? {
            "start-file" => {
                self.loaded = false;
                self.transition(EngineState::Buffering)
            }
            "playback-restart" => {
                self.loaded = true;
                self.transition(EngineState::Ready)
            }
            "end-file" => {
                self.loaded = false;
                match evt.str_field("reason").unwrap_or("") {
                    "eof" => self.transition(EngineState::Ended),
                    "error" => {
                        self.state = EngineState::Failed;
                        Some(EngineEvent::Error(classify_file_error(
                            "error",
                            evt.str_field("file_error"),
                        )))
                    }
                    // stop / quit / redirect: we asked for it
                    _ => None,
                }
            }
            _ => None,
        }
    }

    fn transition(&mut self, next: EngineState) -> Option<EngineEvent> {
        if self.state == next {
            return None;
        }
        self.state = next;
        Some(EngineEvent::State(next))
    }
}

pub struct MpvEngineFactory {
    binary: Option<PathBuf>,
}

impl MpvEngineFactory {
    pub fn new(binary: Option<PathBuf>) -> Self {
        Self { binary }
    }

    fn resolve_binary(&self) -> anyhow::Result<PathBuf> {
        self.binary
            .clone()
            .or_else(tuner_proto::platform::find_mpv_binary)
            .ok_or_else(|| anyhow::anyhow!("mpv binary not found"))
    }
}

#[async_trait]
impl EngineFactory for MpvEngineFactory {
    async fn create(
        &self,
        url: &str,
        config: &EngineConfig,
        events: EngineEvents,
    ) -> anyhow::Result<Box<dyn Engine>> {
        let binary = self.resolve_binary()?;
        let (mpv_tx, mpv_rx) = mpsc::channel::<MpvEvent>(64);
        let (process, handle) = MpvProcess::spawn(&binary, &mpv_args(config), mpv_tx).await?;

        let (first_ready_tx, first_ready_rx) = oneshot::channel();
        let translator = tokio::spawn(translate_events(mpv_rx, events, Some(first_ready_tx)));

        let rebuffer_handle = handle.clone();
        let rebuffer_wait = config.buffer.buffer_after_rebuffer_ms as f64 / 1000.0;
        tokio::spawn(async move {
            if first_ready_rx.await.is_err() {
                return;
            }
            if let Err(e) = rebuffer_handle
                .set_property("cache-pause-wait", json!(rebuffer_wait))
                .await
            {
                debug!("mpv: cache-pause-wait update failed: {}", e);
            }
        });

        handle.observe(OBS_PAUSED_FOR_CACHE, "paused-for-cache").await;
        let sync = tokio::spawn(live_sync(handle.clone(), config.live.clone()));

        Ok(Box::new(MpvEngine {
            process,
            handle,
            url: url.to_string(),
            target_offset: config.live.target_offset(),
            tasks: vec![translator, sync],
        }))
    }
}

/// Forward folded mpv events to the controller.  When the IPC stream closes
/// underneath us the process is gone, which is reported as an engine exit.
/// `first_ready` fires on the first `Ready`.
pub async fn translate_events(
    mut mpv_rx: mpsc::Receiver<MpvEvent>,
    events: EngineEvents,
    mut first_ready: Option<oneshot::Sender<()>>,
) {
    let epoch = events.epoch();
    let mut tracker = MpvStateTracker::default();
    while let Some(evt) = mpv_rx.recv().await {
        let Some(engine_evt) = tracker.on_event(&evt) else {
            continue;
        };
        debug!("mpv[{}]: {:?}", epoch, engine_evt);
        if engine_evt == EngineEvent::State(EngineState::Ready) {
            if let Some(tx) = first_ready.take() {
                let _ = tx.send(());
            }
        }
        if !events.emit(engine_evt).await {
            debug!("mpv[{}]: controller gone, translator exiting", epoch);
            return;
        }
    }
    warn!("mpv[{}]: IPC connection closed, process exited", epoch);
    events
        .emit(EngineEvent::Error(EngineError::engine_exited("mpv exited")))
        .await;
}

/// Keep a playing live stream near the target offset.
async fn live_sync(handle: MpvHandle, live: LiveConfig) {
    let mut ticker = tokio::time::interval(LIVE_SYNC_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut speed = 1.0;
    loop {
        ticker.tick().await;
        let playing = bool_property(&handle, "pause").await == Some(false)
            && bool_property(&handle, "paused-for-cache").await != Some(true);
        if !playing {
            continue;
        }
        let Some(offset) = live_offset(&handle).await else {
            continue;
        };
        match live_correction(offset, &live) {
            LiveCorrection::SeekToLive => {
                info!("mpv: {}ms behind live, seeking to live", offset.as_millis());
                if let Err(e) = seek_to_live(&handle, live.target_offset()).await {
                    debug!("mpv: live seek failed: {}", e);
                }
                if speed != 1.0 && handle.set_property("speed", json!(1.0)).await.is_ok() {
                    speed = 1.0;
                }
            }
            LiveCorrection::Speed(next) => {
                if (next - speed).abs() < SPEED_STEP {
                    continue;
                }
                debug!("mpv: {}ms behind live, speed {:.3}", offset.as_millis(), next);
                match handle.set_property("speed", json!(next)).await {
                    Ok(()) => speed = next,
                    Err(e) => debug!("mpv: set speed failed: {}", e),
                }
            }
        }
    }
}

async fn seek_to_live(handle: &MpvHandle, target_offset: Duration) -> anyhow::Result<()> {
    // Negative absolute seeks count back from the end of the timeline.
    let back = -target_offset.as_secs_f64();
    handle.send(json!(["seek", back, "absolute"])).await?;
    Ok(())
}

async fn f64_property(handle: &MpvHandle, name: &str) -> Option<f64> {
    match handle.get_property(name).await {
        Ok(v) => v.and_then(|v| v.as_f64()),
        Err(e) => {
            debug!("mpv: get_property {} failed: {}", name, e);
            None
        }
    }
}

async fn bool_property(handle: &MpvHandle, name: &str) -> Option<bool> {
    handle.get_property(name).await.ok().flatten()?.as_bool()
}

async fn live_offset(handle: &MpvHandle) -> Option<Duration> {
    if bool_property(handle, "demuxer-via-network").await != Some(true) {
        return None;
    }
    let pos = f64_property(handle, "time-pos").await?;
    // Live playlists carry no fixed duration; the end of the demuxer
    // cache is the closest thing mpv exposes to the live edge.
    let edge = match f64_property(handle, "duration").await {
        Some(d) => d,
        None => {
            let cache = handle.get_property("demuxer-cache-state").await.ok()??;
            cache.get("cache-end")?.as_f64()?
        }
    };
    Some(Duration::from_secs_f64((edge - pos).max(0.0)))
}

pub struct MpvEngine {
    process: MpvProcess,
    handle: MpvHandle,
    url: String,
    target_offset: Duration,
    /// Event translator and live sync; aborted on release.
    tasks: Vec<JoinHandle<()>>,
}

#[async_trait]
impl Engine for MpvEngine {
    async fn prepare(&mut self) -> anyhow::Result<()> {
        if !self.process.alive() {
            anyhow::bail!("mpv process is not running");
        }
        info!("mpv: loadfile {}", super::truncate_url(&self.url));
        self.handle
            .send(json!(["loadfile", self.url, "replace"]))
            .await?;
        Ok(())
    }

    async fn set_play_when_ready(&mut self, play: bool) -> anyhow::Result<()> {
        self.handle.set_property("pause", json!(!play)).await
    }

    async fn seek_to_default_position(&mut self) -> anyhow::Result<()> {
        seek_to_live(&self.handle, self.target_offset).await
    }

    async fn set_volume(&mut self, volume: f32) -> anyhow::Result<()> {
        let vol_pct = (volume * 100.0).clamp(0.0, 100.0);
        self.handle.set_property("volume", json!(vol_pct)).await
    }

    async fn live_offset(&mut self) -> Option<Duration> {
        live_offset(&self.handle).await
    }

    async fn release(&mut self) {
        // no exit report for a process we are about to kill
        for task in self.tasks.drain(..) {
            task.abort();
        }
        if let Err(e) = self.handle.send(json!(["stop"])).await {
            debug!("mpv: stop before release failed: {}", e);
        }
        self.process.kill().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ControlEvent;
    use crate::engine::mpv_ipc::start_io_tasks;
    use serde_json::Value;
    use tokio::io::{AsyncWriteExt, BufReader};

    fn evt(raw: Value) -> MpvEvent {
        MpvEvent { raw }
    }

    #[test]
    fn test_mpv_args_follow_config() {
        let args = mpv_args(&EngineConfig::default());
        assert!(args.contains(&"--demuxer-readahead-secs=25.0".to_string()));
        assert!(args.contains(&"--cache-secs=50.0".to_string()));
        assert!(args.contains(&"--cache-pause-initial=yes".to_string()));
        assert!(args.contains(&"--cache-pause-wait=1.5".to_string()));
        assert!(args.contains(&"--network-timeout=15".to_string()));
    }

    #[test]
    fn test_load_then_ready() {
        let mut tracker = MpvStateTracker::default();
        assert_eq!(
            tracker.on_event(&evt(json!({"event": "start-file"}))),
            Some(EngineEvent::State(EngineState::Buffering))
        );
        // still loading: cache flag alone does not mean ready
        assert_eq!(
            tracker.on_event(&evt(
                json!({"event": "property-change", "id": OBS_PAUSED_FOR_CACHE, "data": false})
            )),
            None
        );
        assert_eq!(
            tracker.on_event(&evt(json!({"event": "playback-restart"}))),
            Some(EngineEvent::State(EngineState::Ready))
        );
        // duplicate restart after a seek is swallowed
        assert_eq!(tracker.on_event(&evt(json!({"event": "playback-restart"}))), None);
    }

    #[test]
    fn test_rebuffer_cycle() {
        let mut tracker = MpvStateTracker::default();
        tracker.on_event(&evt(json!({"event": "start-file"})));
        tracker.on_event(&evt(json!({"event": "playback-restart"})));

        let stall = evt(json!({"event": "property-change", "id": OBS_PAUSED_FOR_CACHE, "data": true}));
        let resume = evt(json!({"event": "property-change", "id": OBS_PAUSED_FOR_CACHE, "data": false}));
        assert_eq!(
            tracker.on_event(&stall),
            Some(EngineEvent::State(EngineState::Buffering))
        );
        assert_eq!(
            tracker.on_event(&resume),
            Some(EngineEvent::State(EngineState::Ready))
        );
    }

    #[test]
    fn test_end_file_reasons() {
        let mut tracker = MpvStateTracker::default();
        tracker.on_event(&evt(json!({"event": "start-file"})));
        assert_eq!(
            tracker.on_event(&evt(json!({"event": "end-file", "reason": "stop"}))),
            None
        );
        assert_eq!(
            tracker.on_event(&evt(json!({"event": "end-file", "reason": "eof"}))),
            Some(EngineEvent::State(EngineState::Ended))
        );

        match tracker.on_event(&evt(
            json!({"event": "end-file", "reason": "error", "file_error": "loading failed"}),
        )) {
            Some(EngineEvent::Error(err)) => {
                assert!(!err.is_behind_live_window());
                assert_eq!(err.code.as_deref(), Some("end-file:error"));
                assert_eq!(err.message, "loading failed");
            }
            other => panic!("expected error, got {:?}", other),
        }
        assert_eq!(tracker.state(), EngineState::Failed);

        // a retry starts a new load
        assert_eq!(
            tracker.on_event(&evt(json!({"event": "start-file"}))),
            Some(EngineEvent::State(EngineState::Buffering))
        );
    }

    #[test]
    fn test_behind_live_window_classification() {
        let err = classify_file_error("error", Some("Segment expired from playlist"));
        assert!(err.is_behind_live_window());
        let err = classify_file_error("error", Some("HTTP error 403 Forbidden"));
        assert!(!err.is_behind_live_window());
        let err = classify_file_error("error", None);
        assert_eq!(err.message, "unknown error");
    }

    async fn next_engine_event(rx: &mut mpsc::Receiver<ControlEvent>) -> (u64, EngineEvent) {
        match rx.recv().await {
            Some(ControlEvent::Engine { epoch, event }) => (epoch, event),
            other => panic!("expected engine event, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_closed_ipc_reports_engine_exit() {
        let (client, mut server) = tokio::io::duplex(4096);
        let (read_half, write_half) = tokio::io::split(client);
        let (mpv_tx, mpv_rx) = mpsc::channel(8);
        let _handle = start_io_tasks(BufReader::new(read_half), write_half, mpv_tx);

        let (tx, mut rx) = mpsc::channel(8);
        let (first_ready_tx, first_ready_rx) = oneshot::channel();
        let translator = tokio::spawn(translate_events(
            mpv_rx,
            EngineEvents::new(tx, 3),
            Some(first_ready_tx),
        ));

        server
            .write_all(b"{\"event\":\"start-file\"}\n{\"event\":\"playback-restart\"}\n")
            .await
            .unwrap();
        assert_eq!(
            next_engine_event(&mut rx).await,
            (3, EngineEvent::State(EngineState::Buffering))
        );
        assert_eq!(
            next_engine_event(&mut rx).await,
            (3, EngineEvent::State(EngineState::Ready))
        );
        first_ready_rx.await.unwrap();

        // mpv dies: its end of the socket goes away
        drop(server);
        match next_engine_event(&mut rx).await {
            (3, EngineEvent::Error(err)) => {
                assert!(err.is_engine_exit());
                assert!(!err.is_behind_live_window());
            }
            other => panic!("expected engine exit, got {:?}", other),
        }
        translator.await.unwrap();
    }

    #[tokio::test]
    async fn test_translator_stops_quietly_without_controller() {
        let (mpv_tx, mpv_rx) = mpsc::channel(8);
        let (tx, rx) = mpsc::channel(8);
        drop(rx);
        let translator = tokio::spawn(translate_events(mpv_rx, EngineEvents::new(tx, 1), None));

        mpv_tx
            .send(MpvEvent {
                raw: json!({"event": "start-file"}),
            })
            .await
            .unwrap();
        translator.await.unwrap();
        assert!(mpv_tx.is_closed());
    }
}
