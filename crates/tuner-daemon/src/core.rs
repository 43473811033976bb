//! SessionController - single owner of playback session state.
//!
//! Every input (commands, engine reports, retry and overlay timers, focus
//! and lifecycle signals) arrives as a `ControlEvent` on one mpsc channel
//! and is handled to completion before the next one, so transitions never
//! race.  Timers and engine reports carry the epoch they were issued under;
//! tearing an engine down bumps the epoch, which turns anything still in
//! flight for the old instance into a no-op.
//!
//! Engine construction runs on its own task and comes back as
//! `ControlEvent::EngineReady`, so a slow engine start never holds up `Stop`.
//! An engine that arrives for an epoch that has already moved on is released
//! on receipt.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};
use tuner_proto::config::EngineConfig;
use tuner_proto::protocol::{
    EngineState, FocusChange, PlaybackSnapshot, PlaybackStatus, StartRequest,
};

use crate::engine::{truncate_url, Engine, EngineError, EngineEvent, EngineEvents, EngineFactory};
use crate::error::{PlaybackError, Result};
use crate::live_edge::LiveEdgeTracker;
use crate::resources::{FocusAction, ResourceArbiter};
use crate::session::{PlaybackSession, RetryPlan, MAX_GENERAL_RETRIES, MAX_LIVE_WINDOW_RETRIES};
use crate::telemetry::{SessionReporter, TelemetryReporter, CATEGORY_PLAYER};
use crate::ui::UiHooks;

/// How long the channel name stays up once playback starts.
pub const CHANNEL_OVERLAY_TIMEOUT: Duration = Duration::from_secs(3);

const FULL_VOLUME: f32 = 1.0;

#[derive(Debug)]
pub enum ControlEvent {
    Start {
        request: StartRequest,
        reply: Option<oneshot::Sender<Result<()>>>,
    },
    Stop {
        reply: Option<oneshot::Sender<()>>,
    },
    Engine {
        epoch: u64,
        event: EngineEvent,
    },
    EngineReady {
        epoch: u64,
        setup: EngineSetup,
    },
    RetryDue {
        epoch: u64,
    },
    HideOverlay {
        epoch: u64,
    },
    Focus(FocusChange),
    Suspend,
    Resume,
    Shutdown,
}

/// Result of building and preparing an engine off the control loop.
pub struct EngineSetup {
    engine: Option<Box<dyn Engine>>,
    error: Option<EngineError>,
    /// Settings applied to the engine before prepare.
    volume: f32,
    play_when_ready: bool,
}

impl EngineSetup {
    async fn discard(mut self) {
        if let Some(mut engine) = self.engine.take() {
            engine.release().await;
        }
    }
}

impl fmt::Debug for EngineSetup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineSetup")
            .field("engine", &self.engine.is_some())
            .field("error", &self.error)
            .finish()
    }
}

/// Create an engine, push the current output settings, and prepare it.
async fn build_engine(
    factory: Arc<dyn EngineFactory>,
    url: String,
    config: EngineConfig,
    events: EngineEvents,
    volume: f32,
    play_when_ready: bool,
) -> EngineSetup {
    let mut engine = match factory.create(&url, &config, events).await {
        Ok(engine) => engine,
        Err(e) => {
            error!("engine: failed to start for {}: {}", truncate_url(&url), e);
            return EngineSetup {
                engine: None,
                error: Some(EngineError::other(e.to_string()).with_code("engine-create")),
                volume,
                play_when_ready,
            };
        }
    };
    if let Err(e) = engine.set_volume(volume).await {
        warn!("engine: set_volume failed: {}", e);
    }
    if let Err(e) = engine.set_play_when_ready(play_when_ready).await {
        warn!("engine: set_play_when_ready failed: {}", e);
    }
    let error = engine
        .prepare()
        .await
        .err()
        .map(|e| EngineError::other(e.to_string()).with_code("prepare"));
    EngineSetup {
        engine: Some(engine),
        error,
        volume,
        play_when_ready,
    }
}

/// Cloneable front door to a running controller.
#[derive(Clone)]
pub struct ControllerHandle {
    tx: mpsc::Sender<ControlEvent>,
    snapshot: watch::Receiver<PlaybackSnapshot>,
}

impl ControllerHandle {
    pub fn new(tx: mpsc::Sender<ControlEvent>, snapshot: watch::Receiver<PlaybackSnapshot>) -> Self {
        Self { tx, snapshot }
    }

    pub fn snapshot(&self) -> PlaybackSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PlaybackSnapshot> {
        self.snapshot.clone()
    }

    /// Start a session and wait until the request has been validated.
    pub async fn start(&self, request: StartRequest) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(ControlEvent::Start {
            request,
            reply: Some(reply),
        })
        .await?;
        rx.await.map_err(|_| controller_gone())?
    }

    pub async fn stop(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(ControlEvent::Stop { reply: Some(reply) }).await?;
        rx.await.map_err(|_| controller_gone())
    }

    pub async fn focus(&self, change: FocusChange) -> Result<()> {
        self.send(ControlEvent::Focus(change)).await
    }

    pub async fn suspend(&self) -> Result<()> {
        self.send(ControlEvent::Suspend).await
    }

    pub async fn resume(&self) -> Result<()> {
        self.send(ControlEvent::Resume).await
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.send(ControlEvent::Shutdown).await
    }

    async fn send(&self, event: ControlEvent) -> Result<()> {
        self.tx.send(event).await.map_err(|_| controller_gone())
    }
}

fn controller_gone() -> PlaybackError {
    PlaybackError::Terminal("controller is not running".to_string())
}

pub struct SessionController {
    factory: Arc<dyn EngineFactory>,
    engine_config: EngineConfig,
    engine: Option<Box<dyn Engine>>,
    /// An engine for the current epoch is being built.
    starting: bool,
    session: Option<PlaybackSession>,
    status: PlaybackStatus,
    /// Current engine generation; stale timers and reports carry older values.
    epoch: u64,
    pending_retry: Option<AbortHandle>,
    overlay_timer: Option<AbortHandle>,
    tracker: LiveEdgeTracker,
    arbiter: ResourceArbiter,
    telemetry: TelemetryReporter,
    reporter: Option<SessionReporter>,
    ui: Arc<dyn UiHooks>,
    event_tx: mpsc::Sender<ControlEvent>,
    snapshot_tx: watch::Sender<PlaybackSnapshot>,
    volume: f32,
    play_when_ready: bool,
    last_error: Option<String>,
}

impl SessionController {
    pub fn new(
        factory: Arc<dyn EngineFactory>,
        engine_config: EngineConfig,
        arbiter: ResourceArbiter,
        telemetry: TelemetryReporter,
        ui: Arc<dyn UiHooks>,
        event_tx: mpsc::Sender<ControlEvent>,
    ) -> Self {
        let (snapshot_tx, _) = watch::channel(PlaybackSnapshot::default());
        Self {
            factory,
            engine_config,
            engine: None,
            starting: false,
            session: None,
            status: PlaybackStatus::Idle,
            epoch: 0,
            pending_retry: None,
            overlay_timer: None,
            tracker: LiveEdgeTracker::default(),
            arbiter,
            telemetry,
            reporter: None,
            ui,
            event_tx,
            snapshot_tx,
            volume: FULL_VOLUME,
            play_when_ready: true,
            last_error: None,
        }
    }

    pub fn handle(&self) -> ControllerHandle {
        ControllerHandle::new(self.event_tx.clone(), self.snapshot_tx.subscribe())
    }

    pub fn snapshot(&self) -> PlaybackSnapshot {
        self.snapshot_tx.borrow().clone()
    }

    pub fn status(&self) -> &PlaybackStatus {
        &self.status
    }

    pub fn session(&self) -> Option<&PlaybackSession> {
        self.session.as_ref()
    }

    pub fn arbiter(&self) -> &ResourceArbiter {
        &self.arbiter
    }

    /// Main loop.  Returns once `Shutdown` arrives or every sender is gone,
    /// after ending any session and flushing lease releases.
    pub async fn run(mut self, mut rx: mpsc::Receiver<ControlEvent>) {
        info!("SessionController: running");
        while let Some(event) = rx.recv().await {
            if !self.handle_event(event).await {
                break;
            }
        }
        self.stop(false).await;
        self.arbiter.flush().await;
        info!("SessionController: exiting");
    }

    /// Apply one event.  Returns false when the loop should exit.
    pub async fn handle_event(&mut self, event: ControlEvent) -> bool {
        match event {
            // replies go out after publish so callers see the new snapshot
            ControlEvent::Start { request, reply } => {
                let result = self.start(request).await;
                self.publish();
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
                return true;
            }
            ControlEvent::Stop { reply } => {
                self.stop(true).await;
                self.publish();
                if let Some(reply) = reply {
                    let _ = reply.send(());
                }
                return true;
            }
            ControlEvent::Engine { epoch, event } => self.on_engine_event(epoch, event).await,
            ControlEvent::EngineReady { epoch, setup } => self.on_engine_ready(epoch, setup).await,
            ControlEvent::RetryDue { epoch } => self.on_retry_due(epoch).await,
            ControlEvent::HideOverlay { epoch } => {
                if epoch == self.epoch {
                    self.overlay_timer = None;
                    self.ui.hide_channel_name();
                }
            }
            ControlEvent::Focus(change) => self.on_focus(change).await,
            ControlEvent::Suspend => self.on_suspend().await,
            ControlEvent::Resume => self.on_resume().await,
            ControlEvent::Shutdown => {
                info!("SessionController: shutdown requested");
                return false;
            }
        }
        self.publish();
        true
    }

    // -- commands ----------------------------------------------------------

    async fn start(&mut self, request: StartRequest) -> Result<()> {
        let session = match PlaybackSession::from_request(request) {
            Ok(s) => s,
            Err(e) => {
                warn!("start rejected: {}", e);
                self.ui.show_error(&e.to_string());
                return Err(e);
            }
        };

        if self.session.is_some() {
            // the previous session's releases are queued ahead of our acquire
            self.stop(false).await;
        }

        info!(
            "Starting channel {:?} at {}",
            session.channel_label(),
            truncate_url(session.current_url())
        );
        self.reporter = Some(
            self.telemetry
                .for_session(session.auth_token(), session.report_base_url()),
        );
        self.status = PlaybackStatus::Buffering;
        self.volume = FULL_VOLUME;
        self.play_when_ready = true;
        self.last_error = None;

        self.ui.hide_error();
        match session.channel_label() {
            Some(label) => self.ui.show_channel_name(label),
            None => self.ui.hide_channel_name(),
        }
        self.ui.show_loading();

        self.session = Some(session);
        let url = self.current_url();
        self.report("Player starting", vec![("url", url)]);

        self.arbiter.acquire();
        self.open_engine();
        Ok(())
    }

    /// End the session from any state.  `user` marks an explicit close.
    async fn stop(&mut self, user: bool) {
        if self.session.is_none() && self.engine.is_none() && !self.arbiter.is_held() {
            debug!("stop: no active session");
            return;
        }
        if user {
            info!("Closing player");
            self.report("Closing player", Vec::new());
        }
        self.teardown().await;
        self.session = None;
        self.reporter = None;
        self.status = PlaybackStatus::Idle;
        self.ui.hide_loading();
        self.ui.hide_channel_name();
    }

    async fn on_suspend(&mut self) {
        if self.session.is_none() {
            return;
        }
        info!("Suspending playback");
        self.play_when_ready = false;
        if let Some(engine) = self.engine.as_mut() {
            if let Err(e) = engine.set_play_when_ready(false).await {
                warn!("suspend: {}", e);
            }
        }
    }

    async fn on_resume(&mut self) {
        if self.session.is_none() || self.status.is_terminal() {
            return;
        }
        info!("Resuming playback");
        self.play_when_ready = true;
        if let Some(engine) = self.engine.as_mut() {
            if let Err(e) = engine.set_play_when_ready(true).await {
                warn!("resume: {}", e);
            }
        }
    }

    async fn on_focus(&mut self, change: FocusChange) {
        let Some(action) = self.arbiter.on_focus_change(change) else {
            return;
        };
        debug!("focus {:?}: now {:?}, {:?}", change, self.arbiter.focus(), action);
        let (volume, play) = match action {
            FocusAction::Pause => (self.volume, false),
            FocusAction::Duck(volume) => (volume, self.play_when_ready),
            FocusAction::Resume => (FULL_VOLUME, true),
        };
        self.volume = volume;
        self.play_when_ready = play;
        if let Some(engine) = self.engine.as_mut() {
            if let Err(e) = engine.set_volume(volume).await {
                warn!("focus: set_volume failed: {}", e);
            }
            if let Err(e) = engine.set_play_when_ready(play).await {
                warn!("focus: set_play_when_ready failed: {}", e);
            }
        }
    }

    // -- engine lifecycle --------------------------------------------------

    /// Start building a fresh engine for the current locator under a new
    /// epoch.  The result arrives as `EngineReady`.
    fn open_engine(&mut self) {
        let url = self.current_url();
        self.epoch += 1;
        self.starting = true;
        let epoch = self.epoch;
        debug!("engine: opening {} (epoch {})", truncate_url(&url), epoch);

        let events = EngineEvents::new(self.event_tx.clone(), epoch);
        let factory = self.factory.clone();
        let config = self.engine_config.clone();
        let tx = self.event_tx.clone();
        let (volume, play_when_ready) = (self.volume, self.play_when_ready);
        tokio::spawn(async move {
            let setup = build_engine(factory, url, config, events, volume, play_when_ready).await;
            if let Err(mpsc::error::SendError(ControlEvent::EngineReady { setup, .. })) =
                tx.send(ControlEvent::EngineReady { epoch, setup }).await
            {
                setup.discard().await;
            }
        });
    }

    async fn on_engine_ready(&mut self, epoch: u64, mut setup: EngineSetup) {
        if epoch != self.epoch || self.session.is_none() {
            debug!("releasing engine built for stale epoch {}", epoch);
            setup.discard().await;
            return;
        }
        self.starting = false;
        if let Some(mut engine) = setup.engine.take() {
            // focus or suspend changes that landed while the engine was starting
            if setup.volume != self.volume {
                if let Err(e) = engine.set_volume(self.volume).await {
                    warn!("engine: set_volume failed: {}", e);
                }
            }
            if setup.play_when_ready != self.play_when_ready {
                if let Err(e) = engine.set_play_when_ready(self.play_when_ready).await {
                    warn!("engine: set_play_when_ready failed: {}", e);
                }
            }
            self.engine = Some(engine);
        }
        if let Some(err) = setup.error.take() {
            self.on_error(err).await;
        }
    }

    async fn prepare_again(&mut self) {
        let Some(engine) = self.engine.as_mut() else {
            if self.starting {
                debug!("engine still starting, nothing to re-prepare");
            } else {
                self.open_engine();
            }
            return;
        };
        if let Err(e) = engine.prepare().await {
            self.inject_error(EngineError::other(e.to_string()).with_code("prepare"));
        }
    }

    /// Detach from the current engine: cancel its retry, invalidate its
    /// reports, and release it.
    async fn release_engine(&mut self) {
        if let Some(retry) = self.pending_retry.take() {
            retry.abort();
        }
        self.epoch += 1;
        self.starting = false;
        if let Some(mut engine) = self.engine.take() {
            engine.release().await;
        }
    }

    async fn teardown(&mut self) {
        if let Some(timer) = self.overlay_timer.take() {
            timer.abort();
        }
        self.release_engine().await;
        self.arbiter.release();
    }

    /// Report a failure that happened on the control thread through the
    /// same path as engine-reported errors.
    fn inject_error(&self, err: EngineError) {
        let tx = self.event_tx.clone();
        let epoch = self.epoch;
        tokio::spawn(async move {
            let _ = tx
                .send(ControlEvent::Engine {
                    epoch,
                    event: EngineEvent::Error(err),
                })
                .await;
        });
    }

    // -- engine reports ----------------------------------------------------

    async fn on_engine_event(&mut self, epoch: u64, event: EngineEvent) {
        if epoch != self.epoch || self.session.is_none() || self.status.is_terminal() {
            debug!("dropping stale engine event {:?} (epoch {})", event, epoch);
            return;
        }
        match event {
            EngineEvent::State(EngineState::Buffering) => self.on_buffering().await,
            EngineEvent::State(EngineState::Ready) => self.on_ready(),
            EngineEvent::State(EngineState::Ended) => self.on_ended().await,
            // errors arrive with their own detail
            EngineEvent::State(EngineState::Idle | EngineState::Failed) => {}
            EngineEvent::Error(err) => self.on_error(err).await,
        }
    }

    async fn on_buffering(&mut self) {
        self.status = PlaybackStatus::Buffering;
        self.ui.show_loading();

        let mut seek_offset = None;
        if let Some(engine) = self.engine.as_mut() {
            if let Some(offset) = self.tracker.check(&mut **engine).await {
                warn!("{}ms behind live edge, seeking to live", offset.as_millis());
                if let Err(e) = engine.seek_to_default_position().await {
                    warn!("seek to live failed: {}", e);
                }
                seek_offset = Some(offset);
            }
        }
        if let Some(offset) = seek_offset {
            self.report(
                "Seeking to live edge",
                vec![("liveOffsetMs", offset.as_millis().to_string())],
            );
        }
        self.report("Buffering", Vec::new());
    }

    fn on_ready(&mut self) {
        if self.status != PlaybackStatus::Playing {
            info!("Playback started");
            self.report("Playback started", Vec::new());
        }
        self.status = PlaybackStatus::Playing;
        self.ui.hide_loading();
        self.ui.hide_error();
        if let Some(session) = self.session.as_mut() {
            session.reset_retries();
        }

        if let Some(timer) = self.overlay_timer.take() {
            timer.abort();
        }
        let tx = self.event_tx.clone();
        let epoch = self.epoch;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(CHANNEL_OVERLAY_TIMEOUT).await;
            let _ = tx.send(ControlEvent::HideOverlay { epoch }).await;
        });
        self.overlay_timer = Some(timer.abort_handle());
    }

    async fn on_ended(&mut self) {
        info!("Stream ended");
        self.report("Stream ended", Vec::new());
        self.finish(PlaybackStatus::Ended, PlaybackError::StreamEnded)
            .await;
    }

    async fn on_error(&mut self, err: EngineError) {
        let url = self.current_url();
        error!(
            "Playback error: {} (code={:?}, cause={:?})",
            err.message, err.code, err.cause
        );
        self.report(
            &format!("ERROR: {}", err.message),
            vec![
                ("errorCode", err.code.clone().unwrap_or_default()),
                ("cause", err.cause.clone().unwrap_or_default()),
                ("url", truncate_url(&url).to_string()),
            ],
        );

        let Some(session) = self.session.as_mut() else {
            return;
        };
        match session.plan_recovery(&err) {
            RetryPlan::SeekToLive { attempt } => {
                session.record_live_window_retry();
                warn!(
                    "{} (attempt {}/{})",
                    PlaybackError::from(&err),
                    attempt,
                    MAX_LIVE_WINDOW_RETRIES
                );
                self.report(
                    "Behind live window, recovering",
                    vec![("attempt", attempt.to_string())],
                );
                self.enter_recovery();
                if let Some(engine) = self.engine.as_mut() {
                    if let Err(e) = engine.seek_to_default_position().await {
                        warn!("seek to live failed: {}", e);
                    }
                }
                self.prepare_again().await;
            }
            RetryPlan::Wait { attempt, delay } => {
                session.record_general_retry();
                warn!(
                    "{}; retrying in {}ms (attempt {}/{})",
                    PlaybackError::from(&err),
                    delay.as_millis(),
                    attempt,
                    MAX_GENERAL_RETRIES
                );
                self.report(
                    "Retrying after error",
                    vec![
                        ("attempt", attempt.to_string()),
                        ("delayMs", delay.as_millis().to_string()),
                    ],
                );
                self.enter_recovery();
                if err.is_engine_exit() {
                    // the retry builds a new engine
                    self.release_engine().await;
                }
                self.schedule_retry(delay);
            }
            RetryPlan::SwitchFallback => {
                let exhausted = PlaybackError::SourceExhausted {
                    url: truncate_url(&url).to_string(),
                };
                if let Some(next) = session.switch_to_fallback() {
                    warn!("{}; switching to {}", exhausted, truncate_url(next));
                }
                let next = self.current_url();
                self.report(
                    "Switching to fallback",
                    vec![("url", truncate_url(&next).to_string())],
                );
                self.enter_recovery();
                self.release_engine().await;
                self.open_engine();
            }
            RetryPlan::SurfaceError => {
                error!(
                    "Recovery exhausted for {} (fallback used: {})",
                    truncate_url(&url),
                    session.fallback_used()
                );
                self.finish(PlaybackStatus::Error, PlaybackError::Terminal(err.message))
                    .await;
            }
        }
    }

    async fn on_retry_due(&mut self, epoch: u64) {
        if epoch != self.epoch || self.session.is_none() || self.status.is_terminal() {
            debug!("ignoring stale retry (epoch {})", epoch);
            return;
        }
        self.pending_retry = None;
        debug!("retry due, re-preparing");
        self.prepare_again().await;
    }

    fn schedule_retry(&mut self, delay: Duration) {
        if let Some(previous) = self.pending_retry.take() {
            previous.abort();
        }
        let tx = self.event_tx.clone();
        let epoch = self.epoch;
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(ControlEvent::RetryDue { epoch }).await;
        });
        self.pending_retry = Some(task.abort_handle());
    }

    /// Recoverable trouble: loading indicator only, never an error banner.
    fn enter_recovery(&mut self) {
        self.status = PlaybackStatus::Buffering;
        self.ui.hide_error();
        self.ui.show_loading();
    }

    /// Terminal outcome: tell the viewer, free everything, keep the session
    /// around for inspection until the next start or stop.
    async fn finish(&mut self, status: PlaybackStatus, err: PlaybackError) {
        let message = err.to_string();
        self.ui.hide_loading();
        self.ui.show_error(&message);
        self.last_error = Some(message);
        self.teardown().await;
        self.status = status;
    }

    // -- helpers -----------------------------------------------------------

    fn current_url(&self) -> String {
        self.session
            .as_ref()
            .map(|s| s.current_url().to_string())
            .unwrap_or_default()
    }

    fn report(&self, message: &str, mut context: Vec<(&str, String)>) {
        let Some(reporter) = self.reporter.as_ref() else {
            return;
        };
        if let Some(label) = self.session.as_ref().and_then(|s| s.channel_label()) {
            context.insert(0, ("channel", label.to_string()));
        }
        reporter.report(CATEGORY_PLAYER, message, &context);
    }

    fn publish(&self) {
        let session = self.session.as_ref();
        let status = self.status.clone();
        let volume = self.volume;
        let play_when_ready = self.play_when_ready;
        let last_error = self.last_error.clone();
        self.snapshot_tx.send_modify(|snap| {
            snap.rev += 1;
            snap.status = status;
            snap.channel_label = session.and_then(|s| s.channel_label()).map(str::to_string);
            snap.current_url = session.map(|s| s.current_url().to_string());
            snap.fallback_available = session.is_some_and(|s| s.fallback_available());
            snap.general_retries = session.map_or(0, |s| s.general_retries());
            snap.live_window_retries = session.map_or(0, |s| s.live_window_retries());
            snap.volume = volume;
            snap.play_when_ready = play_when_ready;
            snap.last_error = last_error;
            snap.updated_at = Some(chrono::Utc::now());
        });
    }
}
