//! Fakes and a stepping harness for controller tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, watch};
use tuner_proto::config::{EngineConfig, TelemetryConfig};
use tuner_proto::protocol::{FocusChange, StartRequest, UiState};

use crate::core::{ControlEvent, SessionController};
use crate::engine::{Engine, EngineEvent, EngineEvents, EngineFactory};
use crate::error::Result;
use crate::resources::{LeaseBackend, ResourceArbiter};
use crate::telemetry::TelemetryReporter;
use crate::ui::WatchUi;

#[derive(Debug, Clone, PartialEq)]
pub enum EngineCall {
    Create(String),
    Prepare(String),
    PlayWhenReady(bool),
    SeekToDefault,
    Volume(f32),
    Release(String),
}

type CallLog = Arc<Mutex<Vec<EngineCall>>>;

pub struct FakeEngine {
    url: String,
    log: CallLog,
    live_offset: Arc<Mutex<Option<Duration>>>,
}

impl FakeEngine {
    fn record(&self, call: EngineCall) {
        self.log.lock().unwrap().push(call);
    }
}

#[async_trait]
impl Engine for FakeEngine {
    async fn prepare(&mut self) -> anyhow::Result<()> {
        self.record(EngineCall::Prepare(self.url.clone()));
        Ok(())
    }

    async fn set_play_when_ready(&mut self, play: bool) -> anyhow::Result<()> {
        self.record(EngineCall::PlayWhenReady(play));
        Ok(())
    }

    async fn seek_to_default_position(&mut self) -> anyhow::Result<()> {
        self.record(EngineCall::SeekToDefault);
        Ok(())
    }

    async fn set_volume(&mut self, volume: f32) -> anyhow::Result<()> {
        self.record(EngineCall::Volume(volume));
        Ok(())
    }

    async fn live_offset(&mut self) -> Option<Duration> {
        *self.live_offset.lock().unwrap()
    }

    async fn release(&mut self) {
        self.record(EngineCall::Release(self.url.clone()));
    }
}

#[derive(Default)]
pub struct FakeFactory {
    log: CallLog,
    live_offset: Arc<Mutex<Option<Duration>>>,
    events: Mutex<Option<EngineEvents>>,
    failures: AtomicUsize,
    delay: Mutex<Duration>,
}

impl FakeFactory {
    /// Sink handed to the most recently created engine.
    pub fn last_events(&self) -> Option<EngineEvents> {
        self.events.lock().unwrap().clone()
    }

    pub fn fail_next_creates(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Make every create take this long, like mpv waiting for its socket.
    pub fn delay_creates(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }
}

#[async_trait]
impl EngineFactory for FakeFactory {
    async fn create(
        &self,
        url: &str,
        _config: &EngineConfig,
        events: EngineEvents,
    ) -> anyhow::Result<Box<dyn Engine>> {
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            anyhow::bail!("engine binary missing");
        }
        self.log.lock().unwrap().push(EngineCall::Create(url.to_string()));
        *self.events.lock().unwrap() = Some(events);
        Ok(Box::new(FakeEngine {
            url: url.to_string(),
            log: self.log.clone(),
            live_offset: self.live_offset.clone(),
        }))
    }
}

pub struct CountingLease {
    name: &'static str,
    fail: bool,
    acquires: AtomicUsize,
    releases: AtomicUsize,
}

impl CountingLease {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            fail: false,
            acquires: AtomicUsize::new(0),
            releases: AtomicUsize::new(0),
        }
    }

    pub fn failing(name: &'static str) -> Self {
        Self {
            fail: true,
            ..Self::new(name)
        }
    }

    pub fn acquires(&self) -> usize {
        self.acquires.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }
}

impl LeaseBackend for CountingLease {
    fn name(&self) -> &'static str {
        self.name
    }

    fn acquire(&self) -> anyhow::Result<()> {
        self.acquires.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            anyhow::bail!("{} unavailable", self.name);
        }
        Ok(())
    }

    fn release(&self) {
        self.releases.fetch_add(1, Ordering::SeqCst);
    }
}

/// Drives a controller by hand: events are applied synchronously and
/// timer-driven events are drained after every step.
pub struct Harness {
    pub controller: SessionController,
    pub factory: Arc<FakeFactory>,
    pub keep_alive: Arc<CountingLease>,
    pub focus: Arc<CountingLease>,
    rx: mpsc::Receiver<ControlEvent>,
    ui: watch::Receiver<UiState>,
}

impl Harness {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(64);
        let factory = Arc::new(FakeFactory::default());
        let keep_alive = Arc::new(CountingLease::new("keep-alive"));
        let focus = Arc::new(CountingLease::new("audio-focus"));
        let arbiter = ResourceArbiter::new(keep_alive.clone(), focus.clone());
        let telemetry = TelemetryReporter::new(&TelemetryConfig::default()).unwrap();
        let (ui, ui_rx) = WatchUi::new();
        let controller = SessionController::new(
            factory.clone(),
            EngineConfig::default(),
            arbiter,
            telemetry,
            Arc::new(ui),
            tx,
        );
        Self {
            controller,
            factory,
            keep_alive,
            focus,
            rx,
            ui: ui_rx,
        }
    }

    pub async fn start(&mut self, request: StartRequest) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(ControlEvent::Start {
            request,
            reply: Some(reply),
        })
        .await;
        rx.await.unwrap()
    }

    pub async fn stop(&mut self) {
        self.send(ControlEvent::Stop { reply: None }).await;
    }

    pub async fn focus_change(&mut self, change: FocusChange) {
        self.send(ControlEvent::Focus(change)).await;
    }

    /// Report from the current engine instance.
    pub async fn emit(&mut self, event: EngineEvent) {
        let events = self.factory.last_events().expect("no engine created");
        assert!(events.emit(event).await);
        self.pump().await;
    }

    pub async fn send(&mut self, event: ControlEvent) {
        self.controller.handle_event(event).await;
        self.pump().await;
    }

    /// Let spawned timers and injected events run, then apply whatever
    /// they queued.
    pub async fn pump(&mut self) {
        for _ in 0..8 {
            tokio::task::yield_now().await;
            while let Ok(event) = self.rx.try_recv() {
                self.controller.handle_event(event).await;
            }
        }
    }

    pub async fn advance(&mut self, by: Duration) {
        tokio::time::advance(by).await;
        self.pump().await;
    }

    pub fn set_live_offset(&self, offset: Option<Duration>) {
        *self.factory.live_offset.lock().unwrap() = offset;
    }

    pub fn ui(&self) -> UiState {
        self.ui.borrow().clone()
    }

    pub fn calls(&self) -> Vec<EngineCall> {
        self.factory.log.lock().unwrap().clone()
    }

    pub fn creates(&self) -> usize {
        self.count(|c| matches!(c, EngineCall::Create(_)))
    }

    pub fn prepares(&self, url: &str) -> usize {
        self.count(|c| matches!(c, EngineCall::Prepare(u) if u == url))
    }

    pub fn seeks(&self) -> usize {
        self.count(|c| matches!(c, EngineCall::SeekToDefault))
    }

    pub fn last_volume(&self) -> Option<f32> {
        self.calls().into_iter().rev().find_map(|c| match c {
            EngineCall::Volume(v) => Some(v),
            _ => None,
        })
    }

    pub fn last_play_when_ready(&self) -> Option<bool> {
        self.calls().into_iter().rev().find_map(|c| match c {
            EngineCall::PlayWhenReady(p) => Some(p),
            _ => None,
        })
    }

    fn count(&self, pred: impl Fn(&EngineCall) -> bool) -> usize {
        self.factory.log.lock().unwrap().iter().filter(|c| pred(c)).count()
    }
}
