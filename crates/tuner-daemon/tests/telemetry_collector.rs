use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tuner_daemon::core::SessionController;
use tuner_daemon::engine::{Engine, EngineEvents, EngineFactory};
use tuner_daemon::resources::{NoLease, ResourceArbiter};
use tuner_daemon::telemetry::{TelemetryReporter, CATEGORY_PLAYER};
use tuner_daemon::ui::WatchUi;
use tuner_proto::config::{EngineConfig, TelemetryConfig};
use tuner_proto::protocol::StartRequest;

#[derive(Clone)]
struct Collector {
    tx: mpsc::UnboundedSender<Value>,
    status: StatusCode,
    delay: Duration,
}

async fn collect(State(c): State<Collector>, Json(body): Json<Value>) -> StatusCode {
    tokio::time::sleep(c.delay).await;
    let _ = c.tx.send(body);
    c.status
}

/// Mock collector on an ephemeral port.  Returns its base URL.
async fn spawn_collector(status: StatusCode) -> (String, mpsc::UnboundedReceiver<Value>) {
    spawn_slow_collector(status, Duration::ZERO).await
}

async fn spawn_slow_collector(
    status: StatusCode,
    delay: Duration,
) -> (String, mpsc::UnboundedReceiver<Value>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let app = Router::new()
        .route("/api/debug/report", post(collect))
        .with_state(Collector { tx, status, delay });
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{}", addr), rx)
}

async fn next_report(rx: &mut mpsc::UnboundedReceiver<Value>) -> Value {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("no report within 5s")
        .expect("collector gone")
}

#[tokio::test]
async fn test_report_reaches_collector() {
    let (base, mut rx) = spawn_collector(StatusCode::OK).await;
    let reporter = TelemetryReporter::new(&TelemetryConfig::default()).unwrap();
    let session = reporter.for_session(Some("tok-1"), Some(&format!("{}/", base)));

    session.report(
        CATEGORY_PLAYER,
        "Retrying after error",
        &[("attempt", "2".into()), ("delayMs", "2000".into())],
    );

    let body = next_report(&mut rx).await;
    assert_eq!(
        body,
        json!({
            "token": "tok-1",
            "category": "player",
            "message": "Retrying after error",
            "data": {"attempt": "2", "delayMs": "2000"}
        })
    );
}

#[tokio::test]
async fn test_collector_errors_are_swallowed() {
    let (base, mut rx) = spawn_collector(StatusCode::INTERNAL_SERVER_ERROR).await;
    let reporter = TelemetryReporter::new(&TelemetryConfig::default()).unwrap();
    let session = reporter.for_session(Some("tok"), Some(&base));

    session.report(CATEGORY_PLAYER, "Buffering", &[]);
    let body = next_report(&mut rx).await;
    assert_eq!(body["message"], "Buffering");
    assert!(body.get("data").is_none());

    // nothing listening: must not panic or block
    let dead = reporter.for_session(Some("tok"), Some("http://127.0.0.1:1"));
    dead.report(CATEGORY_PLAYER, "Buffering", &[]);
}

#[tokio::test]
async fn test_error_burst_survives_slow_collector() {
    let (base, mut rx) = spawn_slow_collector(StatusCode::OK, Duration::from_millis(200)).await;
    let config = TelemetryConfig::default();
    let reporter = TelemetryReporter::new(&config).unwrap();
    let session = reporter.for_session(Some("tok"), Some(&base));

    // far more than can be uploaded at once
    let burst = config.max_in_flight * 5;
    for attempt in 0..burst {
        session.report(
            CATEGORY_PLAYER,
            "Retrying after error",
            &[("attempt", attempt.to_string())],
        );
    }

    let mut attempts = Vec::new();
    for _ in 0..burst {
        let body = next_report(&mut rx).await;
        assert_eq!(body["message"], "Retrying after error");
        attempts.push(body["data"]["attempt"].as_str().unwrap().parse::<usize>().unwrap());
    }
    attempts.sort_unstable();
    assert_eq!(attempts, (0..burst).collect::<Vec<_>>());
}

struct SilentEngine;

#[async_trait]
impl Engine for SilentEngine {
    async fn prepare(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn set_play_when_ready(&mut self, _play: bool) -> anyhow::Result<()> {
        Ok(())
    }

    async fn seek_to_default_position(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn set_volume(&mut self, _volume: f32) -> anyhow::Result<()> {
        Ok(())
    }

    async fn live_offset(&mut self) -> Option<Duration> {
        None
    }

    async fn release(&mut self) {}
}

struct SilentFactory;

#[async_trait]
impl EngineFactory for SilentFactory {
    async fn create(
        &self,
        _url: &str,
        _config: &EngineConfig,
        _events: EngineEvents,
    ) -> anyhow::Result<Box<dyn Engine>> {
        Ok(Box::new(SilentEngine))
    }
}

#[tokio::test]
async fn test_session_lifecycle_is_reported() {
    let (base, mut rx) = spawn_collector(StatusCode::OK).await;
    let (tx, control_rx) = mpsc::channel(64);
    let (ui, _ui_rx) = WatchUi::new();
    let controller = SessionController::new(
        Arc::new(SilentFactory),
        EngineConfig::default(),
        ResourceArbiter::new(Arc::new(NoLease("keep-alive")), Arc::new(NoLease("audio-focus"))),
        TelemetryReporter::new(&TelemetryConfig::default()).unwrap(),
        Arc::new(ui),
        tx,
    );
    let handle = controller.handle();
    let run = tokio::spawn(controller.run(control_rx));

    handle
        .start(StartRequest {
            primary_url: "http://a/stream.m3u8".into(),
            channel_label: Some("News 24".into()),
            auth_token: Some("tok".into()),
            report_base_url: Some(base),
            ..Default::default()
        })
        .await
        .unwrap();
    let started = next_report(&mut rx).await;
    assert_eq!(started["message"], "Player starting");
    assert_eq!(started["data"]["channel"], "News 24");
    assert_eq!(started["data"]["url"], "http://a/stream.m3u8");

    handle.stop().await.unwrap();
    let closing = next_report(&mut rx).await;
    assert_eq!(closing["message"], "Closing player");

    handle.shutdown().await.unwrap();
    run.await.unwrap();
}
