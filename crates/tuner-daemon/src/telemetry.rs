//! Fire-and-forget delivery of player diagnostics to the remote collector.
//!
//! `POST <reportBaseUrl>/api/debug/report` with
//! `{"token", "category", "message", "data": {..}}`.  Reports go onto a
//! bounded queue drained by one delivery worker, which dispatches them in
//! order with at most `max_in_flight` uploads running.  Nothing is retried
//! or fed back to the controller; only a full queue drops a report.

use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, warn};
use tuner_proto::config::TelemetryConfig;

pub const REPORT_PATH: &str = "/api/debug/report";

/// Category used for every player event.
pub const CATEGORY_PLAYER: &str = "player";

#[derive(Debug, Serialize)]
struct ReportBody<'a> {
    token: &'a str,
    category: &'a str,
    message: &'a str,
    #[serde(skip_serializing_if = "Map::is_empty")]
    data: Map<String, Value>,
}

struct QueuedReport {
    target: Arc<ReportTarget>,
    message: String,
    body: Value,
}

/// Front of the delivery queue.  Cheap to clone; the worker exits once
/// every clone is gone.
#[derive(Clone)]
pub struct TelemetryReporter {
    queue: mpsc::Sender<QueuedReport>,
}

impl TelemetryReporter {
    /// Must be called inside a tokio runtime.
    pub fn new(config: &TelemetryConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()?;
        Ok(Self::with_client(client, config.max_in_flight, config.queue_capacity))
    }

    /// Use a caller-provided client, e.g. one shared with other HTTP work.
    pub fn with_client(client: reqwest::Client, max_in_flight: usize, queue_capacity: usize) -> Self {
        let (queue, rx) = mpsc::channel(queue_capacity.max(1));
        let in_flight = Arc::new(Semaphore::new(max_in_flight.max(1)));
        tokio::spawn(delivery_worker(client, rx, in_flight));
        Self { queue }
    }

    /// Bind the reporter to one session's token and endpoint.  Reports are
    /// silently skipped when either is missing.
    pub fn for_session(&self, token: Option<&str>, base_url: Option<&str>) -> SessionReporter {
        let target = match (token, base_url) {
            (Some(token), Some(base)) if !token.is_empty() && !base.is_empty() => {
                Some(ReportTarget {
                    endpoint: format!("{}{}", base.trim_end_matches('/'), REPORT_PATH),
                    token: token.to_string(),
                })
            }
            _ => None,
        };
        SessionReporter {
            reporter: self.clone(),
            target: target.map(Arc::new),
        }
    }
}

#[derive(Debug)]
struct ReportTarget {
    endpoint: String,
    token: String,
}

#[derive(Clone)]
pub struct SessionReporter {
    reporter: TelemetryReporter,
    target: Option<Arc<ReportTarget>>,
}

impl SessionReporter {
    pub fn is_enabled(&self) -> bool {
        self.target.is_some()
    }

    /// Queue one report.  Returns immediately.
    pub fn report(&self, category: &str, message: &str, context: &[(&str, String)]) {
        let Some(target) = self.target.clone() else {
            return;
        };

        let data: Map<String, Value> = context
            .iter()
            .map(|(k, v)| (k.to_string(), Value::String(v.clone())))
            .collect();
        let body = match serde_json::to_value(ReportBody {
            token: &target.token,
            category,
            message,
            data,
        }) {
            Ok(body) => body,
            Err(e) => {
                warn!("telemetry: failed to encode report: {}", e);
                return;
            }
        };

        let queued = QueuedReport {
            target,
            message: message.to_string(),
            body,
        };
        match self.reporter.queue.try_send(queued) {
            Ok(()) => {}
            Err(TrySendError::Full(r)) => {
                warn!("telemetry: queue full, dropping '{}'", r.message);
            }
            Err(TrySendError::Closed(r)) => {
                debug!("telemetry: worker gone, dropping '{}'", r.message);
            }
        }
    }
}

async fn delivery_worker(
    client: reqwest::Client,
    mut rx: mpsc::Receiver<QueuedReport>,
    in_flight: Arc<Semaphore>,
) {
    while let Some(report) = rx.recv().await {
        let Ok(permit) = in_flight.clone().acquire_owned().await else {
            break;
        };
        let client = client.clone();
        tokio::spawn(async move {
            let _permit = permit;
            deliver(&client, report).await;
        });
    }
    debug!("telemetry: delivery worker exiting");
}

async fn deliver(client: &reqwest::Client, report: QueuedReport) {
    let QueuedReport {
        target,
        message,
        body,
    } = report;
    match client.post(&target.endpoint).json(&body).send().await {
        Ok(resp) if resp.status().is_success() => {
            debug!("telemetry: '{}' delivered", message);
        }
        Ok(resp) => {
            warn!("telemetry: '{}' rejected with {}", message, resp.status());
        }
        Err(e) => {
            warn!("telemetry: '{}' failed: {}", message, e);
        }
    }
}
