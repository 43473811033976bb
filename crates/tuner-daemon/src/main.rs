use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tuner_daemon::core::{ControlEvent, SessionController};
use tuner_daemon::engine::mpv::MpvEngineFactory;
use tuner_daemon::http;
use tuner_daemon::resources::ResourceArbiter;
use tuner_daemon::telemetry::TelemetryReporter;
use tuner_daemon::ui::WatchUi;
use tuner_proto::config::Config;
use tuner_proto::protocol::StartRequest;

/// Live TV playback session daemon.
#[derive(Debug, Parser)]
#[command(name = "tunerd", version)]
struct Args {
    /// Stream to start playing right away
    url: Option<String>,

    /// Alternate stream used once the primary is exhausted
    #[arg(long)]
    fallback: Option<String>,

    /// Channel name shown while tuning
    #[arg(long)]
    label: Option<String>,

    /// Auth token for diagnostic reports
    #[arg(long)]
    token: Option<String>,

    /// Base URL of the diagnostics collector
    #[arg(long = "report-url")]
    report_url: Option<String>,
}

impl Args {
    fn start_request(&self) -> Option<StartRequest> {
        let url = self.url.clone()?;
        Some(StartRequest {
            primary_url: url,
            fallback_url: self.fallback.clone(),
            channel_label: self.label.clone(),
            auth_token: self.token.clone(),
            report_base_url: self.report_url.clone(),
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Setup file logging + stderr
    let data_dir = tuner_proto::platform::data_dir();
    std::fs::create_dir_all(&data_dir)?;
    let log_path = data_dir.join("tunerd.log");

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(log_file)
        .with_ansi(false);
    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer)
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,tuner_daemon=debug")),
        )
        .init();

    info!("Log file: {:?}", log_path);

    let config = Config::load()?;
    info!("Config loaded from: {:?}", Config::config_path());

    // Every input funnels into the SessionController
    let (event_tx, event_rx) = tokio::sync::mpsc::channel::<ControlEvent>(256);

    let (ui, ui_rx) = WatchUi::new();
    let controller = SessionController::new(
        Arc::new(MpvEngineFactory::new(config.engine.mpv_binary.clone())),
        config.engine.clone(),
        ResourceArbiter::from_config(&config.resources),
        TelemetryReporter::new(&config.telemetry)?,
        Arc::new(ui),
        event_tx,
    );
    let handle = controller.handle();

    let shutdown = CancellationToken::new();
    let http_handle = if config.http.enabled {
        Some(http::start_server(
            config.http.bind_address.clone(),
            config.http.port,
            http::HttpState::new(handle.clone(), ui_rx),
            shutdown.clone(),
        ))
    } else {
        None
    };

    // Ctrl-C ends the session before exit so leases are released
    let signal_handle = handle.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            return;
        }
        info!("Ctrl-C received, shutting down");
        let _ = signal_handle.shutdown().await;
    });

    if let Some(request) = args.start_request() {
        let startup = handle.clone();
        tokio::spawn(async move {
            if let Err(e) = startup.start(request).await {
                error!("Failed to start playback: {}", e);
            }
        });
    }

    info!("tunerd running");
    controller.run(event_rx).await;

    shutdown.cancel();
    if let Some(h) = http_handle {
        let _ = h.await;
    }
    info!("tunerd stopped");
    Ok(())
}
