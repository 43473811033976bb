use crate::core::ControllerHandle;
use crate::error::PlaybackError;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};
use tuner_proto::protocol::{FocusChange, PlaybackSnapshot, StartRequest, UiState};

#[derive(Clone)]
pub struct HttpState {
    controller: ControllerHandle,
    ui: watch::Receiver<UiState>,
}

impl HttpState {
    pub fn new(controller: ControllerHandle, ui: watch::Receiver<UiState>) -> Self {
        Self { controller, ui }
    }
}

#[derive(Serialize)]
struct ApiState {
    playback: PlaybackSnapshot,
    ui: UiState,
}

#[derive(Serialize)]
struct ApiError {
    error: String,
}

fn api_error(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ApiError {
            error: message.into(),
        }),
    )
        .into_response()
}

pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/api/state", get(get_state))
        .route("/api/play", post(play))
        .route("/api/stop", get(stop).post(stop))
        .route("/api/focus/:change", post(focus))
        .route("/api/suspend", post(suspend))
        .route("/api/resume", post(resume))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub fn start_server(
    bind_address: String,
    port: u16,
    state: HttpState,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let app = router(state);

        let addr = format!("{}:{}", bind_address, port);
        let listener = match TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind HTTP server to {}: {}", addr, e);
                return;
            }
        };

        info!("HTTP API server listening on http://{}", addr);

        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
        {
            error!("HTTP server error: {}", e);
        }
        info!("HTTP API server stopped");
    })
}

async fn get_state(State(state): State<HttpState>) -> Json<ApiState> {
    Json(ApiState {
        playback: state.controller.snapshot(),
        ui: state.ui.borrow().clone(),
    })
}

async fn play(State(state): State<HttpState>, Json(request): Json<StartRequest>) -> Response {
    info!("HTTP API: Play {:?}", request.channel_label);
    match state.controller.start(request).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e @ PlaybackError::InvalidInput(_)) => api_error(StatusCode::BAD_REQUEST, e.to_string()),
        Err(e) => {
            error!("Failed to send play command: {}", e);
            api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

async fn stop(State(state): State<HttpState>) -> StatusCode {
    info!("HTTP API: Stop");
    if let Err(e) = state.controller.stop().await {
        error!("Failed to send stop command: {}", e);
        return StatusCode::INTERNAL_SERVER_ERROR;
    }
    StatusCode::OK
}

async fn focus(State(state): State<HttpState>, Path(change): Path<String>) -> Response {
    let change: FocusChange = match change.parse() {
        Ok(c) => c,
        Err(e) => {
            warn!("HTTP API: {}", e);
            return api_error(StatusCode::BAD_REQUEST, e.to_string());
        }
    };
    info!("HTTP API: Focus {:?}", change);
    if let Err(e) = state.controller.focus(change).await {
        error!("Failed to send focus change: {}", e);
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    StatusCode::OK.into_response()
}

async fn suspend(State(state): State<HttpState>) -> StatusCode {
    info!("HTTP API: Suspend");
    if let Err(e) = state.controller.suspend().await {
        error!("Failed to send suspend: {}", e);
        return StatusCode::INTERNAL_SERVER_ERROR;
    }
    StatusCode::OK
}

async fn resume(State(state): State<HttpState>) -> StatusCode {
    info!("HTTP API: Resume");
    if let Err(e) = state.controller.resume().await {
        error!("Failed to send resume: {}", e);
        return StatusCode::INTERNAL_SERVER_ERROR;
    }
    StatusCode::OK
}
