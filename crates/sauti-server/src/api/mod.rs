//! HTTP control surface for the streaming engine.
//!
//! One stream at a time: `POST /v1/speak` builds a fresh daemon and
//! orchestrator for the request, and the control and status routes act on
//! whichever stream currently occupies the slot.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info};
use uuid::Uuid;

use sauti_core::adaptive::AdaptiveBufferController;
use sauti_core::audio::WavFileSink;
use sauti_core::daemon::{
    DaemonConfig, HeartbeatMonitor, SessionState, StatusReport, StreamingDaemon,
};
use sauti_core::pipeline::{session_is_active, Orchestrator, SpeakRequest, SynthesisClient};
use sauti_core::retry::{CircuitBreaker, RetryExecutor};

use crate::error::ApiError;
use crate::state::AppState;

/// Build the API router with all routes and middleware.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/speak", post(speak))
        .route("/v1/control/pause", post(pause))
        .route("/v1/control/resume", post(resume))
        .route("/v1/control/stop", post(stop))
        .route("/v1/status", get(status))
        .route("/v1/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct SpeakBody {
    text: String,
}

#[derive(Debug, Serialize)]
struct SpeakResponse {
    session_id: Uuid,
    output_path: String,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    healthy: bool,
    state: Option<SessionState>,
}

/// Start streaming a new utterance.
async fn speak(
    State(state): State<AppState>,
    Json(body): Json<SpeakBody>,
) -> Result<(StatusCode, Json<SpeakResponse>), ApiError> {
    if body.text.trim().is_empty() {
        return Err(ApiError::bad_request("text must not be empty"));
    }

    let mut slot = state.active.write().await;
    if let Some(current) = slot.as_ref() {
        if session_is_active(current.daemon().session_state()) {
            return Err(ApiError::conflict(format!(
                "session {} is still streaming",
                current.daemon().session_id()
            )));
        }
    }

    let config = &state.config;
    let format = config.audio.format();

    tokio::fs::create_dir_all(&config.audio.output_dir)
        .await
        .map_err(|e| ApiError::internal(format!("cannot create output dir: {e}")))?;
    let output_path = config
        .audio
        .output_dir
        .join(format!("{}.wav", Uuid::new_v4()));
    let sink = WavFileSink::create(&output_path, format)?;

    let synthesizer = SynthesisClient::new(config.synthesis.clone())?;
    let controller = AdaptiveBufferController::new(config.buffer.tuning(), format);

    let (abort_tx, abort_rx) = watch::channel(false);
    let daemon_config = DaemonConfig {
        heartbeat_interval: config.heartbeat.interval(),
        ring_capacity_bytes: config.ring.capacity_bytes,
        overflow_policy: config.ring.overflow_policy,
        initial_buffer: controller.current().clone(),
        ..Default::default()
    };
    let daemon = StreamingDaemon::spawn(daemon_config, format, Box::new(sink), abort_rx.clone());

    let breaker = Arc::new(CircuitBreaker::with_settings(
        config.synthesis.endpoint.clone(),
        config.retry.breaker_threshold,
        config.retry.breaker_cooldown(),
    ));
    let executor =
        Arc::new(RetryExecutor::new(config.retry.policy(), breaker).with_abort(abort_rx));
    let monitor = Arc::new(HeartbeatMonitor::new(
        config.heartbeat.interval(),
        config.heartbeat.miss_threshold,
    ));

    let orchestrator = Arc::new(Orchestrator::new(
        synthesizer,
        daemon,
        executor,
        controller,
        monitor,
        abort_tx,
        control_window(config.heartbeat.interval()),
    ));
    let session_id = orchestrator.daemon().session_id();
    *slot = Some(Arc::clone(&orchestrator));
    drop(slot);

    info!(session = %session_id, chars = body.text.len(), "starting stream");
    tokio::spawn(async move {
        match orchestrator.run(SpeakRequest { text: body.text }).await {
            Ok(summary) => info!(
                session = %session_id,
                chunks = summary.chunks_delivered,
                bytes = summary.bytes_delivered,
                ttfa_ms = ?summary.time_to_first_audio_ms,
                underruns = summary.underruns,
                "stream finished"
            ),
            Err(e) => error!(session = %session_id, error = %e, "stream failed"),
        }
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(SpeakResponse {
            session_id,
            output_path: output_path.display().to_string(),
        }),
    ))
}

async fn pause(State(state): State<AppState>) -> Result<Json<StatusReport>, ApiError> {
    let orchestrator = current_stream(&state).await?;
    orchestrator.pause().await?;
    Ok(Json(orchestrator.status().await?))
}

async fn resume(State(state): State<AppState>) -> Result<Json<StatusReport>, ApiError> {
    let orchestrator = current_stream(&state).await?;
    orchestrator.resume().await?;
    Ok(Json(orchestrator.status().await?))
}

async fn stop(State(state): State<AppState>) -> Result<Json<StatusReport>, ApiError> {
    let orchestrator = current_stream(&state).await?;
    orchestrator.abort();
    orchestrator.stop().await?;
    Ok(Json(orchestrator.status().await?))
}

async fn status(State(state): State<AppState>) -> Result<Json<StatusReport>, ApiError> {
    let orchestrator = current_stream(&state).await?;
    Ok(Json(orchestrator.status().await?))
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let slot = state.active.read().await;
    match slot.as_ref() {
        Some(orchestrator) => Json(HealthResponse {
            healthy: orchestrator.is_healthy(),
            state: Some(orchestrator.daemon().session_state()),
        }),
        None => Json(HealthResponse {
            healthy: true,
            state: None,
        }),
    }
}

async fn current_stream(
    state: &AppState,
) -> Result<Arc<Orchestrator<SynthesisClient>>, ApiError> {
    state
        .active
        .read()
        .await
        .as_ref()
        .cloned()
        .ok_or_else(|| ApiError::not_found("no stream has been started"))
}

/// Telemetry tick cadence: a fraction of the heartbeat interval so missed
/// beats are noticed between heartbeats, floored for very fast configs.
fn control_window(heartbeat: Duration) -> Duration {
    (heartbeat / 2).max(Duration::from_millis(100))
}
