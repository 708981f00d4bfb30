//! HTTP API over a [`LoadTestEngine`].
//!
//! Routes:
//!
//! - `GET  /api/health` engine status
//! - `POST /api/start-test` start a run (body: `RunConfig` JSON)
//! - `POST /api/stop-test` stop the active run
//! - `GET  /api/test-progress` server-sent progress events
//! - `GET  /api/topic-counts` broker-side record counts
//! - `GET  /api/database-counts` persisted row counts
//! - `POST /api/test-message` publish one record (`?kind=alarm` optional)
//! - `GET  /api/messages/recent` recently consumed records

use anyhow::Context;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::future;
use futures::stream::{self, Stream, StreamExt};
use loadtest_telemetry::{
    LoadTestEngine, ProgressEvent, RecordKind, RunConfig, SendError, StartError,
};
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const CONNECTED_FRAME: &str = r#"{"type":"connected"}"#;

#[derive(Clone)]
struct AppState {
    engine: Arc<LoadTestEngine>,
    shutdown: CancellationToken,
}

/// Build the API router. Open progress streams end when `shutdown` fires.
pub fn router(engine: Arc<LoadTestEngine>, shutdown: CancellationToken) -> Router {
    Router::new()
        .route("/api/health", get(handle_health))
        .route("/api/start-test", post(handle_start_test))
        .route("/api/stop-test", post(handle_stop_test))
        .route("/api/test-progress", get(handle_test_progress))
        .route("/api/topic-counts", get(handle_topic_counts))
        .route("/api/database-counts", get(handle_database_counts))
        .route("/api/test-message", post(handle_test_message))
        .route("/api/messages/recent", get(handle_recent_messages))
        .with_state(AppState { engine, shutdown })
}

/// Serve the API on `listener` until `shutdown` fires.
pub async fn serve(
    listener: TcpListener,
    engine: Arc<LoadTestEngine>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let addr = listener.local_addr().context("Failed to read listener address")?;
    info!("HTTP API listening on {addr}");

    axum::serve(listener, router(engine, shutdown.clone()))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .context("HTTP server failed")
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

async fn handle_health(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.engine.status())
}

async fn handle_start_test(
    State(state): State<AppState>,
    body: Result<Json<RunConfig>, JsonRejection>,
) -> Response {
    let Json(config) = match body {
        Ok(body) => body,
        Err(rejection) => return error_response(StatusCode::BAD_REQUEST, rejection.body_text()),
    };

    match state.engine.scheduler().start(config) {
        Ok(()) => Json(json!({ "accepted": true })).into_response(),
        Err(e @ StartError::AlreadyRunning) => error_response(StatusCode::CONFLICT, e.to_string()),
        Err(e @ StartError::Invalid(_)) => error_response(StatusCode::BAD_REQUEST, e.to_string()),
        Err(e @ StartError::NotConnected(_)) => {
            error_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string())
        }
    }
}

async fn handle_stop_test(State(state): State<AppState>) -> Response {
    match state.engine.scheduler().stop() {
        Ok(()) => Json(json!({ "stopped": true })).into_response(),
        Err(e) => error_response(StatusCode::CONFLICT, e.to_string()),
    }
}

async fn handle_test_progress(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let observer = state.engine.broadcaster().subscribe();
    info!("Progress stream opened (observer {})", observer.id());

    let connected = stream::once(future::ready(Ok(Event::default().data(CONNECTED_FRAME))));
    let events = ReceiverStream::new(observer.into_receiver())
        .filter_map(|event| future::ready(progress_frame(&event)));

    Sse::new(
        connected
            .chain(events)
            .take_until(state.shutdown.cancelled_owned()),
    )
    .keep_alive(KeepAlive::default())
}

fn progress_frame(event: &ProgressEvent) -> Option<Result<Event, Infallible>> {
    match serde_json::to_string(event) {
        Ok(data) => Some(Ok(Event::default().data(data))),
        Err(e) => {
            warn!("Dropping progress event that failed to serialize: {e}");
            None
        }
    }
}

async fn handle_topic_counts(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.engine.counts().topic_counts_or_zero().await)
}

async fn handle_database_counts(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.engine.counts().persisted_counts_or_zero().await)
}

#[derive(Deserialize)]
struct TestMessageParams {
    kind: Option<RecordKind>,
}

async fn handle_test_message(
    State(state): State<AppState>,
    Query(params): Query<TestMessageParams>,
) -> Response {
    let kind = params.kind.unwrap_or(RecordKind::Telemetry);
    match state.engine.scheduler().publish_one(kind).await {
        Ok(()) => Json(json!({ "sent": true, "kind": kind })).into_response(),
        Err(e @ SendError::NotConnected(_)) => {
            error_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string())
        }
        Err(e) => {
            warn!("Test message failed: {e}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

async fn handle_recent_messages(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.engine.connection().inspector().recent())
}
