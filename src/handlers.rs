use std::{convert::Infallible, time::Instant};

use axum::{
    extract::State,
    http::{
        header::{CACHE_CONTROL, CONTENT_TYPE},
        HeaderValue,
    },
    response::{
        sse::{Event, Sse},
        IntoResponse, Response,
    },
    Json,
};
use futures_util::StreamExt;
use tracing::info;

use crate::{
    errors::AppError,
    models::{DebateRequest, DebateResponse, ModelsResponse, ServiceInfo, StreamEvent},
    state::AppState,
};

pub async fn root() -> Json<ServiceInfo> {
    Json(ServiceInfo {
        ok: true,
        service: "multi-llm-debate",
    })
}

pub async fn healthz() -> &'static str {
    "ok"
}

pub async fn metrics(State(state): State<AppState>) -> Response {
    match state.metrics.render() {
        Ok(body) => (
            [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(error) => AppError::Internal(format!("metrics render failed: {error}")).into_response(),
    }
}

pub async fn list_models(State(state): State<AppState>) -> Json<ModelsResponse> {
    Json(ModelsResponse {
        models: state.registry.active_backend_ids().into_iter().collect(),
    })
}

pub async fn debate(
    State(state): State<AppState>,
    Json(request): Json<DebateRequest>,
) -> Response {
    let started = Instant::now();
    let _inflight = state.metrics.inflight_guard();

    let response = match run_debate(&state, request).await {
        Ok(response) => response,
        Err(error) => error.into_response(),
    };

    state.metrics.observe_request(
        "/debate",
        "POST",
        response.status().as_u16(),
        started.elapsed(),
    );
    response
}

async fn run_debate(state: &AppState, request: DebateRequest) -> Result<Response, AppError> {
    let debate = request.into_normalized().map_err(AppError::BadRequest)?;
    info!(
        turns = debate.conversation.len(),
        selected = ?debate.selection.canonical_ids(),
        "debate request accepted"
    );

    let responses = state
        .dispatcher
        .run(debate.conversation, debate.system, &debate.selection)
        .await;

    Ok(Json(DebateResponse { responses }).into_response())
}

pub async fn debate_stream(
    State(state): State<AppState>,
    Json(request): Json<DebateRequest>,
) -> Response {
    let started = Instant::now();
    let response = match open_stream(&state, request) {
        Ok(response) => response,
        Err(error) => error.into_response(),
    };

    state.metrics.observe_request(
        "/debate/stream",
        "POST",
        response.status().as_u16(),
        started.elapsed(),
    );
    response
}

fn open_stream(state: &AppState, request: DebateRequest) -> Result<Response, AppError> {
    let debate = request.into_normalized().map_err(AppError::BadRequest)?;
    info!(
        turns = debate.conversation.len(),
        selected = ?debate.selection.canonical_ids(),
        "debate stream accepted"
    );

    // Released when the client disconnects or the last frame is sent.
    let inflight = state.metrics.inflight_guard();
    let frames = state
        .multiplexer
        .stream(debate.conversation, debate.system, &debate.selection)
        .map(move |event| {
            let _inflight = &inflight;
            Ok::<Event, Infallible>(event_frame(&event))
        });

    let mut response = Sse::new(frames).into_response();
    response
        .headers_mut()
        .insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    response
        .headers_mut()
        .insert("x-accel-buffering", HeaderValue::from_static("no"));
    Ok(response)
}

fn event_frame(event: &StreamEvent) -> Event {
    match serde_json::to_string(event) {
        Ok(serialized) => Event::default().data(serialized),
        Err(error) => {
            let fallback = serde_json::json!({
                "backend_id": event.backend_id(),
                "error": format!("serialization error: {error}"),
            });
            Event::default().data(fallback.to_string())
        }
    }
}
