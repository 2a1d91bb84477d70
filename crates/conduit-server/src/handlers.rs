use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use conduit_core::cancel::CancelFlag;
use conduit_core::context::{RequestContext, UiContext};
use conduit_core::ids::{RequestId, SessionId};
use conduit_core::queue;
use conduit_core::wire::{GenerateRequest, HealthResponse, SESSION_HEADER};
use conduit_engine::EngineRequest;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::Instrument;

use crate::prompt::build_prompt;
use crate::server::AppState;
use crate::stream_loop::{spawn_engine, Pump};

/// `POST /agent/generate`: stream the agent's answer as marker-coded text.
pub async fn generate(State(state): State<AppState>, body: Bytes) -> Response {
    let request: GenerateRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            tracing::warn!(error = %e, "rejecting malformed generate request");
            return (StatusCode::BAD_REQUEST, Json(serde_json::json!({"error": e.to_string()}))).into_response();
        }
    };

    let ui = request.context.map(UiContext::from_value).unwrap_or_default();
    let session_id = resolve_session_id(request.session_id.as_deref(), &ui);
    let request_id = RequestId::new();
    let span = tracing::info_span!("generate", request_id = %request_id, session_id = %session_id);
    span.in_scope(|| tracing::info!(chars = request.message.len(), "request received"));

    if state.registry.release(&session_id) {
        span.in_scope(|| tracing::debug!("cleared stale cancellation"));
    }

    let cancel = CancelFlag::new();
    let (producer, consumer) = queue::session_channel(cancel.clone(), Arc::clone(&state.registry), session_id.clone());
    let ctx = RequestContext::from_ui_context(session_id.clone(), ui)
        .with_progress(producer.progress_sink())
        .with_cancel_flag(cancel.clone())
        .with_registry(Arc::clone(&state.registry));

    let engine_request = EngineRequest {
        session_id: session_id.clone(),
        prompt: build_prompt(state.config.role, &request.message, ctx.ui_context()),
        message: request.message,
        history: state.sessions.history(&session_id),
        tools: Arc::clone(&state.tools),
    };

    let task = spawn_engine(
        ctx,
        Arc::clone(&state.engine),
        engine_request,
        Arc::clone(&state.sessions),
        producer,
    );

    let (body_tx, body_rx) = mpsc::channel(state.config.body_buffer);
    let pump = Pump {
        session_id: session_id.clone(),
        heartbeat: state.config.heartbeat_interval,
        cancel,
        registry: Arc::clone(&state.registry),
    };
    tokio::spawn(pump.run(consumer, body_tx, task).instrument(span));

    let mut response = Body::from_stream(ReceiverStream::new(body_rx)).into_response();
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    match HeaderValue::from_str(session_id.as_str()) {
        Ok(value) => {
            headers.insert(HeaderName::from_static(SESSION_HEADER), value);
        }
        Err(e) => tracing::warn!(error = %e, "session id is not a valid header value"),
    }
    response
}

/// `GET /agent/health`
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse::ok(state.config.agent_name.clone()))
}

/// Body `session_id`, else the one carried in the UI context, else a new one.
fn resolve_session_id(explicit: Option<&str>, ui: &UiContext) -> SessionId {
    explicit
        .or(ui.session_id.as_deref())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(SessionId::from_raw)
        .unwrap_or_default()
}
