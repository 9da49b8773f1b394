use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::response::Response;
use axum::routing::{get, post};
use bytes::Bytes;
use http::header::{CACHE_CONTROL, CONTENT_TYPE};
use http::{HeaderMap, HeaderValue, StatusCode};
use tracing::{info, warn};
use uuid::Uuid;

use rotor_core::{Delivery, Dispatcher, ProxyError, RequestContext, StreamBody, authenticate};
use rotor_pool::MemoryStore;
use rotor_protocol::openai::chat_completions::request::ChatCompletionRequestBody;

pub(crate) struct AppState {
    pub(crate) dispatcher: Dispatcher,
    pub(crate) access_keys: Arc<MemoryStore>,
    pub(crate) auth_enabled: bool,
}

pub(crate) fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/chat/completions", post(chat_completions))
        .route("/v1/models", get(list_models))
        .route("/models", get(list_models))
        .with_state(state)
}

async fn chat_completions(
    State(state): State<Arc<AppState>>,
    ConnectInfo(caller): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let trace_id = Uuid::new_v4().to_string();
    let started_at = Instant::now();

    let access_key_id = if state.auth_enabled {
        match authenticate(state.access_keys.as_ref(), &headers).await {
            Ok(key) => Some(key.id),
            Err(err) => return error_response(err, &trace_id),
        }
    } else {
        None
    };

    let request: ChatCompletionRequestBody = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(err) => {
            return error_response(
                ProxyError::bad_request(format!("invalid request body: {err}")),
                &trace_id,
            );
        }
    };

    info!(
        event = "request_received",
        trace_id = %trace_id,
        caller_ip = %caller.ip(),
        model = %request.model,
        is_stream = request.wants_stream(),
    );

    let ctx = RequestContext {
        trace_id: trace_id.clone(),
        caller_ip: Some(caller.ip()),
        access_key_id,
    };
    match state.dispatcher.chat_completions(&ctx, request).await {
        Ok(Delivery::Json(body)) => {
            info!(
                event = "request_completed",
                trace_id = %trace_id,
                status = 200,
                elapsed_ms = started_at.elapsed().as_millis() as u64,
                is_stream = false,
            );
            json_response(StatusCode::OK, body, &trace_id)
        }
        Ok(Delivery::Stream(stream)) => {
            info!(
                event = "request_completed",
                trace_id = %trace_id,
                status = 200,
                elapsed_ms = started_at.elapsed().as_millis() as u64,
                is_stream = true,
            );
            stream_response(stream, &trace_id)
        }
        Err(err) => {
            warn!(
                event = "request_failed",
                trace_id = %trace_id,
                status = err.status.as_u16(),
                elapsed_ms = started_at.elapsed().as_millis() as u64,
            );
            error_response(err, &trace_id)
        }
    }
}

async fn list_models(State(state): State<Arc<AppState>>) -> Response {
    let trace_id = Uuid::new_v4().to_string();
    let listing = state.dispatcher.list_models().await;
    match serde_json::to_vec(&listing) {
        Ok(body) => json_response(StatusCode::OK, Bytes::from(body), &trace_id),
        Err(err) => error_response(
            ProxyError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("encode model list: {err}"),
            ),
            &trace_id,
        ),
    }
}

fn json_response(status: StatusCode, body: Bytes, trace_id: &str) -> Response {
    let mut resp = Response::new(Body::from(body));
    *resp.status_mut() = status;
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    attach_request_id(&mut resp, trace_id);
    resp
}

fn stream_response(body: StreamBody, trace_id: &str) -> Response {
    let mut resp = Response::new(Body::from_stream(body.stream));
    *resp.status_mut() = StatusCode::OK;
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(body.content_type));
    resp.headers_mut()
        .insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    attach_request_id(&mut resp, trace_id);
    resp
}

fn error_response(err: ProxyError, trace_id: &str) -> Response {
    json_response(err.status, err.body, trace_id)
}

fn attach_request_id(resp: &mut Response, trace_id: &str) {
    if let Ok(value) = HeaderValue::from_str(trace_id) {
        resp.headers_mut().insert("x-rotor-request-id", value);
    }
}
