use std::io;
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_core::Stream;
use futures_util::StreamExt;
use http::StatusCode;
use rand::seq::{IndexedRandom, SliceRandom};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::warn;

use rotor_pool::pool::InvalidReason;
use rotor_pool::{Credential, CredentialPool, SettingsStore, StreamSettings};
use rotor_protocol::gemini::generate_content::request::GenerateContentRequestBody;
use rotor_protocol::openai::chat_completions::request::ChatCompletionRequestBody;
use rotor_protocol::openai::list_models::ModelList;
use rotor_protocol::sse::{DONE_FRAME, data_frame};
use rotor_transform::{
    ChunkPolicy, collect_text, completion, final_chunk, models_to_openai, split_chunks,
    stream_chunk, to_gemini,
};

use crate::attempt::{AttemptRecord, AttemptSink};
use crate::classify::{ErrorCategory, UpstreamError, classify};
use crate::error::ProxyError;
use crate::strategy::{DeliveryMode, select_mode};
use crate::upstream::Upstream;

pub const SSE_CONTENT_TYPE: &str = "text/event-stream";

/// Substituted when a real upstream stream completes without any content,
/// so the caller never receives a contentless stream.
pub const APOLOGY_TEXT: &str =
    "Sorry, I could not produce a response this time. Please try again.";

#[derive(Debug, Clone)]
pub struct DispatchOptions {
    pub disguise: bool,
    /// Wall-clock bound on a real stream; on breach the stream is
    /// finalized early as a normal completion, not an error.
    pub stream_deadline: Duration,
    pub chunk_policy: ChunkPolicy,
    pub chunk_interval: Duration,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            disguise: false,
            stream_deadline: Duration::from_secs(25),
            chunk_policy: ChunkPolicy::default(),
            chunk_interval: Duration::from_millis(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RequestContext {
    pub trace_id: String,
    pub caller_ip: Option<IpAddr>,
    pub access_key_id: Option<i64>,
}

/// Body of an SSE response, framed and ready for the HTTP layer.
pub struct StreamBody {
    pub content_type: &'static str,
    pub stream: Pin<Box<dyn Stream<Item = Result<Bytes, io::Error>> + Send>>,
}

impl StreamBody {
    fn from_receiver(rx: mpsc::Receiver<Bytes>) -> Self {
        Self {
            content_type: SSE_CONTENT_TYPE,
            stream: Box::pin(ReceiverStream::new(rx).map(Ok::<Bytes, io::Error>)),
        }
    }
}

impl std::fmt::Debug for StreamBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamBody")
            .field("content_type", &self.content_type)
            .field("stream", &"<opaque>")
            .finish()
    }
}

#[derive(Debug)]
pub enum Delivery {
    Json(Bytes),
    Stream(StreamBody),
}

/// Per-request failover controller: shuffles the eligible credentials,
/// tries them one at a time with the selected delivery mode, and either
/// returns the first success or synthesizes an exhaustion error from the
/// last failure.
pub struct Dispatcher {
    pool: Arc<CredentialPool>,
    upstream: Arc<dyn Upstream>,
    settings: Arc<dyn SettingsStore>,
    sink: Arc<dyn AttemptSink>,
    options: DispatchOptions,
}

impl Dispatcher {
    pub fn new(
        pool: Arc<CredentialPool>,
        upstream: Arc<dyn Upstream>,
        settings: Arc<dyn SettingsStore>,
        sink: Arc<dyn AttemptSink>,
        options: DispatchOptions,
    ) -> Self {
        Self {
            pool,
            upstream,
            settings,
            sink,
            options,
        }
    }

    pub async fn chat_completions(
        &self,
        ctx: &RequestContext,
        request: ChatCompletionRequestBody,
    ) -> Result<Delivery, ProxyError> {
        if request.messages.is_empty() {
            return Err(ProxyError::bad_request("messages must not be empty"));
        }
        if request.model.is_empty() {
            return Err(ProxyError::bad_request("model must not be empty"));
        }

        let settings = self.stream_settings().await;
        let mode = select_mode(request.wants_stream(), settings);

        let mut candidates = self
            .pool
            .candidates()
            .await
            .map_err(|err| ProxyError::no_available_credentials(err.to_string()))?;
        if candidates.is_empty() {
            return Err(ProxyError::no_available_credentials("no available API keys"));
        }
        candidates.shuffle(&mut rand::rng());
        let total = candidates.len();

        let upstream_request = to_gemini(&request, self.options.disguise);
        let model = request.model.clone();

        let mut last_error: Option<UpstreamError> = None;
        for credential in candidates {
            let started = Instant::now();
            // Usage counts the attempt, not the outcome.
            self.pool.record_usage(credential.id);
            let result = match mode {
                DeliveryMode::Buffered => {
                    self.attempt_buffered(&credential, &model, &upstream_request)
                        .await
                }
                DeliveryMode::FakeStream => {
                    self.attempt_fake_stream(&credential, &model, &upstream_request)
                        .await
                }
                DeliveryMode::RealStream => {
                    self.attempt_real_stream(&credential, &model, &upstream_request)
                        .await
                }
            };
            match result {
                Ok(delivery) => {
                    self.sink.record(AttemptRecord {
                        trace_id: ctx.trace_id.clone(),
                        caller_ip: ctx.caller_ip,
                        access_key_id: ctx.access_key_id,
                        credential_id: credential.id,
                        model: model.clone(),
                        stream: mode != DeliveryMode::Buffered,
                        status: 200,
                        elapsed: started.elapsed(),
                        error: None,
                    });
                    return Ok(delivery);
                }
                Err(err) => {
                    let category = classify(&err);
                    self.sink.record(AttemptRecord {
                        trace_id: ctx.trace_id.clone(),
                        caller_ip: ctx.caller_ip,
                        access_key_id: ctx.access_key_id,
                        credential_id: credential.id,
                        model: model.clone(),
                        stream: mode != DeliveryMode::Buffered,
                        status: category.status_class(),
                        elapsed: started.elapsed(),
                        error: Some(err.message.clone()),
                    });
                    if category.invalidates_credential() {
                        self.pool
                            .invalidate(credential.id, InvalidReason::InvalidApiKey);
                    }
                    if !category.retryable() {
                        return Err(ProxyError::new(terminal_status(category), err.message));
                    }
                    last_error = Some(err);
                }
            }
        }

        Err(exhaustion_error(total, last_error))
    }

    /// Model listing never fails; any upstream or pool problem degrades to
    /// an empty list.
    pub async fn list_models(&self) -> ModelList {
        let candidates = match self.pool.candidates().await {
            Ok(candidates) => candidates,
            Err(err) => {
                warn!(event = "models.pool_failed", error = %err);
                return ModelList::empty();
            }
        };
        let Some(credential) = candidates.choose(&mut rand::rng()) else {
            return ModelList::empty();
        };
        match self.upstream.list_models(credential.secret.as_ref()).await {
            Ok(listing) => models_to_openai(listing.models),
            Err(err) => {
                warn!(event = "models.upstream_failed", error = %err);
                ModelList::empty()
            }
        }
    }

    async fn stream_settings(&self) -> StreamSettings {
        match self.settings.stream_settings().await {
            Ok(settings) => settings,
            Err(err) => {
                warn!(
                    event = "dispatch.settings_failed",
                    error = %err,
                    "falling back to buffered delivery"
                );
                StreamSettings::default()
            }
        }
    }

    async fn attempt_buffered(
        &self,
        credential: &Credential,
        model: &str,
        request: &GenerateContentRequestBody,
    ) -> Result<Delivery, UpstreamError> {
        let text = self.fetch_text(credential, model, request).await?;
        let body = serde_json::to_vec(&completion(text, model))
            .map_err(|err| UpstreamError::transport(format!("encode completion: {err}")))?;
        Ok(Delivery::Json(Bytes::from(body)))
    }

    async fn attempt_fake_stream(
        &self,
        credential: &Credential,
        model: &str,
        request: &GenerateContentRequestBody,
    ) -> Result<Delivery, UpstreamError> {
        let text = self.fetch_text(credential, model, request).await?;
        let chunks = split_chunks(&text, &self.options.chunk_policy);
        let pacing = self.options.chunk_interval;
        let model = model.to_string();

        let (tx, rx) = mpsc::channel::<Bytes>(16);
        tokio::spawn(async move {
            for (index, piece) in chunks.into_iter().enumerate() {
                if index > 0 {
                    tokio::time::sleep(pacing).await;
                }
                if !send_frame(&tx, data_frame(&stream_chunk(piece, &model))).await {
                    return;
                }
            }
            finish_stream(&tx, &model).await;
        });
        Ok(Delivery::Stream(StreamBody::from_receiver(rx)))
    }

    async fn attempt_real_stream(
        &self,
        credential: &Credential,
        model: &str,
        request: &GenerateContentRequestBody,
    ) -> Result<Delivery, UpstreamError> {
        // An accepted upstream stream is the commit point: from here the
        // attempt counts as a success and stream problems finalize the
        // response instead of advancing to the next credential.
        let mut upstream_rx = self
            .upstream
            .generate_stream(credential.secret.as_ref(), model, request)
            .await?;

        let deadline = tokio::time::Instant::now() + self.options.stream_deadline;
        let model = model.to_string();
        let (tx, rx) = mpsc::channel::<Bytes>(16);
        tokio::spawn(async move {
            let mut produced = false;
            loop {
                let next = tokio::time::timeout_at(deadline, upstream_rx.recv()).await;
                let Ok(item) = next else {
                    // Deadline reached; finalize as a normal completion.
                    break;
                };
                let Some(response) = item else {
                    break;
                };
                let text = collect_text(&response);
                if text.is_empty() {
                    continue;
                }
                produced = true;
                if !send_frame(&tx, data_frame(&stream_chunk(text, &model))).await {
                    return;
                }
            }
            if !produced
                && !send_frame(&tx, data_frame(&stream_chunk(APOLOGY_TEXT, &model))).await
            {
                return;
            }
            finish_stream(&tx, &model).await;
        });
        Ok(Delivery::Stream(StreamBody::from_receiver(rx)))
    }

    async fn fetch_text(
        &self,
        credential: &Credential,
        model: &str,
        request: &GenerateContentRequestBody,
    ) -> Result<String, UpstreamError> {
        let response = self
            .upstream
            .generate(credential.secret.as_ref(), model, request)
            .await?;
        let text = collect_text(&response);
        if text.is_empty() {
            return Err(UpstreamError::empty_response());
        }
        Ok(text)
    }
}

async fn send_frame(tx: &mpsc::Sender<Bytes>, frame: Option<Bytes>) -> bool {
    match frame {
        Some(frame) => tx.send(frame).await.is_ok(),
        None => true,
    }
}

async fn finish_stream(tx: &mpsc::Sender<Bytes>, model: &str) {
    send_frame(tx, data_frame(&final_chunk(model))).await;
    let _ = tx.send(Bytes::from_static(DONE_FRAME)).await;
}

fn terminal_status(category: ErrorCategory) -> StatusCode {
    match category {
        ErrorCategory::Forbidden => StatusCode::FORBIDDEN,
        _ => StatusCode::UNAUTHORIZED,
    }
}

fn exhaustion_error(total: usize, last_error: Option<UpstreamError>) -> ProxyError {
    let Some(last) = last_error else {
        return ProxyError::no_available_credentials("no available API keys");
    };
    match classify(&last) {
        ErrorCategory::Quota => {
            ProxyError::new(StatusCode::TOO_MANY_REQUESTS, "all keys exhausted quota")
        }
        ErrorCategory::InvalidKey => ProxyError::new(StatusCode::UNAUTHORIZED, "all keys invalid"),
        ErrorCategory::EmptyResponse => {
            ProxyError::new(StatusCode::BAD_GATEWAY, "all keys returned empty response")
        }
        _ => ProxyError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            format!("all {total} keys failed, last error: {}", last.message),
        ),
    }
}
