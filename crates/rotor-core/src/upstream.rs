use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use wreq::Client;

use rotor_protocol::gemini::error::GeminiErrorResponse;
use rotor_protocol::gemini::generate_content::request::GenerateContentRequestBody;
use rotor_protocol::gemini::generate_content::response::GenerateContentResponse;
use rotor_protocol::gemini::list_models::ListModelsResponse;
use rotor_protocol::sse::SseParser;

use crate::classify::UpstreamError;

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// The upstream seam. `generate_stream` hands back a channel of parsed
/// response fragments; an `Ok` return means the upstream accepted the call
/// (2xx with a reader attached), so stream errors past that point surface
/// as early channel closure rather than as an `Err`.
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn generate(
        &self,
        secret: &str,
        model: &str,
        request: &GenerateContentRequestBody,
    ) -> Result<GenerateContentResponse, UpstreamError>;

    async fn generate_stream(
        &self,
        secret: &str,
        model: &str,
        request: &GenerateContentRequestBody,
    ) -> Result<mpsc::Receiver<GenerateContentResponse>, UpstreamError>;

    async fn list_models(&self, secret: &str) -> Result<ListModelsResponse, UpstreamError>;
}

#[derive(Debug, Clone)]
pub struct GeminiClientConfig {
    pub base_url: String,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub stream_idle_timeout: Duration,
}

impl Default for GeminiClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(120),
            stream_idle_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Clone)]
pub struct GeminiClient {
    client: Client,
    config: GeminiClientConfig,
}

impl GeminiClient {
    pub fn new(config: GeminiClientConfig) -> Result<Self, wreq::Error> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .read_timeout(config.stream_idle_timeout)
            .build()?;
        Ok(Self { client, config })
    }

    fn generate_url(&self, model: &str, stream: bool) -> String {
        if stream {
            format!(
                "{}/models/{}:streamGenerateContent?alt=sse",
                self.config.base_url, model
            )
        } else {
            format!("{}/models/{}:generateContent", self.config.base_url, model)
        }
    }
}

#[async_trait]
impl Upstream for GeminiClient {
    async fn generate(
        &self,
        secret: &str,
        model: &str,
        request: &GenerateContentRequestBody,
    ) -> Result<GenerateContentResponse, UpstreamError> {
        let payload = serde_json::to_vec(request)
            .map_err(|err| UpstreamError::transport(format!("encode request: {err}")))?;
        let resp = self
            .client
            .post(self.generate_url(model, false))
            .header("x-goog-api-key", secret)
            .header("content-type", "application/json")
            .body(payload)
            .send()
            .await
            .map_err(map_wreq_error)?;

        let status = resp.status().as_u16();
        let body = resp.bytes().await.map_err(map_wreq_error)?;
        if !(200..300).contains(&status) {
            return Err(UpstreamError::http(status, GeminiErrorResponse::message_from_body(&body)));
        }
        serde_json::from_slice(&body)
            .map_err(|err| UpstreamError::transport(format!("decode response: {err}")))
    }

    async fn generate_stream(
        &self,
        secret: &str,
        model: &str,
        request: &GenerateContentRequestBody,
    ) -> Result<mpsc::Receiver<GenerateContentResponse>, UpstreamError> {
        let payload = serde_json::to_vec(request)
            .map_err(|err| UpstreamError::transport(format!("encode request: {err}")))?;
        let resp = self
            .client
            .post(self.generate_url(model, true))
            .header("x-goog-api-key", secret)
            .header("content-type", "application/json")
            .body(payload)
            .send()
            .await
            .map_err(map_wreq_error)?;

        let status = resp.status().as_u16();
        if !(200..300).contains(&status) {
            let body = resp.bytes().await.map_err(map_wreq_error)?;
            return Err(UpstreamError::http(status, GeminiErrorResponse::message_from_body(&body)));
        }

        let idle_timeout = self.config.stream_idle_timeout;
        let (tx, rx) = mpsc::channel::<GenerateContentResponse>(16);
        tokio::spawn(async move {
            let mut stream = resp.bytes_stream();
            let mut parser = SseParser::new();
            loop {
                let next = tokio::time::timeout(idle_timeout, stream.next()).await;
                let item = match next {
                    Ok(item) => item,
                    Err(_) => break,
                };
                let Some(item) = item else {
                    break;
                };
                let chunk = match item {
                    Ok(chunk) => chunk,
                    Err(_) => break,
                };
                for payload in parser.push_bytes(&chunk) {
                    if forward_payload(&tx, &payload).await.is_err() {
                        return;
                    }
                }
            }
            for payload in parser.finish() {
                if forward_payload(&tx, &payload).await.is_err() {
                    return;
                }
            }
        });

        Ok(rx)
    }

    async fn list_models(&self, secret: &str) -> Result<ListModelsResponse, UpstreamError> {
        let resp = self
            .client
            .get(format!("{}/models", self.config.base_url))
            .header("x-goog-api-key", secret)
            .send()
            .await
            .map_err(map_wreq_error)?;

        let status = resp.status().as_u16();
        let body = resp.bytes().await.map_err(map_wreq_error)?;
        if !(200..300).contains(&status) {
            return Err(UpstreamError::http(status, GeminiErrorResponse::message_from_body(&body)));
        }
        serde_json::from_slice(&body)
            .map_err(|err| UpstreamError::transport(format!("decode model list: {err}")))
    }
}

async fn forward_payload(
    tx: &mpsc::Sender<GenerateContentResponse>,
    payload: &str,
) -> Result<(), ()> {
    if payload == "[DONE]" {
        return Ok(());
    }
    let Ok(response) = serde_json::from_str::<GenerateContentResponse>(payload) else {
        // Unparseable frames are dropped rather than killing the stream.
        return Ok(());
    };
    tx.send(response).await.map_err(|_| ())
}

fn map_wreq_error(err: wreq::Error) -> UpstreamError {
    UpstreamError::transport(err.to_string())
}
