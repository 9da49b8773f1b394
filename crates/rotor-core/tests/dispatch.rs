use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use http::StatusCode;
use tokio::sync::mpsc;

use rotor_core::{
    APOLOGY_TEXT, AttemptRecord, AttemptSink, Delivery, DispatchOptions, Dispatcher,
    RequestContext, Upstream, UpstreamError,
};
use rotor_pool::{CredentialPool, MemoryStore, StreamSettings};
use rotor_protocol::gemini::generate_content::request::GenerateContentRequestBody;
use rotor_protocol::gemini::generate_content::response::{Candidate, GenerateContentResponse};
use rotor_protocol::gemini::generate_content::types::{Content, ContentRole, FinishReason, Part};
use rotor_protocol::gemini::list_models::{GeminiModel, ListModelsResponse};
use rotor_protocol::openai::chat_completions::request::{
    ChatCompletionRequestBody, ChatMessage, ChatRole,
};
use rotor_protocol::openai::chat_completions::response::ChatCompletion;

#[derive(Clone)]
enum Script {
    Text(&'static str),
    Fail {
        status: Option<u16>,
        message: &'static str,
    },
    Stream(Vec<&'static str>),
    /// Sends its fragments and then keeps the channel open forever.
    Stall(Vec<&'static str>),
}

#[derive(Default)]
struct FakeUpstream {
    scripts: HashMap<String, Script>,
    calls: Mutex<Vec<String>>,
}

impl FakeUpstream {
    fn new(scripts: impl IntoIterator<Item = (&'static str, Script)>) -> Self {
        Self {
            scripts: scripts
                .into_iter()
                .map(|(secret, script)| (secret.to_string(), script))
                .collect(),
            calls: Mutex::new(Vec::new()),
        }
    }

    fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn script_for(&self, secret: &str) -> Result<Script, UpstreamError> {
        self.calls.lock().unwrap().push(secret.to_string());
        self.scripts
            .get(secret)
            .cloned()
            .ok_or_else(|| UpstreamError::transport("no script for secret"))
    }
}

fn text_response(text: &str) -> GenerateContentResponse {
    GenerateContentResponse {
        candidates: vec![Candidate {
            content: Some(Content {
                parts: vec![Part::text(text)],
                role: Some(ContentRole::Model),
            }),
            finish_reason: Some(FinishReason::Stop),
            index: Some(0),
        }],
        ..Default::default()
    }
}

#[async_trait]
impl Upstream for FakeUpstream {
    async fn generate(
        &self,
        secret: &str,
        _model: &str,
        _request: &GenerateContentRequestBody,
    ) -> Result<GenerateContentResponse, UpstreamError> {
        match self.script_for(secret)? {
            Script::Text(text) => Ok(text_response(text)),
            Script::Fail { status, message } => Err(UpstreamError {
                status,
                message: message.to_string(),
            }),
            Script::Stream(fragments) | Script::Stall(fragments) => {
                Ok(text_response(&fragments.concat()))
            }
        }
    }

    async fn generate_stream(
        &self,
        secret: &str,
        _model: &str,
        _request: &GenerateContentRequestBody,
    ) -> Result<mpsc::Receiver<GenerateContentResponse>, UpstreamError> {
        let (fragments, hold_open) = match self.script_for(secret)? {
            Script::Stream(fragments) => (fragments, false),
            Script::Stall(fragments) => (fragments, true),
            Script::Text(text) => (vec![text], false),
            Script::Fail { status, message } => {
                return Err(UpstreamError {
                    status,
                    message: message.to_string(),
                });
            }
        };
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            for fragment in fragments {
                if tx.send(text_response(fragment)).await.is_err() {
                    return;
                }
            }
            if hold_open {
                std::future::pending::<()>().await;
            }
        });
        Ok(rx)
    }

    async fn list_models(&self, _secret: &str) -> Result<ListModelsResponse, UpstreamError> {
        Ok(ListModelsResponse {
            models: vec![GeminiModel {
                name: "models/gemini-2.0-flash".to_string(),
                ..Default::default()
            }],
            ..Default::default()
        })
    }
}

#[derive(Default)]
struct CollectingSink {
    records: Mutex<Vec<AttemptRecord>>,
}

impl CollectingSink {
    fn records(&self) -> Vec<AttemptRecord> {
        self.records.lock().unwrap().clone()
    }
}

impl AttemptSink for CollectingSink {
    fn record(&self, record: AttemptRecord) {
        self.records.lock().unwrap().push(record);
    }
}

struct Harness {
    store: Arc<MemoryStore>,
    upstream: Arc<FakeUpstream>,
    sink: Arc<CollectingSink>,
    dispatcher: Dispatcher,
}

fn harness(
    secrets: &[&'static str],
    scripts: impl IntoIterator<Item = (&'static str, Script)>,
    settings: StreamSettings,
    options: DispatchOptions,
) -> Harness {
    let store = Arc::new(MemoryStore::new());
    store.insert_keys(secrets.iter().copied());
    store.set_stream_settings(settings);
    let pool = Arc::new(CredentialPool::new(store.clone()));
    let upstream = Arc::new(FakeUpstream::new(scripts));
    let sink = Arc::new(CollectingSink::default());
    let dispatcher = Dispatcher::new(
        pool,
        upstream.clone(),
        store.clone(),
        sink.clone(),
        options,
    );
    Harness {
        store,
        upstream,
        sink,
        dispatcher,
    }
}

fn ctx() -> RequestContext {
    RequestContext {
        trace_id: "test-trace".to_string(),
        caller_ip: Some(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 9))),
        access_key_id: Some(1),
    }
}

fn request(stream: bool) -> ChatCompletionRequestBody {
    ChatCompletionRequestBody {
        model: "gemini-2.0-flash".to_string(),
        messages: vec![ChatMessage {
            role: ChatRole::User,
            content: "hi".to_string(),
        }],
        stream: Some(stream),
        max_tokens: None,
        temperature: None,
        top_p: None,
        stop: None,
    }
}

fn completion_text(delivery: &Delivery) -> String {
    let Delivery::Json(body) = delivery else {
        panic!("expected a JSON delivery, got {delivery:?}");
    };
    let completion: ChatCompletion = serde_json::from_slice(body).unwrap();
    completion.choices[0].message.content.clone()
}

async fn drain_stream(delivery: Delivery) -> Vec<String> {
    let Delivery::Stream(body) = delivery else {
        panic!("expected a stream delivery");
    };
    let mut frames = Vec::new();
    let mut stream = body.stream;
    while let Some(frame) = stream.next().await {
        frames.push(String::from_utf8(frame.unwrap().to_vec()).unwrap());
    }
    frames
}

fn stream_content(frames: &[String]) -> String {
    let mut text = String::new();
    for frame in frames {
        let payload = frame
            .trim_end()
            .strip_prefix("data: ")
            .expect("frame starts with data:");
        if payload == "[DONE]" {
            continue;
        }
        let chunk: serde_json::Value = serde_json::from_str(payload).unwrap();
        if let Some(content) = chunk["choices"][0]["delta"]["content"].as_str() {
            text.push_str(content);
        }
    }
    text
}

#[tokio::test]
async fn quota_failures_advance_until_a_key_succeeds() {
    let harness = harness(
        &["k1", "k2", "k3"],
        [
            ("k1", Script::Fail { status: Some(429), message: "Quota exceeded" }),
            ("k2", Script::Fail { status: Some(429), message: "Quota exceeded" }),
            ("k3", Script::Text("Hello")),
        ],
        StreamSettings::default(),
        DispatchOptions::default(),
    );

    let delivery = harness
        .dispatcher
        .chat_completions(&ctx(), request(false))
        .await
        .unwrap();
    assert_eq!(completion_text(&delivery), "Hello");

    let records = harness.sink.records();
    assert!(!records.is_empty() && records.len() <= 3);
    let (successes, failures): (Vec<_>, Vec<_>) =
        records.iter().partition(|record| record.error.is_none());
    assert_eq!(successes.len(), 1);
    assert_eq!(successes[0].status, 200);
    assert!(failures.iter().all(|record| record.status == 429));
    assert!(
        records
            .iter()
            .all(|record| record.caller_ip == Some(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 9))))
    );

    // Quota errors are not credential-invalidity signals.
    tokio::time::sleep(Duration::from_millis(30)).await;
    for id in 1..=3 {
        assert!(harness.store.is_valid(id));
    }
}

#[tokio::test]
async fn invalid_key_is_invalidated_and_exhaustion_maps_to_401() {
    let harness = harness(
        &["k1"],
        [("k1", Script::Fail { status: Some(400), message: "API_KEY_INVALID" })],
        StreamSettings::default(),
        DispatchOptions::default(),
    );

    let err = harness
        .dispatcher
        .chat_completions(&ctx(), request(false))
        .await
        .unwrap_err();
    assert_eq!(err.status, StatusCode::UNAUTHORIZED);
    let body: serde_json::Value = serde_json::from_slice(&err.body).unwrap();
    assert_eq!(body["error"]["message"], "all keys invalid");

    let records = harness.sink.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, 401);

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!harness.store.is_valid(1));
}

#[tokio::test]
async fn empty_pool_fails_fast_with_zero_attempts() {
    let harness = harness(
        &[],
        [],
        StreamSettings::default(),
        DispatchOptions::default(),
    );

    let err = harness
        .dispatcher
        .chat_completions(&ctx(), request(false))
        .await
        .unwrap_err();
    assert_eq!(err.status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(harness.upstream.call_count(), 0);
    assert!(harness.sink.records().is_empty());
}

#[tokio::test]
async fn stream_request_downgrades_silently_when_streaming_is_off() {
    let harness = harness(
        &["k1"],
        [("k1", Script::Text("plain"))],
        StreamSettings::default(),
        DispatchOptions::default(),
    );

    let delivery = harness
        .dispatcher
        .chat_completions(&ctx(), request(true))
        .await
        .unwrap();
    assert_eq!(completion_text(&delivery), "plain");
}

#[tokio::test]
async fn all_quota_exhaustion_synthesizes_429() {
    let harness = harness(
        &["k1", "k2"],
        [
            ("k1", Script::Fail { status: Some(429), message: "quota exceeded for metric" }),
            ("k2", Script::Fail { status: Some(429), message: "quota exceeded for metric" }),
        ],
        StreamSettings::default(),
        DispatchOptions::default(),
    );

    let err = harness
        .dispatcher
        .chat_completions(&ctx(), request(false))
        .await
        .unwrap_err();
    assert_eq!(err.status, StatusCode::TOO_MANY_REQUESTS);
    let body: serde_json::Value = serde_json::from_slice(&err.body).unwrap();
    assert_eq!(body["error"]["message"], "all keys exhausted quota");
    assert_eq!(harness.sink.records().len(), 2);
}

#[tokio::test]
async fn bare_401_stops_the_rotation_immediately() {
    let harness = harness(
        &["k1", "k2", "k3"],
        [
            ("k1", Script::Fail { status: Some(401), message: "credentials rejected" }),
            ("k2", Script::Fail { status: Some(401), message: "credentials rejected" }),
            ("k3", Script::Fail { status: Some(401), message: "credentials rejected" }),
        ],
        StreamSettings::default(),
        DispatchOptions::default(),
    );

    let err = harness
        .dispatcher
        .chat_completions(&ctx(), request(false))
        .await
        .unwrap_err();
    assert_eq!(err.status, StatusCode::UNAUTHORIZED);
    assert_eq!(harness.upstream.call_count(), 1);
    assert_eq!(harness.sink.records().len(), 1);

    tokio::time::sleep(Duration::from_millis(30)).await;
    for id in 1..=3 {
        assert!(harness.store.is_valid(id));
    }
}

#[tokio::test]
async fn empty_buffered_text_exhausts_as_502() {
    let harness = harness(
        &["k1"],
        [("k1", Script::Text(""))],
        StreamSettings::default(),
        DispatchOptions::default(),
    );

    let err = harness
        .dispatcher
        .chat_completions(&ctx(), request(false))
        .await
        .unwrap_err();
    assert_eq!(err.status, StatusCode::BAD_GATEWAY);
    assert_eq!(harness.sink.records()[0].status, 502);
}

#[tokio::test]
async fn fake_stream_rechunks_and_terminates_with_done() {
    let long_text =
        "The quick brown fox jumps over the lazy dog, then circles back around the barn \
         and does the whole run again just to be thorough about the matter at hand.";
    let harness = harness(
        &["k1"],
        [("k1", Script::Text(long_text))],
        StreamSettings {
            real_stream: false,
            fake_stream: true,
        },
        DispatchOptions {
            chunk_interval: Duration::from_millis(1),
            ..DispatchOptions::default()
        },
    );

    let delivery = harness
        .dispatcher
        .chat_completions(&ctx(), request(true))
        .await
        .unwrap();
    let frames = drain_stream(delivery).await;

    assert!(frames.len() > 3, "expected multiple chunks, got {}", frames.len());
    assert_eq!(frames.last().unwrap(), "data: [DONE]\n\n");
    assert_eq!(stream_content(&frames), long_text);

    let records = harness.sink.records();
    assert_eq!(records.len(), 1);
    assert!(records[0].stream);
    assert_eq!(records[0].status, 200);
}

#[tokio::test]
async fn real_stream_forwards_fragments_in_order() {
    let harness = harness(
        &["k1"],
        [("k1", Script::Stream(vec!["Hel", "lo ", "there"]))],
        StreamSettings {
            real_stream: true,
            fake_stream: false,
        },
        DispatchOptions::default(),
    );

    let delivery = harness
        .dispatcher
        .chat_completions(&ctx(), request(true))
        .await
        .unwrap();
    let frames = drain_stream(delivery).await;

    assert_eq!(stream_content(&frames), "Hello there");
    assert_eq!(frames.last().unwrap(), "data: [DONE]\n\n");
}

#[tokio::test]
async fn contentless_real_stream_substitutes_the_apology() {
    let harness = harness(
        &["k1"],
        [("k1", Script::Stream(vec![]))],
        StreamSettings {
            real_stream: true,
            fake_stream: false,
        },
        DispatchOptions::default(),
    );

    let delivery = harness
        .dispatcher
        .chat_completions(&ctx(), request(true))
        .await
        .unwrap();
    let frames = drain_stream(delivery).await;

    assert_eq!(stream_content(&frames), APOLOGY_TEXT);
    assert_eq!(frames.last().unwrap(), "data: [DONE]\n\n");
}

#[tokio::test]
async fn failed_streaming_open_fails_over_to_the_next_key() {
    let harness = harness(
        &["k1", "k2"],
        [
            ("k1", Script::Fail { status: Some(429), message: "quota exceeded" }),
            ("k2", Script::Stream(vec!["ok"])),
        ],
        StreamSettings {
            real_stream: true,
            fake_stream: false,
        },
        DispatchOptions::default(),
    );

    let delivery = harness
        .dispatcher
        .chat_completions(&ctx(), request(true))
        .await
        .unwrap();
    let frames = drain_stream(delivery).await;
    assert_eq!(stream_content(&frames), "ok");
}

#[tokio::test]
async fn empty_messages_are_rejected_before_any_attempt() {
    let harness = harness(
        &["k1"],
        [("k1", Script::Text("unused"))],
        StreamSettings::default(),
        DispatchOptions::default(),
    );

    let mut body = request(false);
    body.messages.clear();
    let err = harness
        .dispatcher
        .chat_completions(&ctx(), body)
        .await
        .unwrap_err();
    assert_eq!(err.status, StatusCode::BAD_REQUEST);
    assert_eq!(harness.upstream.call_count(), 0);
}

#[tokio::test]
async fn model_listing_reshapes_and_never_fails() {
    let seeded = harness(
        &["k1"],
        [("k1", Script::Text("unused"))],
        StreamSettings::default(),
        DispatchOptions::default(),
    );

    let listing = seeded.dispatcher.list_models().await;
    assert_eq!(listing.data.len(), 1);
    assert_eq!(listing.data[0].id, "gemini-2.0-flash");

    let empty = harness(
        &[],
        [],
        StreamSettings::default(),
        DispatchOptions::default(),
    );
    let listing = empty.dispatcher.list_models().await;
    assert!(listing.data.is_empty());
}

#[tokio::test]
async fn first_success_stops_the_rotation() {
    let harness = harness(
        &["k1", "k2", "k3"],
        [
            ("k1", Script::Text("one")),
            ("k2", Script::Text("two")),
            ("k3", Script::Text("three")),
        ],
        StreamSettings::default(),
        DispatchOptions::default(),
    );

    harness
        .dispatcher
        .chat_completions(&ctx(), request(false))
        .await
        .unwrap();
    assert_eq!(harness.upstream.call_count(), 1);
    assert_eq!(harness.sink.records().len(), 1);
}

#[tokio::test]
async fn every_attempt_bumps_the_usage_counter() {
    let succeeding = harness(
        &["k1"],
        [("k1", Script::Text("counted"))],
        StreamSettings::default(),
        DispatchOptions::default(),
    );

    succeeding
        .dispatcher
        .chat_completions(&ctx(), request(false))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(succeeding.store.usage(1), 1);

    // A failed attempt counts too.
    let failing = harness(
        &["k1"],
        [("k1", Script::Fail { status: Some(429), message: "Quota exceeded" })],
        StreamSettings::default(),
        DispatchOptions::default(),
    );
    failing
        .dispatcher
        .chat_completions(&ctx(), request(false))
        .await
        .unwrap_err();
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(failing.store.usage(1), 1);
}

#[tokio::test]
async fn stalled_real_stream_is_finalized_at_the_deadline() {
    let harness = harness(
        &["k1"],
        [("k1", Script::Stall(vec!["partial"]))],
        StreamSettings {
            real_stream: true,
            fake_stream: false,
        },
        DispatchOptions {
            stream_deadline: Duration::from_millis(50),
            ..DispatchOptions::default()
        },
    );

    let delivery = harness
        .dispatcher
        .chat_completions(&ctx(), request(true))
        .await
        .unwrap();
    let frames = drain_stream(delivery).await;

    // The upstream never closed, yet the stream ends as a normal completion.
    assert_eq!(stream_content(&frames), "partial");
    assert_eq!(frames.last().unwrap(), "data: [DONE]\n\n");
    let terminal: serde_json::Value = serde_json::from_str(
        frames[frames.len() - 2]
            .trim_end()
            .strip_prefix("data: ")
            .unwrap(),
    )
    .unwrap();
    assert_eq!(terminal["choices"][0]["finish_reason"], "stop");
}
