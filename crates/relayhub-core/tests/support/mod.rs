#![allow(dead_code)]

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use serde_json::Value as JsonValue;
use tokio::sync::{mpsc, oneshot};

use relayhub_common::RelayConfig;
use relayhub_core::{
    DownstreamReply, InboundRequest, MemoryLedger, PriceTable, QuotaManager, RelayEngine,
    TokenContext, UpstreamClient,
};
use relayhub_provider_core::{
    Channel, ChannelGroup, ChannelStatus, ChannelType, EventHub, UpstreamBody, UpstreamFailure,
    UpstreamHttpRequest, UpstreamHttpResponse, UpstreamTransportErrorKind,
};
use relayhub_provider_impl::builtin_registry;

pub const USER_ID: i64 = 7;
pub const MODEL: &str = "m";

#[derive(Debug, Clone)]
pub enum Reply {
    Json { status: u16, body: String },
    Stream { frames: Vec<String>, fail: bool },
    /// Connection-level failure before any response.
    Transport,
}

#[derive(Debug, Clone)]
pub struct Behavior {
    pub delay: Duration,
    pub reply: Reply,
}

impl Behavior {
    pub fn json(status: u16, body: impl Into<String>) -> Self {
        Self {
            delay: Duration::ZERO,
            reply: Reply::Json {
                status,
                body: body.into(),
            },
        }
    }

    pub fn ok_with_usage(content: &str, prompt: u32, completion: u32) -> Self {
        Self::json(
            200,
            format!(
                r#"{{"id":"x","choices":[{{"index":0,"message":{{"role":"assistant","content":"{content}"}}}}],"usage":{{"prompt_tokens":{prompt},"completion_tokens":{completion},"total_tokens":{}}}}}"#,
                prompt + completion
            ),
        )
    }

    pub fn error(status: u16, kind: &str, message: &str) -> Self {
        Self::json(
            status,
            format!(r#"{{"error":{{"type":"{kind}","message":"{message}"}}}}"#),
        )
    }

    pub fn stream(frames: Vec<String>) -> Self {
        Self {
            delay: Duration::ZERO,
            reply: Reply::Stream {
                frames,
                fail: false,
            },
        }
    }

    pub fn stream_then_fail(frames: Vec<String>) -> Self {
        Self {
            delay: Duration::ZERO,
            reply: Reply::Stream {
                frames,
                fail: true,
            },
        }
    }

    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// `data: {chunk}\n\n` carrying one content delta.
pub fn content_frame(text: &str) -> String {
    format!(
        "data: {{\"choices\":[{{\"index\":0,\"delta\":{{\"content\":\"{text}\"}}}}]}}\n\n"
    )
}

pub fn usage_frame(prompt: u32, completion: u32) -> String {
    format!(
        "data: {{\"choices\":[],\"usage\":{{\"prompt_tokens\":{prompt},\"completion_tokens\":{completion},\"total_tokens\":{}}}}}\n\n",
        prompt + completion
    )
}

pub const DONE_FRAME: &str = "data: [DONE]\n\n";

#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub host: String,
    pub url: String,
    pub body: JsonValue,
}

/// Upstream double keyed by host (`http://{host}.test`).
#[derive(Default)]
pub struct FakeUpstream {
    behaviors: Mutex<HashMap<String, Behavior>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl FakeUpstream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(self, host: &str, behavior: Behavior) -> Self {
        self.behaviors
            .lock()
            .unwrap()
            .insert(host.to_string(), behavior);
        self
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn hosts(&self) -> Vec<String> {
        self.calls().into_iter().map(|call| call.host).collect()
    }
}

fn host_of(url: &str) -> String {
    let rest = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
    let host = rest.split('/').next().unwrap_or_default();
    host.trim_end_matches(".test").to_string()
}

impl UpstreamClient for FakeUpstream {
    fn send<'a>(
        &'a self,
        req: UpstreamHttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamHttpResponse, UpstreamFailure>> + Send + 'a>>
    {
        Box::pin(async move {
            let host = host_of(&req.url);
            let body = req
                .body
                .as_ref()
                .and_then(|body| serde_json::from_slice(body).ok())
                .unwrap_or(JsonValue::Null);
            self.calls.lock().unwrap().push(RecordedCall {
                host: host.clone(),
                url: req.url.clone(),
                body,
            });
            let behavior = self
                .behaviors
                .lock()
                .unwrap()
                .get(&host)
                .cloned()
                .unwrap_or_else(|| Behavior::error(500, "server_error", "no script"));

            if !behavior.delay.is_zero() {
                tokio::time::sleep(behavior.delay).await;
            }
            match behavior.reply {
                Reply::Transport => Err(UpstreamFailure::Transport {
                    kind: UpstreamTransportErrorKind::Connect,
                    message: "connection refused".to_string(),
                }),
                Reply::Json { status, body } => Ok(UpstreamHttpResponse {
                    status,
                    headers: vec![("content-type".to_string(), "application/json".to_string())],
                    body: UpstreamBody::Bytes(Bytes::from(body)),
                }),
                Reply::Stream { frames, fail } => {
                    let (tx, rx) = mpsc::channel(frames.len() + 1);
                    for frame in frames {
                        let _ = tx.try_send(Ok(Bytes::from(frame)));
                    }
                    if fail {
                        let _ = tx.try_send(Err(UpstreamFailure::Transport {
                            kind: UpstreamTransportErrorKind::Other,
                            message: "stream reset by peer".to_string(),
                        }));
                    }
                    Ok(UpstreamHttpResponse {
                        status: 200,
                        headers: vec![(
                            "content-type".to_string(),
                            "text/event-stream".to_string(),
                        )],
                        body: UpstreamBody::Stream(rx),
                    })
                }
            }
        })
    }
}

/// Channel `id` reachable at `http://{host}.test`. Higher ids get lower priority, so
/// selection order is deterministic.
pub fn channel(id: i64, host: &str) -> Channel {
    Channel {
        id,
        name: format!("ch-{host}"),
        channel_type: ChannelType::Custom,
        status: ChannelStatus::Enabled,
        groups: vec!["default".to_string()],
        models: vec![MODEL.to_string(), "gpt-x".to_string()],
        priority: 100 - id,
        weight: 1,
        base_url: Some(format!("http://{host}.test")),
        api_key: format!("sk-{host}"),
        custom_parameter: None,
        model_mapping: HashMap::new(),
        api_version: None,
    }
}

pub fn token() -> TokenContext {
    TokenContext {
        token_id: 1,
        token_name: "test".to_string(),
        user_id: USER_ID,
        group: "default".to_string(),
        pinned_channel: None,
    }
}

pub fn config(retry_times: u32) -> RelayConfig {
    RelayConfig {
        retry_times,
        ..RelayConfig::default()
    }
}

pub fn chat_body(stream: bool) -> Bytes {
    Bytes::from(format!(
        r#"{{"model":"{MODEL}","messages":[{{"role":"user","content":"hello there"}}],"stream":{stream}}}"#
    ))
}

pub fn request(path: &str, body: Bytes) -> InboundRequest {
    InboundRequest {
        path: path.to_string(),
        body,
        token: token(),
        trace_id: "trace-1".to_string(),
        user_agent: None,
    }
}

pub struct Harness {
    pub engine: Arc<RelayEngine>,
    pub ledger: Arc<MemoryLedger>,
    pub upstream: Arc<FakeUpstream>,
    pub channels: Arc<ChannelGroup>,
}

pub async fn harness(config: RelayConfig, channels: Vec<Channel>, upstream: FakeUpstream) -> Harness {
    let group = Arc::new(ChannelGroup::new(
        EventHub::new(256),
        config.retry_cooldown(),
    ));
    for channel in channels {
        group.insert(channel).await;
    }
    let ledger = Arc::new(MemoryLedger::new());
    ledger.set_balance(USER_ID, 1_000_000);
    let upstream = Arc::new(upstream);
    let engine = RelayEngine::new(
        config,
        group.clone(),
        Arc::new(builtin_registry()),
        upstream.clone(),
        QuotaManager::new(ledger.clone(), PriceTable::default()),
    );
    Harness {
        engine: Arc::new(engine),
        ledger,
        upstream,
        channels: group,
    }
}

#[derive(Debug)]
pub enum Collected {
    Json { status: u16, body: JsonValue },
    Stream(String),
}

impl Collected {
    pub fn json(self) -> (u16, JsonValue) {
        match self {
            Collected::Json { status, body } => (status, body),
            Collected::Stream(text) => panic!("expected JSON reply, got stream: {text}"),
        }
    }

    pub fn stream(self) -> String {
        match self {
            Collected::Stream(text) => text,
            Collected::Json { status, body } => {
                panic!("expected stream reply, got {status}: {body}")
            }
        }
    }
}

pub async fn collect(reply: oneshot::Receiver<DownstreamReply>) -> Collected {
    match reply.await.expect("response head") {
        DownstreamReply::Json { status, body } => Collected::Json {
            status,
            body: serde_json::from_slice(&body).unwrap_or(JsonValue::Null),
        },
        DownstreamReply::Stream { mut body } => {
            let mut text = String::new();
            while let Some(chunk) = body.recv().await {
                text.push_str(&String::from_utf8_lossy(&chunk));
            }
            Collected::Stream(text)
        }
    }
}
