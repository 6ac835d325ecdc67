use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde_json::Value as JsonValue;
use tokio::sync::mpsc;

use relayhub_common::RelayConfig;
use relayhub_core::{
    AuthSnapshot, MemoryAuth, MemoryLedger, PriceTable, QuotaManager, RelayEngine, TokenEntry,
    UpstreamClient,
};
use relayhub_provider_core::{
    Channel, ChannelGroup, ChannelStatus, ChannelType, EventHub, UpstreamBody, UpstreamFailure,
    UpstreamHttpRequest, UpstreamHttpResponse,
};
use relayhub_provider_impl::builtin_registry;
use relayhub_router::app_router;

const USER_KEY: &str = "sk-user";

/// Answers every call with a fixed completion, streamed when the request asks for it.
struct CannedUpstream;

impl UpstreamClient for CannedUpstream {
    fn send<'a>(
        &'a self,
        req: UpstreamHttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamHttpResponse, UpstreamFailure>> + Send + 'a>>
    {
        Box::pin(async move {
            if req.is_stream {
                let (tx, rx) = mpsc::channel(4);
                let _ = tx.try_send(Ok(Bytes::from_static(
                    b"data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"hey\"}}]}\n\n",
                )));
                let _ = tx.try_send(Ok(Bytes::from_static(b"data: [DONE]\n\n")));
                return Ok(UpstreamHttpResponse {
                    status: 200,
                    headers: vec![("content-type".to_string(), "text/event-stream".to_string())],
                    body: UpstreamBody::Stream(rx),
                });
            }
            Ok(UpstreamHttpResponse {
                status: 200,
                headers: vec![("content-type".to_string(), "application/json".to_string())],
                body: UpstreamBody::Bytes(Bytes::from_static(
                    br#"{"id":"x","choices":[{"index":0,"message":{"role":"assistant","content":"hey"}}],"usage":{"prompt_tokens":4,"completion_tokens":1,"total_tokens":5}}"#,
                )),
            })
        })
    }
}

async fn serve() -> String {
    let group = Arc::new(ChannelGroup::new(EventHub::new(64), Duration::from_secs(60)));
    group
        .insert(Channel {
            id: 1,
            name: "primary".to_string(),
            channel_type: ChannelType::Custom,
            status: ChannelStatus::Enabled,
            groups: vec!["default".to_string()],
            models: vec!["m".to_string()],
            priority: 0,
            weight: 1,
            base_url: Some("http://upstream.test".to_string()),
            api_key: "sk-upstream".to_string(),
            custom_parameter: None,
            model_mapping: HashMap::new(),
            api_version: None,
        })
        .await;

    let ledger = Arc::new(MemoryLedger::new());
    ledger.set_balance(7, 1_000_000);
    let engine = Arc::new(RelayEngine::new(
        RelayConfig::default(),
        group,
        Arc::new(builtin_registry()),
        Arc::new(CannedUpstream),
        QuotaManager::new(ledger, PriceTable::default()),
    ));
    let auth = Arc::new(MemoryAuth::new(AuthSnapshot::from_entries([TokenEntry {
        id: 1,
        key: USER_KEY.to_string(),
        name: "test".to_string(),
        user_id: 7,
        group: "default".to_string(),
        enabled: true,
        pinned_channel: None,
    }])));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app_router(engine, auth)).await.unwrap();
    });
    format!("http://{addr}")
}

fn client() -> wreq::Client {
    wreq::Client::builder().build().unwrap()
}

async fn post(base: &str, path: &str, key: Option<&str>, body: &str) -> wreq::Response {
    let mut builder = client()
        .post(format!("{base}{path}"))
        .header("content-type", "application/json")
        .body(body.to_string());
    if let Some(key) = key {
        builder = builder.header("authorization", format!("Bearer {key}"));
    }
    builder.send().await.unwrap()
}

async fn json_of(resp: wreq::Response) -> JsonValue {
    serde_json::from_slice(&resp.bytes().await.unwrap()).unwrap()
}

const CHAT_BODY: &str = r#"{"model":"m","messages":[{"role":"user","content":"hi"}]}"#;
const STREAM_BODY: &str = r#"{"model":"m","messages":[{"role":"user","content":"hi"}],"stream":true}"#;

#[tokio::test]
async fn missing_key_is_unauthorized() {
    let base = serve().await;
    let resp = post(&base, "/v1/chat/completions", None, CHAT_BODY).await;
    assert_eq!(resp.status().as_u16(), 401);
    let body = json_of(resp).await;
    assert_eq!(body["error"]["type"], "authentication_error");
}

#[tokio::test]
async fn unknown_key_is_forbidden() {
    let base = serve().await;
    let resp = post(&base, "/v1/chat/completions", Some("sk-nope"), CHAT_BODY).await;
    assert_eq!(resp.status().as_u16(), 403);
}

#[tokio::test]
async fn chat_completion_is_relayed() {
    let base = serve().await;
    let resp = post(&base, "/v1/chat/completions", Some(USER_KEY), CHAT_BODY).await;
    assert_eq!(resp.status().as_u16(), 200);
    assert_eq!(resp.headers()["content-type"], "application/json");
    let body = json_of(resp).await;
    assert_eq!(body["choices"][0]["message"]["content"], "hey");
}

#[tokio::test]
async fn streaming_completion_is_sse() {
    let base = serve().await;
    let resp = post(&base, "/v1/chat/completions", Some(USER_KEY), STREAM_BODY).await;
    assert_eq!(resp.status().as_u16(), 200);
    assert_eq!(resp.headers()["content-type"], "text/event-stream");
    assert_eq!(resp.headers()["cache-control"], "no-cache");
    let text = String::from_utf8(resp.bytes().await.unwrap().to_vec()).unwrap();
    assert!(text.contains("\"hey\""));
    assert!(text.ends_with("data: [DONE]\n\n"));
}

#[tokio::test]
async fn unknown_relay_path_is_not_found() {
    let base = serve().await;
    let resp = post(&base, "/v1/images/generations", Some(USER_KEY), CHAT_BODY).await;
    assert_eq!(resp.status().as_u16(), 404);
    let body = json_of(resp).await;
    assert_eq!(body["error"]["message"], "Not Found");
}

#[tokio::test]
async fn status_is_public_and_echoes_config() {
    let base = serve().await;
    let resp = client()
        .get(format!("{base}/api/status"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    let body = json_of(resp).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["channels"], 1);
    assert_eq!(body["config"]["retry_timeout_secs"], 120);
}

#[tokio::test]
async fn channel_list_requires_a_token_and_hides_keys() {
    let base = serve().await;
    let resp = client()
        .get(format!("{base}/api/channels"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 401);

    let resp = client()
        .get(format!("{base}/api/channels"))
        .header("x-api-key", USER_KEY)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    let body = json_of(resp).await;
    assert_eq!(body[0]["channel"]["id"], 1);
    assert_eq!(body[0]["status"], "enabled");
    assert!(body[0]["channel"].get("api_key").is_none());
}
