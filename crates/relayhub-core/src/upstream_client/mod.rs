use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use wreq::{Client, Method, Proxy};

use relayhub_common::RelayConfig;
use relayhub_provider_core::{
    Headers, HttpMethod, UpstreamBody, UpstreamFailure, UpstreamHttpRequest, UpstreamHttpResponse,
    UpstreamTransportErrorKind,
};

const STREAM_CHANNEL_CAPACITY: usize = 16;

/// Performs upstream HTTP calls. Streaming bodies arrive as a channel of chunks; a
/// broken or idle stream ends with an `Err` item instead of silently closing.
pub trait UpstreamClient: Send + Sync {
    fn send<'a>(
        &'a self,
        req: UpstreamHttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamHttpResponse, UpstreamFailure>> + Send + 'a>>;

    /// Egress proxy for subsequent requests. Clients without proxy support ignore it.
    fn set_proxy(&self, _proxy: Option<String>) {}
}

#[derive(Debug, Clone)]
pub struct UpstreamClientConfig {
    pub proxy: Option<String>,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    /// Longest gap tolerated between two chunks of a streamed body.
    pub stream_idle_timeout: Duration,
}

impl UpstreamClientConfig {
    pub fn from_config(config: &RelayConfig) -> Self {
        Self {
            proxy: config.proxy.clone(),
            ..Self::default()
        }
    }
}

impl Default for UpstreamClientConfig {
    fn default() -> Self {
        Self {
            proxy: None,
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(600),
            stream_idle_timeout: Duration::from_secs(60),
        }
    }
}

/// Built clients keyed by egress proxy (`None` = direct).
#[derive(Default)]
struct ClientCache {
    by_proxy: Mutex<HashMap<Option<String>, Client>>,
}

impl ClientCache {
    fn get_or_build(
        &self,
        proxy: Option<&str>,
        config: &UpstreamClientConfig,
    ) -> Result<Client, UpstreamFailure> {
        let mut by_proxy = self.by_proxy.lock().map_err(|_| UpstreamFailure::Transport {
            kind: UpstreamTransportErrorKind::Other,
            message: "upstream client cache poisoned".to_string(),
        })?;
        let key = proxy.map(str::to_string);
        if let Some(client) = by_proxy.get(&key) {
            return Ok(client.clone());
        }
        let client = build_client(config, proxy).map_err(transport_failure)?;
        by_proxy.insert(key, client.clone());
        Ok(client)
    }

    fn len(&self) -> usize {
        self.by_proxy.lock().map(|map| map.len()).unwrap_or_default()
    }
}

/// wreq-backed client. The egress proxy can be swapped at runtime; the next request
/// picks up the client for the new proxy.
pub struct WreqUpstreamClient {
    config: UpstreamClientConfig,
    proxy: ArcSwapOption<String>,
    cache: ClientCache,
}

impl WreqUpstreamClient {
    /// Builds the client for the configured proxy eagerly, so a malformed proxy URL fails
    /// at startup.
    pub fn new(config: UpstreamClientConfig) -> Result<Self, wreq::Error> {
        let proxy = normalize_proxy(config.proxy.clone());
        let cache = ClientCache::default();
        let client = build_client(&config, proxy.as_deref())?;
        if let Ok(mut by_proxy) = cache.by_proxy.lock() {
            by_proxy.insert(proxy.clone(), client);
        }
        Ok(Self {
            config,
            proxy: ArcSwapOption::from(proxy.map(Arc::new)),
            cache,
        })
    }

    pub fn proxy(&self) -> Option<String> {
        self.proxy.load_full().map(|proxy| proxy.as_ref().clone())
    }

    fn current_client(&self) -> Result<Client, UpstreamFailure> {
        let proxy = self.proxy.load_full();
        self.cache.get_or_build(proxy.as_deref().map(String::as_str), &self.config)
    }
}

fn normalize_proxy(value: Option<String>) -> Option<String> {
    value
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
}

fn build_client(config: &UpstreamClientConfig, proxy: Option<&str>) -> Result<Client, wreq::Error> {
    let builder = Client::builder()
        .connect_timeout(config.connect_timeout)
        .timeout(config.request_timeout)
        .read_timeout(config.stream_idle_timeout);
    match proxy {
        Some(proxy) => builder.proxy(Proxy::all(proxy)?).build(),
        None => builder.build(),
    }
}

impl UpstreamClient for WreqUpstreamClient {
    fn send<'a>(
        &'a self,
        req: UpstreamHttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamHttpResponse, UpstreamFailure>> + Send + 'a>>
    {
        Box::pin(async move {
            let client = self.current_client()?;
            let method = match req.method {
                HttpMethod::Get => Method::GET,
                HttpMethod::Post => Method::POST,
            };
            let builder = req
                .headers
                .iter()
                .fold(client.request(method, &req.url), |builder, (name, value)| {
                    builder.header(name, value)
                });
            let builder = match req.body {
                Some(body) => builder.body(body),
                None => builder,
            };

            let resp = builder.send().await.map_err(transport_failure)?;
            let status = resp.status().as_u16();
            let headers = collect_headers(resp.headers());

            // Error replies are always buffered so the relay can parse them.
            if !req.is_stream || !(200..300).contains(&status) {
                let body = resp.bytes().await.map_err(transport_failure)?;
                return Ok(UpstreamHttpResponse {
                    status,
                    headers,
                    body: UpstreamBody::Bytes(body),
                });
            }

            let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
            tokio::spawn(pump_stream(resp, tx, self.config.stream_idle_timeout));
            Ok(UpstreamHttpResponse {
                status,
                headers,
                body: UpstreamBody::Stream(rx),
            })
        })
    }

    fn set_proxy(&self, proxy: Option<String>) {
        self.proxy.store(normalize_proxy(proxy).map(Arc::new));
    }
}

/// Forwards body chunks until the upstream finishes, fails, or goes quiet for `idle`.
/// A failure is delivered as the last item.
async fn pump_stream(
    resp: wreq::Response,
    tx: mpsc::Sender<Result<Bytes, UpstreamFailure>>,
    idle: Duration,
) {
    let mut chunks = resp.bytes_stream();
    loop {
        let next = match tokio::time::timeout(idle, chunks.next()).await {
            Ok(None) => return,
            Ok(Some(chunk)) => chunk.map_err(transport_failure),
            Err(_) => Err(UpstreamFailure::Transport {
                kind: UpstreamTransportErrorKind::ReadTimeout,
                message: format!("upstream stream idle for {}s", idle.as_secs()),
            }),
        };
        let last = next.is_err();
        if tx.send(next).await.is_err() || last {
            return;
        }
    }
}

fn collect_headers(map: &wreq::header::HeaderMap) -> Headers {
    let mut out = Headers::new();
    for (name, value) in map {
        if let Ok(value) = value.to_str() {
            out.push((name.as_str().to_string(), value.to_string()));
        }
    }
    out
}

fn transport_failure(err: wreq::Error) -> UpstreamFailure {
    UpstreamFailure::Transport {
        kind: transport_kind(&err),
        message: err.to_string(),
    }
}

fn transport_kind(err: &wreq::Error) -> UpstreamTransportErrorKind {
    let text = err.to_string().to_ascii_lowercase();
    let mentions = |words: &[&str]| words.iter().any(|word| text.contains(word));

    if err.is_timeout() {
        return if mentions(&["read", "idle"]) {
            UpstreamTransportErrorKind::ReadTimeout
        } else {
            UpstreamTransportErrorKind::Timeout
        };
    }
    if err.is_connect() && mentions(&["dns", "resolve"]) {
        return UpstreamTransportErrorKind::Dns;
    }
    if mentions(&["tls", "ssl", "certificate"]) {
        return UpstreamTransportErrorKind::Tls;
    }
    if err.is_connect() || err.is_connection_reset() {
        return UpstreamTransportErrorKind::Connect;
    }
    UpstreamTransportErrorKind::Other
}
