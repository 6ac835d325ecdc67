//! The retry controller: drives attempts across channels until one succeeds, the failure
//! is terminal, the budget runs out, or the wall-clock limit passes.

use std::sync::Arc;
use std::time::SystemTime;

use arc_swap::ArcSwap;
use bytes::Bytes;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use relayhub_common::RelayConfig;
use relayhub_provider_core::{
    AdapterRegistry, ApiError, ChannelFilter, ChannelGroup, ChannelId, ErrorClass, Event,
    RelayOutcomeEvent, UpstreamCtx,
};

use crate::auth::TokenContext;
use crate::dispatch::relay_for_path;
use crate::guard::{Downstream, DownstreamReply, StreamGuard};
use crate::handler::relay_handler;
use crate::policy::{RetryPolicy, StatusRetryPolicy};
use crate::premap::pre_map;
use crate::quota::{ConsumeLog, QuotaManager};
use crate::relay::RelaySession;
use crate::reporter::ErrorReporter;
use crate::retry::RetryContext;
use crate::selector::ProviderSelector;
use crate::upstream_client::UpstreamClient;

#[derive(Debug, Clone)]
pub struct InboundRequest {
    /// Request path including the `/v1` prefix, e.g. `/v1/chat/completions`.
    pub path: String,
    pub body: Bytes,
    pub token: TokenContext,
    pub trace_id: String,
    pub user_agent: Option<String>,
}

/// What happened to one inbound request.
#[derive(Debug, Clone, Default)]
pub struct RelayOutcome {
    pub status: u16,
    pub attempts: u32,
    /// Channel of the last attempt.
    pub channel_id: Option<ChannelId>,
    pub total_channels: usize,
    pub skipped: Vec<ChannelId>,
    pub error: Option<ApiError>,
    pub usage: Option<ConsumeLog>,
}

pub struct RelayEngine {
    config: ArcSwap<RelayConfig>,
    selector: ProviderSelector,
    client: Arc<dyn UpstreamClient>,
    quotas: QuotaManager,
    policy: Arc<dyn RetryPolicy>,
    reporter: ErrorReporter,
}

impl RelayEngine {
    pub fn new(
        config: RelayConfig,
        channels: Arc<ChannelGroup>,
        adapters: Arc<AdapterRegistry>,
        client: Arc<dyn UpstreamClient>,
        quotas: QuotaManager,
    ) -> Self {
        channels.set_cooldown_period(config.retry_cooldown());
        Self {
            config: ArcSwap::from_pointee(config),
            selector: ProviderSelector::new(channels.clone(), adapters),
            client,
            quotas,
            policy: Arc::new(StatusRetryPolicy::new()),
            reporter: ErrorReporter::new(channels),
        }
    }

    pub fn with_policy(mut self, policy: Arc<dyn RetryPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn config(&self) -> Arc<RelayConfig> {
        self.config.load_full()
    }

    /// Applies to requests that start after the swap.
    pub fn replace_config(&self, config: RelayConfig) {
        self.channels().set_cooldown_period(config.retry_cooldown());
        self.client.set_proxy(config.proxy.clone());
        self.config.store(Arc::new(config));
    }

    pub fn channels(&self) -> &Arc<ChannelGroup> {
        self.selector.channels()
    }

    pub fn quotas(&self) -> &QuotaManager {
        &self.quotas
    }

    /// Runs the request on its own task so a caller disconnect never cancels an attempt.
    /// The receiver yields the response head as soon as it is decided.
    pub fn spawn(
        self: &Arc<Self>,
        req: InboundRequest,
    ) -> (oneshot::Receiver<DownstreamReply>, JoinHandle<RelayOutcome>) {
        let (downstream, reply) = Downstream::channel();
        let engine = self.clone();
        let task = tokio::spawn(async move { engine.relay(req, downstream).await });
        (reply, task)
    }

    pub async fn relay(&self, req: InboundRequest, downstream: Arc<Downstream>) -> RelayOutcome {
        let started = Instant::now();
        let config = self.config.load_full();
        let InboundRequest {
            path,
            body,
            token,
            trace_id,
            user_agent,
        } = req;
        let mut outcome = RelayOutcome::default();

        let Some(relay) = relay_for_path(&path) else {
            let err = ApiError::local(404, "invalid_request_error", "Not Found", ErrorClass::ClientInput);
            downstream.send_json(err.status_code, err.to_json_bytes());
            outcome.status = err.status_code;
            outcome.error = Some(err);
            self.finish(&trace_id, &path, "", &token, false, started, &outcome)
                .await;
            return outcome;
        };

        let base_filters: Vec<ChannelFilter> = token
            .pinned_channel
            .map(ChannelFilter::Only)
            .into_iter()
            .collect();
        let body = pre_map(&path, body, &self.selector, &token.group, &base_filters)
            .await
            .into_body();

        let mut session = RelaySession::new(relay, downstream.clone());
        if let Err(err) = session.set_request(&body) {
            session.handle_json_error(&err);
            outcome.status = err.status_code;
            outcome.error = Some(err);
            self.finish(&trace_id, &path, "", &token, false, started, &outcome)
                .await;
            return outcome;
        }
        let model = session.original_model().to_string();
        let is_stream = session.is_stream();
        info!(
            event = "downstream_received",
            trace_id = %trace_id,
            path = %path,
            model = %model,
            user_id = token.user_id,
            group = %token.group,
            is_stream
        );

        let mut retry =
            RetryContext::new(config.retry_times, config.retry_timeout()).with_start(started);
        retry.set_total_channels(
            self.selector
                .count(&token.group, &model, &base_filters)
                .await,
        );
        outcome.total_channels = retry.total_channels();

        match self
            .selector
            .select(&token.group, &model, &base_filters)
            .await
        {
            Ok(provider) => session.set_provider(provider),
            Err(err) => {
                session.handle_json_error(&err);
                outcome.status = err.status_code;
                outcome.error = Some(err);
                self.finish(&trace_id, &path, &model, &token, is_stream, started, &outcome)
                    .await;
                return outcome;
            }
        }

        let mut guard =
            is_stream.then(|| StreamGuard::start(downstream.clone(), config.heartbeat_interval()));

        let result = loop {
            let Some(channel) = session.provider().map(|provider| provider.channel().clone())
            else {
                break Err(ApiError::unavailable("no provider bound to request"));
            };
            outcome.channel_id = Some(channel.id);
            outcome.attempts = retry.attempt();
            let ctx = UpstreamCtx {
                trace_id: Some(trace_id.clone()),
                attempt_no: retry.attempt(),
                user_agent: user_agent.clone(),
            };

            let failure = match relay_handler(
                &mut session,
                &self.quotas,
                self.client.as_ref(),
                &token,
                &ctx,
            )
            .await
            {
                Ok(log) => break Ok(log),
                Err(failure) => failure,
            };

            self.reporter.report(
                Some(trace_id.clone()),
                channel.clone(),
                failure.error.clone(),
                config.auto_disable_channel,
            );
            let retryable = !failure.done
                && token.pinned_channel.is_none()
                && self.policy.should_retry(&failure.error, channel.channel_type);
            if !retryable || retry.remaining() == 0 {
                break Err(failure.error);
            }

            if failure.error.is_rate_limited() {
                self.channels().set_cooldown(channel.id, &model).await;
            }
            retry.skip(channel.id);
            if retry.timed_out() {
                warn!(
                    event = "relay_retry_timeout",
                    trace_id = %trace_id,
                    attempts = retry.attempt(),
                    elapsed_ms = retry.elapsed().as_millis()
                );
                break Err(ApiError::retry_timeout());
            }

            let mut filters = base_filters.clone();
            filters.push(ChannelFilter::Exclude(retry.skipped().to_vec()));
            match self.selector.select(&token.group, &model, &filters).await {
                Ok(provider) => session.set_provider(provider),
                Err(err) => {
                    debug!(event = "relay_reselect_failed", trace_id = %trace_id, error = %err);
                    break Err(failure.error);
                }
            }
            retry.next_attempt();
            info!(
                event = "relay_retry",
                trace_id = %trace_id,
                attempt = retry.attempt(),
                remaining = retry.remaining(),
                total_channels = retry.total_channels(),
                last_status = failure.error.status_code
            );
        };

        if let Some(guard) = guard.as_mut() {
            guard.close();
        }
        outcome.skipped = retry.skipped().to_vec();
        match result {
            Ok(log) => {
                outcome.status = 200;
                outcome.usage = Some(log);
            }
            Err(err) => {
                if downstream.has_written() {
                    session.handle_stream_error(&err).await;
                } else {
                    session.handle_json_error(&err);
                }
                outcome.status = err.status_code;
                outcome.error = Some(err);
            }
        }
        drop(guard);
        self.finish(&trace_id, &path, &model, &token, is_stream, started, &outcome)
            .await;
        outcome
    }

    #[allow(clippy::too_many_arguments)]
    async fn finish(
        &self,
        trace_id: &str,
        path: &str,
        model: &str,
        token: &TokenContext,
        is_stream: bool,
        started: Instant,
        outcome: &RelayOutcome,
    ) {
        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        match &outcome.error {
            None => info!(
                event = "downstream_responded",
                trace_id = %trace_id,
                status = outcome.status,
                attempts = outcome.attempts,
                channel_id = ?outcome.channel_id,
                elapsed_ms,
                is_stream
            ),
            Some(err) => warn!(
                event = "downstream_responded",
                trace_id = %trace_id,
                status = outcome.status,
                attempts = outcome.attempts,
                channel_id = ?outcome.channel_id,
                error = %err,
                elapsed_ms,
                is_stream
            ),
        }
        self.channels()
            .events()
            .emit(Event::Relay(RelayOutcomeEvent {
                trace_id: trace_id.to_string(),
                at: SystemTime::now(),
                path: path.to_string(),
                model: model.to_string(),
                user_id: token.user_id,
                attempts: outcome.attempts,
                channel_id: outcome.channel_id,
                status: outcome.status,
                is_stream,
                elapsed_ms,
            }))
            .await;
    }
}
