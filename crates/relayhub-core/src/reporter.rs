use std::sync::Arc;
use std::time::SystemTime;

use tokio::task::JoinHandle;
use tracing::warn;

use relayhub_provider_core::{
    ApiError, Channel, ChannelFailureEvent, ChannelGroup, ChannelStatus, Event, OperationalEvent,
};

const DISABLING_TYPES: [&str; 4] = [
    "insufficient_quota",
    "authentication_error",
    "permission_error",
    "forbidden",
];
const DISABLING_CODES: [&str; 4] = [
    "invalid_api_key",
    "account_deactivated",
    "billing_not_active",
    "insufficient_quota",
];
const ACCOUNT_MESSAGES: [&str; 3] = [
    "credit balance is too low",
    "organization has been disabled",
    "exceeded your current quota",
];
/// Only meaningful on a 403.
const FORBIDDEN_MESSAGES: [&str; 2] = ["api key not valid", "permission denied"];

/// Records channel failures off the request path.
///
/// Each report runs in its own detached task: delivery is at-least-once and unordered,
/// and the caller never waits for it.
#[derive(Clone)]
pub struct ErrorReporter {
    channels: Arc<ChannelGroup>,
}

impl ErrorReporter {
    pub fn new(channels: Arc<ChannelGroup>) -> Self {
        Self { channels }
    }

    /// The handle is only for tests; dropping it detaches the task.
    pub fn report(
        &self,
        trace_id: Option<String>,
        channel: Arc<Channel>,
        error: ApiError,
        auto_disable: bool,
    ) -> JoinHandle<()> {
        let channels = self.channels.clone();
        tokio::spawn(async move {
            warn!(
                event = "channel_failed",
                trace_id = ?trace_id,
                channel_id = channel.id,
                channel_name = %channel.name,
                status = error.status_code,
                error_type = %error.error.kind,
                message = %error.error.message
            );
            let disable = auto_disable && should_disable(&error);
            channels
                .events()
                .emit(Event::Operational(OperationalEvent::ChannelFailure(
                    ChannelFailureEvent {
                        at: SystemTime::now(),
                        trace_id,
                        channel_id: channel.id,
                        channel_name: channel.name.clone(),
                        channel_type: channel.channel_type,
                        error,
                    },
                )))
                .await;
            if disable
                && channels
                    .set_status(channel.id, ChannelStatus::AutoDisabled)
                    .await
            {
                warn!(event = "channel_auto_disabled", channel_id = channel.id);
            }
        })
    }
}

/// Credential-class failures that will not heal on retry.
pub fn should_disable(err: &ApiError) -> bool {
    if err.local {
        return false;
    }
    if err.status_code == 401 {
        return true;
    }
    if DISABLING_TYPES.contains(&err.error.kind.as_str()) {
        return true;
    }
    if err
        .error
        .code_str()
        .is_some_and(|code| DISABLING_CODES.contains(&code))
    {
        return true;
    }
    let message = err.error.message.to_ascii_lowercase();
    if ACCOUNT_MESSAGES.iter().any(|needle| message.contains(needle)) {
        return true;
    }
    err.status_code == 403 && FORBIDDEN_MESSAGES.iter().any(|needle| message.contains(needle))
}
