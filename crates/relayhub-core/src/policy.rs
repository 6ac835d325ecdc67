use std::collections::HashMap;

use relayhub_provider_core::{ApiError, ChannelType, ErrorClass};

/// Decides whether a failed attempt may move on to another channel.
pub trait RetryPolicy: Send + Sync {
    fn should_retry(&self, err: &ApiError, channel_type: ChannelType) -> bool;
}

/// Status-code table with per-channel-type overrides.
///
/// Only upstream-class errors are ever retried. Within that class, request-shape
/// rejections (400, 413, 422) and non-error statuses stay with the caller; everything
/// else (rate limits, auth, 404, timeouts, 5xx, transport failures) tries another channel.
#[derive(Debug, Clone, Default)]
pub struct StatusRetryPolicy {
    overrides: HashMap<(ChannelType, u16), bool>,
}

impl StatusRetryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_override(mut self, channel_type: ChannelType, status: u16, retry: bool) -> Self {
        self.overrides.insert((channel_type, status), retry);
        self
    }

    fn default_for_status(status: u16) -> bool {
        !matches!(status, 200..=299 | 400 | 413 | 422)
    }
}

impl RetryPolicy for StatusRetryPolicy {
    fn should_retry(&self, err: &ApiError, channel_type: ChannelType) -> bool {
        if err.local || err.class != ErrorClass::Upstream {
            return false;
        }
        self.overrides
            .get(&(channel_type, err.status_code))
            .copied()
            .unwrap_or_else(|| Self::default_for_status(err.status_code))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_statuses() {
        let policy = StatusRetryPolicy::new();
        let retry = |status: u16| {
            policy.should_retry(&ApiError::from_upstream(status, b""), ChannelType::Openai)
        };
        assert!(retry(429));
        assert!(retry(500));
        assert!(retry(401));
        assert!(retry(404));
        assert!(!retry(400));
        assert!(!retry(413));
        assert!(!retry(422));
    }

    #[test]
    fn local_classes_never_retry() {
        let policy = StatusRetryPolicy::new();
        assert!(!policy.should_retry(&ApiError::unavailable("x"), ChannelType::Openai));
        assert!(!policy.should_retry(&ApiError::quota("x"), ChannelType::Openai));
        assert!(!policy.should_retry(&ApiError::retry_timeout(), ChannelType::Openai));
        assert!(!policy.should_retry(
            &ApiError::client_input("token_error", "x"),
            ChannelType::Openai
        ));
    }

    #[test]
    fn overrides_apply_per_channel_type() {
        let policy = StatusRetryPolicy::new().with_override(ChannelType::Azure, 404, false);
        let err = ApiError::from_upstream(404, b"");
        assert!(!policy.should_retry(&err, ChannelType::Azure));
        assert!(policy.should_retry(&err, ChannelType::Openai));
    }
}
