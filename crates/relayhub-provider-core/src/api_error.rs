use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use relayhub_protocol::sse::data_frame;
use relayhub_protocol::{ErrorBody, ErrorEnvelope};

use crate::errors::ProviderError;
use crate::provider::{UpstreamFailure, UpstreamTransportErrorKind};

const MAX_UPSTREAM_MESSAGE_CHARS: usize = 1024;

/// Failure taxonomy used by the retry controller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Malformed request or untokenizable input.
    ClientInput,
    /// No eligible channel for the model.
    GatewayUnavailable,
    /// Anything tied to the selected channel: HTTP errors, transport failures, bad
    /// channel config.
    #[default]
    Upstream,
    /// Wall-clock retry budget exhausted.
    TimeoutExceeded,
    /// Insufficient balance or permission.
    Quota,
}

/// Error normalized for the caller: HTTP status plus an OpenAI-style `{type, message}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiError {
    pub status_code: u16,
    pub error: ErrorBody,
    #[serde(default)]
    pub class: ErrorClass,
    /// Produced by the gateway's own checks (input, quota, selection, timeout) rather than
    /// by an upstream or the channel. Local errors are never retried or reported against a
    /// channel.
    #[serde(default)]
    pub local: bool,
}

impl ApiError {
    pub fn local(
        status_code: u16,
        kind: impl Into<String>,
        message: impl Into<String>,
        class: ErrorClass,
    ) -> Self {
        Self {
            status_code,
            error: ErrorBody::new(kind, message),
            class,
            local: true,
        }
    }

    pub fn client_input(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::local(400, kind, message, ErrorClass::ClientInput)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::local(503, "relayhub_error", message, ErrorClass::GatewayUnavailable)
    }

    pub fn retry_timeout() -> Self {
        Self::local(
            429,
            "system_error",
            "retry timed out, upstream is overloaded, please try again later",
            ErrorClass::TimeoutExceeded,
        )
    }

    pub fn quota(message: impl Into<String>) -> Self {
        Self::local(403, "insufficient_user_quota", message, ErrorClass::Quota)
    }

    /// Builds an error from a non-2xx upstream response body.
    pub fn from_upstream(status_code: u16, body: &[u8]) -> Self {
        let error = match serde_json::from_slice::<ErrorEnvelope>(body) {
            Ok(envelope) => envelope.error,
            Err(_) => {
                let text = String::from_utf8_lossy(body);
                let text = text.trim();
                let message = if text.is_empty() {
                    format!("upstream returned status {status_code}")
                } else {
                    text.chars().take(MAX_UPSTREAM_MESSAGE_CHARS).collect()
                };
                ErrorBody::new("upstream_error", message)
            }
        };
        Self {
            status_code,
            error,
            class: ErrorClass::Upstream,
            local: false,
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        self.status_code == 429
    }

    /// `{"error": {...}}` body for a non-streaming reply.
    pub fn to_json_bytes(&self) -> Bytes {
        let envelope = ErrorEnvelope {
            error: self.error.clone(),
        };
        serde_json::to_vec(&envelope)
            .map(Bytes::from)
            .unwrap_or_else(|_| Bytes::from_static(br#"{"error":{"type":"relayhub_error","message":"error encoding failed"}}"#))
    }

    /// Terminal SSE event for a stream that has already started.
    pub fn to_stream_frame(&self) -> Bytes {
        let json = self.to_json_bytes();
        data_frame(&String::from_utf8_lossy(&json))
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}: {}",
            self.status_code, self.error.kind, self.error.message
        )
    }
}

impl std::error::Error for ApiError {}

impl From<&UpstreamFailure> for ApiError {
    fn from(failure: &UpstreamFailure) -> Self {
        match failure {
            UpstreamFailure::Http { status, body, .. } => ApiError::from_upstream(*status, body),
            UpstreamFailure::Transport { kind, message } => {
                let status_code = match kind {
                    UpstreamTransportErrorKind::Timeout
                    | UpstreamTransportErrorKind::ReadTimeout => 504,
                    _ => 502,
                };
                ApiError {
                    status_code,
                    error: ErrorBody::new("upstream_transport_error", message.clone()),
                    class: ErrorClass::Upstream,
                    local: false,
                }
            }
        }
    }
}

impl From<ProviderError> for ApiError {
    fn from(err: ProviderError) -> Self {
        // Attributed to the channel's configuration, so it is retryable like an upstream failure.
        ApiError {
            status_code: 500,
            error: ErrorBody::new("channel_error", err.to_string()),
            class: ErrorClass::Upstream,
            local: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_envelope_is_kept() {
        let err = ApiError::from_upstream(
            429,
            br#"{"error":{"message":"Rate limit reached","type":"requests","code":"rate_limit_exceeded"}}"#,
        );
        assert!(err.is_rate_limited());
        assert!(!err.local);
        assert_eq!(err.error.kind, "requests");
        assert_eq!(err.error.code_str(), Some("rate_limit_exceeded"));
    }

    #[test]
    fn plain_text_body_becomes_message() {
        let err = ApiError::from_upstream(502, b"Bad Gateway\n");
        assert_eq!(err.error.kind, "upstream_error");
        assert_eq!(err.error.message, "Bad Gateway");
    }

    #[test]
    fn stream_frame_wraps_envelope() {
        let frame = ApiError::retry_timeout().to_stream_frame();
        let text = std::str::from_utf8(&frame).unwrap();
        assert!(text.starts_with("data: {\"error\":{"));
        assert!(text.contains("\"type\":\"system_error\""));
        assert!(text.ends_with("\n\n"));
    }
}
