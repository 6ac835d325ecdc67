use serde_json::Value as JsonValue;

use relayhub_protocol::openai::chat::{
    ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse,
};
use relayhub_provider_core::{ApiError, Endpoint};

use super::{Relay, encode_body, invalid_body, require_model};
use crate::tokenizer::{self, TokenizeError};
use crate::usage::Usage;

#[derive(Debug, Default)]
pub struct ChatRelay {
    request: Option<ChatCompletionRequest>,
}

impl ChatRelay {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Relay for ChatRelay {
    fn endpoint(&self) -> Endpoint {
        Endpoint::ChatCompletions
    }

    fn set_request(&mut self, body: &[u8]) -> Result<(), ApiError> {
        let request: ChatCompletionRequest = serde_json::from_slice(body).map_err(invalid_body)?;
        require_model(&request.model)?;
        if request.messages.is_empty() {
            return Err(ApiError::client_input(
                "invalid_request_error",
                "messages is required",
            ));
        }
        self.request = Some(request);
        Ok(())
    }

    fn original_model(&self) -> &str {
        self.request
            .as_ref()
            .map(|request| request.model.as_str())
            .unwrap_or_default()
    }

    fn is_stream(&self) -> bool {
        self.request
            .as_ref()
            .is_some_and(ChatCompletionRequest::is_stream)
    }

    fn prompt_tokens(&self) -> Result<u32, TokenizeError> {
        let request = self
            .request
            .as_ref()
            .ok_or(TokenizeError::EmptyInput("request"))?;
        tokenizer::count_chat(&request.model, &request.messages)
    }

    fn upstream_body(&self, model: &str) -> Result<JsonValue, ApiError> {
        encode_body(self.request.as_ref(), model)
    }

    fn observe_body(&self, body: &[u8], usage: &mut Usage) {
        let Ok(response) = serde_json::from_slice::<ChatCompletionResponse>(body) else {
            return;
        };
        for choice in &response.choices {
            if let Some(content) = choice.message.as_ref().and_then(|m| m.content.as_deref()) {
                usage.text.push_str(content);
            }
        }
        if let Some(reported) = response.usage {
            usage.apply_reported(reported);
        }
    }

    fn observe_event(&self, data: &str, usage: &mut Usage) {
        let Ok(chunk) = serde_json::from_str::<ChatCompletionChunk>(data) else {
            return;
        };
        for delta in chunk.choices.iter().filter_map(|choice| choice.delta.as_ref()) {
            if let Some(reasoning) = &delta.reasoning_content {
                usage.text.push_str(reasoning);
            }
            if let Some(content) = &delta.content {
                usage.text.push_str(content);
            }
        }
        if let Some(reported) = chunk.usage.filter(|u| u.total_tokens > 0 || u.completion_tokens > 0) {
            usage.apply_reported(reported);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_missing_model_and_messages() {
        let mut relay = ChatRelay::new();
        let err = relay.set_request(br#"{"model":"","messages":[]}"#).unwrap_err();
        assert_eq!(err.status_code, 400);
        assert_eq!(err.error.message, "model is required");

        let err = relay.set_request(br#"{"model":"m","messages":[]}"#).unwrap_err();
        assert_eq!(err.error.message, "messages is required");

        let err = relay.set_request(b"not json").unwrap_err();
        assert_eq!(err.error.kind, "invalid_request_error");
    }

    #[test]
    fn upstream_body_swaps_model_and_keeps_extras() {
        let mut relay = ChatRelay::new();
        relay
            .set_request(br#"{"model":"gpt-x","messages":[{"role":"user","content":"hi"}],"stream":true,"top_p":0.5}"#)
            .unwrap();
        assert!(relay.is_stream());
        assert_eq!(relay.original_model(), "gpt-x");
        let body = relay.upstream_body("gpt-x-2024").unwrap();
        assert_eq!(body["model"], "gpt-x-2024");
        assert_eq!(body["top_p"], 0.5);
    }

    #[test]
    fn stream_chunks_accumulate_text_and_usage() {
        let relay = ChatRelay::new();
        let mut usage = Usage::with_prompt(5);
        relay.observe_event(r#"{"choices":[{"delta":{"content":"Hel"}}]}"#, &mut usage);
        relay.observe_event(r#"{"choices":[{"delta":{"content":"lo"}}]}"#, &mut usage);
        assert_eq!(usage.text, "Hello");
        relay.observe_event(
            r#"{"choices":[],"usage":{"prompt_tokens":5,"completion_tokens":2,"total_tokens":7}}"#,
            &mut usage,
        );
        assert_eq!(usage.completion_tokens, 2);
        assert_eq!(usage.total_tokens, 7);
    }
}
