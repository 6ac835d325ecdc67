use serde_json::Value as JsonValue;

use relayhub_protocol::openai::completions::{CompletionRequest, CompletionResponse, Prompt};
use relayhub_provider_core::{ApiError, Endpoint};

use super::{Relay, encode_body, invalid_body, require_model};
use crate::tokenizer::{self, TokenizeError};
use crate::usage::Usage;

#[derive(Debug, Default)]
pub struct CompletionsRelay {
    request: Option<CompletionRequest>,
}

impl CompletionsRelay {
    pub fn new() -> Self {
        Self::default()
    }
}

fn prompt_len(model: &str, prompt: &Prompt) -> Result<u32, TokenizeError> {
    let tokens = match prompt {
        Prompt::Text(text) => tokenizer::count_text(model, text)?,
        Prompt::Batch(texts) => {
            let mut total = 0u32;
            for text in texts {
                total = total.saturating_add(tokenizer::count_text(model, text)?);
            }
            total
        }
        Prompt::Tokens(tokens) => u32::try_from(tokens.len()).unwrap_or(u32::MAX),
        Prompt::TokenBatch(batch) => {
            let count: usize = batch.iter().map(Vec::len).sum();
            u32::try_from(count).unwrap_or(u32::MAX)
        }
    };
    Ok(tokens)
}

impl Relay for CompletionsRelay {
    fn endpoint(&self) -> Endpoint {
        Endpoint::Completions
    }

    fn set_request(&mut self, body: &[u8]) -> Result<(), ApiError> {
        let request: CompletionRequest = serde_json::from_slice(body).map_err(invalid_body)?;
        require_model(&request.model)?;
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
            .is_some_and(CompletionRequest::is_stream)
    }

    fn prompt_tokens(&self) -> Result<u32, TokenizeError> {
        let request = self
            .request
            .as_ref()
            .ok_or(TokenizeError::EmptyInput("request"))?;
        match &request.prompt {
            Some(prompt) => prompt_len(&request.model, prompt),
            None => Ok(0),
        }
    }

    fn upstream_body(&self, model: &str) -> Result<JsonValue, ApiError> {
        encode_body(self.request.as_ref(), model)
    }

    fn observe_body(&self, body: &[u8], usage: &mut Usage) {
        let Ok(response) = serde_json::from_slice::<CompletionResponse>(body) else {
            return;
        };
        self.collect(response, usage);
    }

    fn observe_event(&self, data: &str, usage: &mut Usage) {
        let Ok(chunk) = serde_json::from_str::<CompletionResponse>(data) else {
            return;
        };
        self.collect(chunk, usage);
    }
}

impl CompletionsRelay {
    fn collect(&self, response: CompletionResponse, usage: &mut Usage) {
        for text in response.choices.iter().filter_map(|c| c.text.as_deref()) {
            usage.text.push_str(text);
        }
        if let Some(reported) = response
            .usage
            .filter(|u| u.total_tokens > 0 || u.completion_tokens > 0)
        {
            usage.apply_reported(reported);
        }
    }
}
