use serde_json::Value as JsonValue;

use relayhub_protocol::openai::embeddings::{EmbeddingInput, EmbeddingRequest, EmbeddingResponse};
use relayhub_provider_core::{ApiError, Endpoint};

use super::{Relay, encode_body, invalid_body, require_model};
use crate::tokenizer::{self, TokenizeError};
use crate::usage::Usage;

/// Embeddings never stream.
#[derive(Debug, Default)]
pub struct EmbeddingsRelay {
    request: Option<EmbeddingRequest>,
}

impl EmbeddingsRelay {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Relay for EmbeddingsRelay {
    fn endpoint(&self) -> Endpoint {
        Endpoint::Embeddings
    }

    fn set_request(&mut self, body: &[u8]) -> Result<(), ApiError> {
        let request: EmbeddingRequest = serde_json::from_slice(body).map_err(invalid_body)?;
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
        false
    }

    fn prompt_tokens(&self) -> Result<u32, TokenizeError> {
        let request = self
            .request
            .as_ref()
            .ok_or(TokenizeError::EmptyInput("request"))?;
        let model = request.model.as_str();
        let tokens = match &request.input {
            EmbeddingInput::Text(text) => tokenizer::count_text(model, text)?,
            EmbeddingInput::Batch(texts) => {
                let mut total = 0u32;
                for text in texts {
                    total = total.saturating_add(tokenizer::count_text(model, text)?);
                }
                total
            }
            EmbeddingInput::Tokens(tokens) => u32::try_from(tokens.len()).unwrap_or(u32::MAX),
            EmbeddingInput::TokenBatch(batch) => {
                u32::try_from(batch.iter().map(Vec::len).sum::<usize>()).unwrap_or(u32::MAX)
            }
        };
        Ok(tokens)
    }

    fn upstream_body(&self, model: &str) -> Result<JsonValue, ApiError> {
        encode_body(self.request.as_ref(), model)
    }

    fn observe_body(&self, body: &[u8], usage: &mut Usage) {
        if let Ok(EmbeddingResponse {
            usage: Some(reported),
        }) = serde_json::from_slice::<EmbeddingResponse>(body)
        {
            usage.apply_reported(reported);
        }
    }
}
