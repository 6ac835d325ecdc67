use std::sync::OnceLock;

use tiktoken_rs::{CoreBPE, cl100k_base, o200k_base};

use relayhub_protocol::openai::chat::ChatMessage;

/// Fixed overhead per chat message (role and separators).
const TOKENS_PER_MESSAGE: usize = 3;
const TOKENS_PER_NAME: usize = 1;
/// Every reply is primed with `<|start|>assistant<|message|>`.
const REPLY_PRIMING_TOKENS: usize = 3;

#[derive(Debug, thiserror::Error)]
pub enum TokenizeError {
    #[error("tokenizer for model {0} is unavailable")]
    EncoderUnavailable(String),
    #[error("request has nothing to count: {0}")]
    EmptyInput(&'static str),
}

fn encoder(model: &str) -> Result<&'static CoreBPE, TokenizeError> {
    static O200K: OnceLock<Option<CoreBPE>> = OnceLock::new();
    static CL100K: OnceLock<Option<CoreBPE>> = OnceLock::new();

    let cached = if uses_o200k(model) {
        O200K.get_or_init(|| o200k_base().ok())
    } else {
        CL100K.get_or_init(|| cl100k_base().ok())
    };
    cached
        .as_ref()
        .ok_or_else(|| TokenizeError::EncoderUnavailable(model.to_string()))
}

fn uses_o200k(model: &str) -> bool {
    const PREFIXES: [&str; 7] = ["gpt-4o", "gpt-4.1", "gpt-5", "chatgpt-4o", "o1", "o3", "o4"];
    PREFIXES.iter().any(|prefix| model.starts_with(prefix))
}

pub fn count_text(model: &str, text: &str) -> Result<u32, TokenizeError> {
    if text.is_empty() {
        return Ok(0);
    }
    let tokens = encoder(model)?.encode_ordinary(text).len();
    Ok(saturate(tokens))
}

pub fn count_chat(model: &str, messages: &[ChatMessage]) -> Result<u32, TokenizeError> {
    if messages.is_empty() {
        return Err(TokenizeError::EmptyInput("messages"));
    }
    let bpe = encoder(model)?;
    let mut total = REPLY_PRIMING_TOKENS;
    for message in messages {
        total += TOKENS_PER_MESSAGE;
        total += bpe.encode_ordinary(&message.role).len();
        if let Some(content) = &message.content {
            total += bpe.encode_ordinary(&content.text()).len();
        }
        if let Some(name) = &message.name {
            total += bpe.encode_ordinary(name).len() + TOKENS_PER_NAME;
        }
    }
    Ok(saturate(total))
}

fn saturate(tokens: usize) -> u32 {
    u32::try_from(tokens).unwrap_or(u32::MAX)
}
