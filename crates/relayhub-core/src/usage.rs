use relayhub_protocol::openai::CompletionUsage;

use crate::tokenizer;

/// Token accounting for one attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
    /// Generated text seen so far, for when the upstream never reports usage.
    pub text: String,
}

impl Usage {
    pub fn with_prompt(prompt_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            total_tokens: prompt_tokens,
            ..Self::default()
        }
    }

    /// Adopts counts reported by the upstream. Zero prompt counts keep the local estimate.
    pub fn apply_reported(&mut self, reported: CompletionUsage) {
        if reported.prompt_tokens > 0 {
            self.prompt_tokens = reported.prompt_tokens;
        }
        self.completion_tokens = reported.completion_tokens;
        self.total_tokens = if reported.total_tokens > 0 {
            reported.total_tokens
        } else {
            self.prompt_tokens + self.completion_tokens
        };
    }

    /// Counts completion tokens from accumulated text when the upstream reported none.
    pub fn derive_completion(&mut self, model: &str) {
        if self.completion_tokens > 0 || self.text.is_empty() {
            return;
        }
        match tokenizer::count_text(model, &self.text) {
            Ok(tokens) => {
                self.completion_tokens = tokens;
                self.total_tokens = self.prompt_tokens + tokens;
            }
            Err(err) => {
                tracing::warn!(event = "completion_count_failed", model = %model, error = %err);
            }
        }
    }
}
