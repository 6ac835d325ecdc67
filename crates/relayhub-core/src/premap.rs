//! Pre-mapping: merges a channel's `pre_add` custom parameters into the raw request body
//! before the relay parses it.
//!
//! The transform is total. Every branch yields a body, and any failure yields the
//! caller's bytes untouched.

use bytes::Bytes;
use serde_json::{Map, Value as JsonValue};
use tracing::debug;

use relayhub_provider_core::ChannelFilter;

use crate::dispatch::is_premapping_path;
use crate::selector::ProviderSelector;

/// Why a body was left as sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreMapSkip {
    NotCompletionPath,
    InvalidJson,
    MissingModel,
    NoProvider,
    NoCustomParameters,
    CustomParametersError,
    NoPreAdd,
    EncodeFailed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreMapping {
    Unchanged { body: Bytes, reason: PreMapSkip },
    Merged(Bytes),
}

impl PreMapping {
    pub fn into_body(self) -> Bytes {
        match self {
            PreMapping::Unchanged { body, .. } | PreMapping::Merged(body) => body,
        }
    }

    pub fn skip_reason(&self) -> Option<PreMapSkip> {
        match self {
            PreMapping::Unchanged { reason, .. } => Some(*reason),
            PreMapping::Merged(_) => None,
        }
    }
}

pub async fn pre_map(
    path: &str,
    body: Bytes,
    selector: &ProviderSelector,
    group: &str,
    filters: &[ChannelFilter],
) -> PreMapping {
    let unchanged = |body: Bytes, reason: PreMapSkip| {
        debug!(event = "premap_skipped", path = %path, reason = ?reason);
        PreMapping::Unchanged { body, reason }
    };

    if !is_premapping_path(path) {
        return PreMapping::Unchanged {
            body,
            reason: PreMapSkip::NotCompletionPath,
        };
    }
    let mut request = match serde_json::from_slice::<Map<String, JsonValue>>(&body) {
        Ok(request) => request,
        Err(_) => return unchanged(body, PreMapSkip::InvalidJson),
    };
    let model = match request.get("model").and_then(JsonValue::as_str) {
        Some(model) if !model.is_empty() => model.to_string(),
        _ => return unchanged(body, PreMapSkip::MissingModel),
    };
    let provider = match selector.select(group, &model, filters).await {
        Ok(provider) => provider,
        Err(_) => return unchanged(body, PreMapSkip::NoProvider),
    };
    let params = match provider.custom_parameters() {
        Ok(Some(params)) => params,
        Ok(None) => return unchanged(body, PreMapSkip::NoCustomParameters),
        Err(_) => return unchanged(body, PreMapSkip::CustomParametersError),
    };
    if !params.pre_add() {
        return unchanged(body, PreMapSkip::NoPreAdd);
    }

    params.merge_into(&mut request, &model);
    match serde_json::to_vec(&request) {
        Ok(merged) => {
            debug!(
                event = "premap_merged",
                path = %path,
                model = %model,
                channel_id = provider.channel().id
            );
            PreMapping::Merged(Bytes::from(merged))
        }
        Err(_) => unchanged(body, PreMapSkip::EncodeFailed),
    }
}
