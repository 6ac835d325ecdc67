use relayhub_provider_core::Endpoint;

use crate::relay::{ChatRelay, CompletionsRelay, EmbeddingsRelay, Relay};

/// Path prefix -> endpoint family. Prefix match, first hit wins.
const ROUTES: [(&str, Endpoint); 3] = [
    ("/v1/chat/completions", Endpoint::ChatCompletions),
    ("/v1/completions", Endpoint::Completions),
    ("/v1/embeddings", Endpoint::Embeddings),
];

/// Paths whose bodies go through pre-mapping.
const PREMAPPING_PREFIXES: [&str; 2] = ["/v1/chat/completions", "/v1/completions"];

pub fn endpoint_for_path(path: &str) -> Option<Endpoint> {
    ROUTES
        .iter()
        .find(|(prefix, _)| path.starts_with(prefix))
        .map(|(_, endpoint)| *endpoint)
}

/// Fresh relay instance for `path`, or `None` for an unknown path.
pub fn relay_for_path(path: &str) -> Option<Box<dyn Relay>> {
    let relay: Box<dyn Relay> = match endpoint_for_path(path)? {
        Endpoint::ChatCompletions => Box::new(ChatRelay::new()),
        Endpoint::Completions => Box::new(CompletionsRelay::new()),
        Endpoint::Embeddings => Box::new(EmbeddingsRelay::new()),
    };
    Some(relay)
}

pub fn is_premapping_path(path: &str) -> bool {
    PREMAPPING_PREFIXES
        .iter()
        .any(|prefix| path.starts_with(prefix))
}
