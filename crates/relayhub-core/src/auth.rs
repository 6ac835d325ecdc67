use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use http::{HeaderMap, StatusCode};
use serde::Deserialize;

use relayhub_provider_core::ChannelId;

/// Who is calling, and which channel group serves them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenContext {
    pub token_id: i64,
    pub token_name: String,
    pub user_id: i64,
    pub group: String,
    /// Restricts the request to one channel; such requests are never retried.
    pub pinned_channel: Option<ChannelId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthError {
    pub status: StatusCode,
    pub message: &'static str,
}

impl AuthError {
    fn new(status: StatusCode, message: &'static str) -> Self {
        Self { status, message }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenEntry {
    pub id: i64,
    pub key: String,
    #[serde(default)]
    pub name: String,
    pub user_id: i64,
    #[serde(default = "default_group")]
    pub group: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub pinned_channel: Option<ChannelId>,
}

fn default_group() -> String {
    "default".to_string()
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Default)]
pub struct AuthSnapshot {
    pub tokens_by_key: HashMap<String, TokenEntry>,
}

impl AuthSnapshot {
    pub fn from_entries(entries: impl IntoIterator<Item = TokenEntry>) -> Self {
        Self {
            tokens_by_key: entries
                .into_iter()
                .map(|entry| (entry.key.clone(), entry))
                .collect(),
        }
    }
}

/// API-key lookup over a swappable in-memory snapshot.
#[derive(Debug)]
pub struct MemoryAuth {
    snapshot: ArcSwap<AuthSnapshot>,
}

impl MemoryAuth {
    pub fn new(snapshot: AuthSnapshot) -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(snapshot),
        }
    }

    pub fn replace_snapshot(&self, snapshot: AuthSnapshot) {
        self.snapshot.store(Arc::new(snapshot));
    }

    pub fn authenticate(&self, headers: &HeaderMap) -> Result<TokenContext, AuthError> {
        let key = extract_api_key(headers)
            .ok_or_else(|| AuthError::new(StatusCode::UNAUTHORIZED, "missing api key"))?;
        let snapshot = self.snapshot.load();
        let entry = snapshot
            .tokens_by_key
            .get(key.as_str())
            .ok_or_else(|| AuthError::new(StatusCode::FORBIDDEN, "invalid api key"))?;
        if !entry.enabled {
            return Err(AuthError::new(StatusCode::FORBIDDEN, "api key disabled"));
        }
        Ok(TokenContext {
            token_id: entry.id,
            token_name: entry.name.clone(),
            user_id: entry.user_id,
            group: entry.group.clone(),
            pinned_channel: entry.pinned_channel,
        })
    }
}

fn extract_api_key(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = header_value(headers, "x-api-key") {
        return Some(value);
    }
    let auth = header_value(headers, "authorization")?;
    let (scheme, token) = auth.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    Some(token.trim().to_string()).filter(|token| !token.is_empty())
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use http::HeaderValue;

    use super::*;

    fn auth() -> MemoryAuth {
        MemoryAuth::new(AuthSnapshot::from_entries([
            TokenEntry {
                id: 1,
                key: "sk-live".to_string(),
                name: "live".to_string(),
                user_id: 7,
                group: "vip".to_string(),
                enabled: true,
                pinned_channel: None,
            },
            TokenEntry {
                id: 2,
                key: "sk-off".to_string(),
                name: "off".to_string(),
                user_id: 7,
                group: "default".to_string(),
                enabled: false,
                pinned_channel: None,
            },
        ]))
    }

    #[test]
    fn bearer_and_x_api_key() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer sk-live"));
        let token = auth().authenticate(&headers).unwrap();
        assert_eq!((token.user_id, token.group.as_str()), (7, "vip"));

        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("sk-live"));
        assert!(auth().authenticate(&headers).is_ok());
    }

    #[test]
    fn rejects_missing_unknown_and_disabled() {
        let auth = auth();
        assert_eq!(
            auth.authenticate(&HeaderMap::new()).unwrap_err().status,
            StatusCode::UNAUTHORIZED
        );
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer nope"));
        assert_eq!(auth.authenticate(&headers).unwrap_err().status, StatusCode::FORBIDDEN);
        headers.insert("authorization", HeaderValue::from_static("Bearer sk-off"));
        assert_eq!(auth.authenticate(&headers).unwrap_err().status, StatusCode::FORBIDDEN);
    }
}
