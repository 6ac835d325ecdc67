use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// `{"error": {...}}` as returned by OpenAI-compatible upstreams and by the gateway itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub error: ErrorBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    #[serde(default)]
    pub message: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub param: Option<String>,
    /// Upstreams send both strings and integers here.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub code: Option<JsonValue>,
}

impl ErrorBody {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: kind.into(),
            param: None,
            code: None,
        }
    }

    pub fn code_str(&self) -> Option<&str> {
        self.code.as_ref().and_then(JsonValue::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_numeric_code() {
        let raw = r#"{"error":{"message":"slow down","type":"rate_limit","code":429}}"#;
        let env: ErrorEnvelope = serde_json::from_str(raw).unwrap();
        assert_eq!(env.error.kind, "rate_limit");
        assert_eq!(env.error.code, Some(JsonValue::from(429)));
        assert_eq!(env.error.code_str(), None);
    }
}
