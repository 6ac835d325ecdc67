use std::error::Error;
use std::fmt;

pub type ProviderResult<T> = Result<T, ProviderError>;

#[derive(Debug, Clone)]
pub enum ProviderError {
    /// The channel type has no registered adapter.
    NoAdapter(String),
    InvalidConfig(String),
    Encode(String),
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderError::NoAdapter(kind) => write!(f, "no adapter for channel type {kind}"),
            ProviderError::InvalidConfig(msg) => write!(f, "invalid channel config: {msg}"),
            ProviderError::Encode(msg) => write!(f, "request encode failed: {msg}"),
        }
    }
}

impl Error for ProviderError {}
