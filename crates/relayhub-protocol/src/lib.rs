pub mod error;
pub mod openai;
pub mod sse;

pub use error::{ErrorBody, ErrorEnvelope};
