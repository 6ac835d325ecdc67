//! Channel pool, cooldown bookkeeping and provider abstractions for relayhub.
//!
//! This crate does not depend on axum or any concrete HTTP client. Adapters build
//! `UpstreamHttpRequest`s; a higher layer performs IO.

pub mod api_error;
pub mod channel;
pub mod custom_params;
pub mod errors;
pub mod events;
pub mod headers;
pub mod provider;
pub mod registry;

pub use api_error::{ApiError, ErrorClass};
pub use channel::{
    Channel, ChannelFilter, ChannelGroup, ChannelId, ChannelStatus, ChannelType, ChannelView,
    SelectError,
};
pub use custom_params::CustomParameters;
pub use errors::{ProviderError, ProviderResult};
pub use events::{
    ChannelFailureEvent, ChannelStatusEvent, CooldownEndEvent, CooldownStartEvent, Event,
    EventHub, EventSink, OperationalEvent, RelayOutcomeEvent, TerminalEventSink,
};
pub use headers::{Headers, header_get, header_set};
pub use provider::{
    ByteStream, Endpoint, HttpMethod, Provider, ProviderAdapter, UpstreamBody, UpstreamCtx,
    UpstreamFailure, UpstreamHttpRequest, UpstreamHttpResponse, UpstreamTransportErrorKind,
};
pub use registry::AdapterRegistry;
