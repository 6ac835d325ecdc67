//! Request relay for an OpenAI-compatible gateway: endpoint dispatch, pre-mapping,
//! quota reservation, channel selection and the retry loop.

pub mod auth;
pub mod bootstrap;
pub mod dispatch;
pub mod engine;
pub mod guard;
pub mod handler;
pub mod policy;
pub mod premap;
pub mod quota;
pub mod relay;
pub mod reporter;
pub mod retry;
pub mod selector;
pub mod tokenizer;
pub mod upstream_client;
pub mod usage;

pub use auth::{AuthError, AuthSnapshot, MemoryAuth, TokenContext, TokenEntry};
pub use bootstrap::{
    Bootstrap, BootstrapFile, CliArgs, ReloadSummary, bootstrap, bootstrap_from_env,
};
pub use engine::{InboundRequest, RelayEngine, RelayOutcome};
pub use guard::{Downstream, DownstreamReply, KEEPALIVE_FRAME, StreamGuard};
pub use policy::{RetryPolicy, StatusRetryPolicy};
pub use premap::{PreMapSkip, PreMapping, pre_map};
pub use quota::{
    ConsumeLog, LedgerStats, MemoryLedger, ModelPrice, PriceTable, QuotaLedger, QuotaManager,
};
pub use relay::{AttemptFailure, Relay, RelaySession};
pub use reporter::ErrorReporter;
pub use retry::RetryContext;
pub use selector::ProviderSelector;
pub use upstream_client::{UpstreamClient, UpstreamClientConfig, WreqUpstreamClient};
pub use usage::Usage;
