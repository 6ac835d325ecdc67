use relayhub_provider_core::{ApiError, UpstreamCtx};

use crate::auth::TokenContext;
use crate::quota::{ConsumeLog, QuotaManager};
use crate::relay::{AttemptFailure, RelaySession};
use crate::upstream_client::UpstreamClient;
use crate::usage::Usage;

/// One attempt: count the prompt, reserve quota, call the upstream, then settle.
///
/// The reservation is resolved before this returns, on every path.
pub async fn relay_handler(
    session: &mut RelaySession,
    quotas: &QuotaManager,
    client: &dyn UpstreamClient,
    token: &TokenContext,
    ctx: &UpstreamCtx,
) -> Result<ConsumeLog, AttemptFailure> {
    let prompt_tokens = session
        .relay()
        .prompt_tokens()
        .map_err(|err| AttemptFailure::done(ApiError::client_input("token_error", err.to_string())))?;

    let model = session.original_model().to_string();
    let mut reservation = quotas
        .quota(token, &model, prompt_tokens)
        .pre_consume()
        .map_err(AttemptFailure::done)?;

    let mut usage = Usage::with_prompt(prompt_tokens);
    let result = session.send(client, ctx, &mut usage).await;
    usage.derive_completion(&model);

    match result {
        Err(failure) => {
            reservation.undo();
            Err(failure)
        }
        Ok(()) => {
            let channel_id = session
                .provider()
                .map(|provider| provider.channel().id)
                .unwrap_or_default();
            reservation.set_first_response_time(session.first_response_time());
            Ok(reservation.consume(&usage, channel_id, session.is_stream()))
        }
    }
}
