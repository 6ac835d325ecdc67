//! Token-quota reservation and settlement.
//!
//! A request walks `Quota` -> [`Reservation`] -> undone or consumed. Both terminal
//! operations take the reservation by value, so applying both, or either twice, does not
//! compile. A reservation dropped unresolved is refunded and logged.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, warn};

use relayhub_provider_core::{ApiError, ChannelId};

use crate::auth::TokenContext;
use crate::usage::Usage;

/// Quota units charged per token.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPrice {
    pub input: f64,
    pub output: f64,
}

impl Default for ModelPrice {
    fn default() -> Self {
        Self {
            input: 1.0,
            output: 1.0,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PriceTable {
    pub models: HashMap<String, ModelPrice>,
    pub group_ratios: HashMap<String, f64>,
    pub default_price: ModelPrice,
}

impl PriceTable {
    pub fn price(&self, model: &str) -> ModelPrice {
        self.models
            .get(model)
            .copied()
            .unwrap_or(self.default_price)
    }

    pub fn group_ratio(&self, group: &str) -> f64 {
        self.group_ratios.get(group).copied().unwrap_or(1.0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QuotaError {
    #[error("quota account for user {0} not found")]
    UnknownAccount(i64),
    #[error("insufficient quota: need {needed}, have {available}")]
    Insufficient { needed: i64, available: i64 },
}

/// One billed request, as written to the usage log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConsumeLog {
    /// Unix seconds.
    pub created_at: i64,
    pub user_id: i64,
    pub token_id: i64,
    pub token_name: String,
    pub group: String,
    pub channel_id: ChannelId,
    pub model: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub quota: i64,
    pub is_stream: bool,
    pub first_response_ms: Option<u64>,
}

/// Balance store behind the quota manager.
pub trait QuotaLedger: Send + Sync {
    fn reserve(&self, token: &TokenContext, amount: i64) -> Result<(), QuotaError>;
    fn release(&self, token: &TokenContext, amount: i64);
    /// Charges `actual` against an earlier reservation of `reserved`.
    fn settle(&self, token: &TokenContext, reserved: i64, actual: i64);
    fn record(&self, log: ConsumeLog);
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LedgerStats {
    pub reservations: u32,
    pub releases: u32,
    pub settlements: u32,
}

/// In-process ledger keyed by user id.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    balances: Mutex<HashMap<i64, i64>>,
    logs: Mutex<Vec<ConsumeLog>>,
    stats: Mutex<LedgerStats>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_balance(&self, user_id: i64, quota: i64) {
        lock(&self.balances).insert(user_id, quota);
    }

    pub fn balance(&self, user_id: i64) -> Option<i64> {
        lock(&self.balances).get(&user_id).copied()
    }

    pub fn logs(&self) -> Vec<ConsumeLog> {
        lock(&self.logs).clone()
    }

    pub fn stats(&self) -> LedgerStats {
        *lock(&self.stats)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl QuotaLedger for MemoryLedger {
    fn reserve(&self, token: &TokenContext, amount: i64) -> Result<(), QuotaError> {
        let mut balances = lock(&self.balances);
        let balance = balances
            .get_mut(&token.user_id)
            .ok_or(QuotaError::UnknownAccount(token.user_id))?;
        if *balance < amount {
            return Err(QuotaError::Insufficient {
                needed: amount,
                available: *balance,
            });
        }
        *balance -= amount;
        lock(&self.stats).reservations += 1;
        Ok(())
    }

    fn release(&self, token: &TokenContext, amount: i64) {
        if let Some(balance) = lock(&self.balances).get_mut(&token.user_id) {
            *balance += amount;
        }
        lock(&self.stats).releases += 1;
    }

    fn settle(&self, token: &TokenContext, reserved: i64, actual: i64) {
        if let Some(balance) = lock(&self.balances).get_mut(&token.user_id) {
            *balance -= actual - reserved;
        }
        lock(&self.stats).settlements += 1;
    }

    fn record(&self, log: ConsumeLog) {
        lock(&self.logs).push(log);
    }
}

/// Entry point for quota accounting; prices can be swapped at runtime.
pub struct QuotaManager {
    ledger: Arc<dyn QuotaLedger>,
    prices: ArcSwap<PriceTable>,
}

impl QuotaManager {
    pub fn new(ledger: Arc<dyn QuotaLedger>, prices: PriceTable) -> Self {
        Self {
            ledger,
            prices: ArcSwap::from_pointee(prices),
        }
    }

    pub fn set_prices(&self, prices: PriceTable) {
        self.prices.store(Arc::new(prices));
    }

    pub fn quota(&self, token: &TokenContext, model: &str, prompt_tokens: u32) -> Quota {
        let prices = self.prices.load();
        Quota {
            ledger: self.ledger.clone(),
            token: token.clone(),
            model: model.to_string(),
            price: prices.price(model),
            group_ratio: prices.group_ratio(&token.group),
            prompt_tokens,
        }
    }
}

/// Not yet reserved.
pub struct Quota {
    ledger: Arc<dyn QuotaLedger>,
    token: TokenContext,
    model: String,
    price: ModelPrice,
    group_ratio: f64,
    prompt_tokens: u32,
}

impl Quota {
    /// Reserves the prompt cost. Failure is terminal for the request.
    pub fn pre_consume(self) -> Result<Reservation, ApiError> {
        let amount = self.cost(self.prompt_tokens, 0);
        if amount > 0 {
            self.ledger
                .reserve(&self.token, amount)
                .map_err(|err| ApiError::quota(err.to_string()))?;
        }
        debug!(
            event = "quota_reserved",
            user_id = self.token.user_id,
            model = %self.model,
            amount
        );
        Ok(Reservation {
            quota: self,
            reserved: amount,
            first_response: None,
            resolved: false,
        })
    }

    fn cost(&self, prompt_tokens: u32, completion_tokens: u32) -> i64 {
        let raw = (f64::from(prompt_tokens) * self.price.input
            + f64::from(completion_tokens) * self.price.output)
            * self.group_ratio;
        // Float-to-int `as` saturates.
        raw.max(0.0).ceil() as i64
    }
}

/// Reserved quota awaiting exactly one of [`Reservation::undo`] or [`Reservation::consume`].
pub struct Reservation {
    quota: Quota,
    reserved: i64,
    first_response: Option<Duration>,
    resolved: bool,
}

impl Reservation {
    pub fn reserved(&self) -> i64 {
        self.reserved
    }

    pub fn set_first_response_time(&mut self, elapsed: Option<Duration>) {
        self.first_response = elapsed;
    }

    pub fn undo(mut self) {
        self.release();
    }

    pub fn consume(mut self, usage: &Usage, channel_id: ChannelId, is_stream: bool) -> ConsumeLog {
        let actual = self.quota.cost(usage.prompt_tokens, usage.completion_tokens);
        let quota = &self.quota;
        quota.ledger.settle(&quota.token, self.reserved, actual);
        let log = ConsumeLog {
            created_at: OffsetDateTime::now_utc().unix_timestamp(),
            user_id: quota.token.user_id,
            token_id: quota.token.token_id,
            token_name: quota.token.token_name.clone(),
            group: quota.token.group.clone(),
            channel_id,
            model: quota.model.clone(),
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            quota: actual,
            is_stream,
            first_response_ms: self
                .first_response
                .map(|elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)),
        };
        quota.ledger.record(log.clone());
        self.resolved = true;
        log
    }

    fn release(&mut self) {
        if self.resolved {
            return;
        }
        self.resolved = true;
        if self.reserved > 0 {
            self.quota.ledger.release(&self.quota.token, self.reserved);
        }
        debug!(
            event = "quota_released",
            user_id = self.quota.token.user_id,
            amount = self.reserved
        );
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.resolved {
            warn!(
                event = "quota_reservation_dropped",
                user_id = self.quota.token.user_id,
                model = %self.quota.model,
                amount = self.reserved
            );
            self.release();
        }
    }
}
