use std::time::Duration;

use tokio::time::Instant;

use relayhub_provider_core::ChannelId;

/// Per-request retry bookkeeping, threaded through the attempt loop.
#[derive(Debug, Clone)]
pub struct RetryContext {
    started: Instant,
    retry_times: u32,
    timeout: Duration,
    skipped: Vec<ChannelId>,
    total_channels: Option<usize>,
    attempt: u32,
}

impl RetryContext {
    pub fn new(retry_times: u32, timeout: Duration) -> Self {
        Self {
            started: Instant::now(),
            retry_times,
            timeout,
            skipped: Vec::new(),
            total_channels: None,
            attempt: 1,
        }
    }

    /// Counts the wall-clock budget from `started` (request arrival) instead of now.
    pub fn with_start(mut self, started: Instant) -> Self {
        self.started = started;
        self
    }

    /// Eligible channel count at request start. Later calls are ignored.
    pub fn set_total_channels(&mut self, total: usize) {
        self.total_channels.get_or_insert(total);
    }

    pub fn total_channels(&self) -> usize {
        self.total_channels.unwrap_or_default()
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Retries left after the current attempt.
    pub fn remaining(&self) -> u32 {
        self.retry_times.saturating_sub(self.attempt - 1)
    }

    pub fn next_attempt(&mut self) {
        self.attempt += 1;
    }

    pub fn skip(&mut self, channel_id: ChannelId) {
        if !self.skipped.contains(&channel_id) {
            self.skipped.push(channel_id);
        }
    }

    pub fn skipped(&self) -> &[ChannelId] {
        &self.skipped
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn timed_out(&self) -> bool {
        self.elapsed() > self.timeout
    }
}
