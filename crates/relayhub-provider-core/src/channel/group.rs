use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use rand::Rng;
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::events::{
    ChannelStatusEvent, CooldownStartEvent, Event, EventHub, OperationalEvent,
};

use super::cooldown_queue::{CooldownMap, CooldownQueue};
use super::{Channel, ChannelFilter, ChannelId, ChannelStatus};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectError {
    NoChannel { group: String, model: String },
}

impl fmt::Display for SelectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectError::NoChannel { group, model } => write!(
                f,
                "no available channel for model {model} under group {group}"
            ),
        }
    }
}

impl std::error::Error for SelectError {}

/// Admin view of one channel.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelView {
    pub channel: Channel,
    pub status: ChannelStatus,
    /// Models currently cooling down, with the remaining seconds.
    pub cooldowns: Vec<(String, u64)>,
}

/// Process-wide channel pool with per-(channel, model) cooldowns.
///
/// All maps sit behind tokio `RwLock`s; every in-flight request reads them and any
/// request observing a 429 writes the cooldown map.
pub struct ChannelGroup {
    channels: RwLock<HashMap<ChannelId, Arc<Channel>>>,
    statuses: RwLock<HashMap<ChannelId, ChannelStatus>>,
    cooldowns: Arc<RwLock<CooldownMap>>,
    cooldown_millis: AtomicU64,
    events: EventHub,
    queue: Arc<CooldownQueue>,
}

impl ChannelGroup {
    /// Must be called inside a tokio runtime; the cooldown recovery task is spawned here.
    pub fn new(events: EventHub, cooldown: Duration) -> Self {
        let cooldowns = Arc::new(RwLock::new(HashMap::new()));
        let queue = Arc::new(CooldownQueue::new());
        queue
            .clone()
            .spawn_recover_task(cooldowns.clone(), events.clone());
        Self {
            channels: RwLock::new(HashMap::new()),
            statuses: RwLock::new(HashMap::new()),
            cooldowns,
            cooldown_millis: AtomicU64::new(duration_millis(cooldown)),
            events,
            queue,
        }
    }

    pub fn events(&self) -> &EventHub {
        &self.events
    }

    pub fn set_cooldown_period(&self, cooldown: Duration) {
        self.cooldown_millis
            .store(duration_millis(cooldown), Ordering::Relaxed);
    }

    pub fn cooldown_period(&self) -> Duration {
        Duration::from_millis(self.cooldown_millis.load(Ordering::Relaxed))
    }

    pub async fn insert(&self, channel: Channel) {
        let id = channel.id;
        let status = channel.status;
        self.channels.write().await.insert(id, Arc::new(channel));
        self.statuses.write().await.insert(id, status);
    }

    pub async fn remove(&self, id: ChannelId) {
        self.channels.write().await.remove(&id);
        self.statuses.write().await.remove(&id);
        self.cooldowns
            .write()
            .await
            .retain(|(channel_id, _), _| *channel_id != id);
    }

    pub async fn get(&self, id: ChannelId) -> Option<Arc<Channel>> {
        self.channels.read().await.get(&id).cloned()
    }

    pub async fn status(&self, id: ChannelId) -> Option<ChannelStatus> {
        self.statuses.read().await.get(&id).copied()
    }

    /// Returns whether the status changed.
    pub async fn set_status(&self, id: ChannelId, status: ChannelStatus) -> bool {
        let previous = {
            let mut statuses = self.statuses.write().await;
            let Some(slot) = statuses.get_mut(&id) else {
                return false;
            };
            std::mem::replace(slot, status)
        };
        if previous == status {
            return false;
        }
        self.events
            .emit(Event::Operational(OperationalEvent::ChannelStatus(
                ChannelStatusEvent {
                    at: SystemTime::now(),
                    channel_id: id,
                    from: previous,
                    to: status,
                },
            )))
            .await;
        true
    }

    /// Puts (channel, model) into cooldown for the configured period. No-op when the
    /// period is zero.
    pub async fn set_cooldown(&self, channel_id: ChannelId, model: &str) {
        let period = self.cooldown_period();
        if period.is_zero() {
            return;
        }
        let until = Instant::now() + period;
        self.cooldowns
            .write()
            .await
            .insert((channel_id, model.to_string()), until);
        self.queue
            .schedule(until, channel_id, model.to_string())
            .await;

        self.events
            .emit(Event::Operational(OperationalEvent::CooldownStart(
                CooldownStartEvent {
                    at: SystemTime::now(),
                    channel_id,
                    model: model.to_string(),
                    until: SystemTime::now()
                        .checked_add(period)
                        .unwrap_or_else(SystemTime::now),
                },
            )))
            .await;
    }

    /// Expiry of an active cooldown, if any.
    pub async fn cooldown_until(&self, channel_id: ChannelId, model: &str) -> Option<Instant> {
        let until = self
            .cooldowns
            .read()
            .await
            .get(&(channel_id, model.to_string()))
            .copied()?;
        (until > Instant::now()).then_some(until)
    }

    pub async fn count_available(
        &self,
        group: &str,
        model: &str,
        filters: &[ChannelFilter],
    ) -> usize {
        self.eligible(group, model, filters).await.len()
    }

    /// Picks one eligible channel: highest priority tier first, then weighted random
    /// inside the tier.
    pub async fn select(
        &self,
        group: &str,
        model: &str,
        filters: &[ChannelFilter],
    ) -> Result<Arc<Channel>, SelectError> {
        let eligible = self.eligible(group, model, filters).await;
        let no_channel = || SelectError::NoChannel {
            group: group.to_string(),
            model: model.to_string(),
        };
        let top = eligible
            .iter()
            .map(|channel| channel.priority)
            .max()
            .ok_or_else(no_channel)?;
        let tier: Vec<Arc<Channel>> = eligible
            .into_iter()
            .filter(|channel| channel.priority == top)
            .collect();
        let weights: Vec<u32> = tier.iter().map(|channel| channel.weight).collect();
        tier.get(pick_weighted_index(&weights))
            .cloned()
            .ok_or_else(no_channel)
    }

    pub async fn snapshot(&self) -> Vec<ChannelView> {
        let channels = self.channels.read().await;
        let statuses = self.statuses.read().await;
        let cooldowns = self.cooldowns.read().await;
        let now = Instant::now();

        let mut views: Vec<ChannelView> = channels
            .values()
            .map(|channel| {
                let mut active: Vec<(String, u64)> = cooldowns
                    .iter()
                    .filter(|((id, _), until)| *id == channel.id && **until > now)
                    .map(|((_, model), until)| {
                        (model.clone(), until.duration_since(now).as_secs())
                    })
                    .collect();
                active.sort();
                ChannelView {
                    channel: channel.as_ref().clone(),
                    status: statuses.get(&channel.id).copied().unwrap_or_default(),
                    cooldowns: active,
                }
            })
            .collect();
        views.sort_by_key(|view| view.channel.id);
        views
    }

    async fn eligible(
        &self,
        group: &str,
        model: &str,
        filters: &[ChannelFilter],
    ) -> Vec<Arc<Channel>> {
        let channels = self.channels.read().await;
        let statuses = self.statuses.read().await;
        let cooldowns = self.cooldowns.read().await;
        let now = Instant::now();

        let mut eligible: Vec<Arc<Channel>> = channels
            .values()
            .filter(|channel| matches!(statuses.get(&channel.id), Some(ChannelStatus::Enabled)))
            .filter(|channel| channel.serves(group, model))
            .filter(|channel| filters.iter().all(|filter| filter.allows(channel)))
            .filter(|channel| {
                cooldowns
                    .get(&(channel.id, model.to_string()))
                    .is_none_or(|until| *until <= now)
            })
            .cloned()
            .collect();
        // HashMap order is random; keep selection input stable.
        eligible.sort_by_key(|channel| channel.id);
        eligible
    }
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn pick_weighted_index(weights: &[u32]) -> usize {
    if weights.len() <= 1 {
        return 0;
    }

    let total: u64 = weights.iter().map(|weight| u64::from(*weight)).sum();
    if total == 0 {
        return rand::rng().random_range(0..weights.len());
    }

    let mut roll = rand::rng().random_range(0..total);
    for (index, weight) in weights.iter().enumerate() {
        let weight = u64::from(*weight);
        if roll < weight {
            return index;
        }
        roll -= weight;
    }

    weights.len() - 1
}
