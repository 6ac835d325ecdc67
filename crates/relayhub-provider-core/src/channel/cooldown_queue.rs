use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::SystemTime;

use tokio::sync::{Mutex, Notify, RwLock};
use tokio::time::{Instant, sleep_until};

use crate::events::{CooldownEndEvent, Event, EventHub, OperationalEvent};

use super::ChannelId;

pub(super) type CooldownKey = (ChannelId, String);
pub(super) type CooldownMap = HashMap<CooldownKey, Instant>;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct Expiry {
    at: Instant,
    channel_id: ChannelId,
    model: String,
}

/// Min-heap of cooldown expiries driving the recovery task.
///
/// The heap may hold stale entries after a pair is re-cooled; the map entry is the source
/// of truth and is only removed once its own expiry has passed.
#[derive(Debug)]
pub(super) struct CooldownQueue {
    heap: Mutex<BinaryHeap<Reverse<Expiry>>>,
    wake: Notify,
}

impl CooldownQueue {
    pub(super) fn new() -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            wake: Notify::new(),
        }
    }

    pub(super) async fn schedule(&self, at: Instant, channel_id: ChannelId, model: String) {
        self.heap.lock().await.push(Reverse(Expiry {
            at,
            channel_id,
            model,
        }));
        self.wake.notify_one();
    }

    pub(super) fn spawn_recover_task(
        self: Arc<Self>,
        cooldowns: Arc<RwLock<CooldownMap>>,
        events: EventHub,
    ) {
        tokio::spawn(async move {
            loop {
                let next_at = self.heap.lock().await.peek().map(|Reverse(e)| e.at);
                match next_at {
                    Some(at) => {
                        tokio::select! {
                            _ = sleep_until(at) => {}
                            // An earlier expiry may have been scheduled meanwhile.
                            _ = self.wake.notified() => continue,
                        }
                    }
                    None => {
                        self.wake.notified().await;
                        continue;
                    }
                }

                let now = Instant::now();
                let due = self.drain_due(now).await;
                if due.is_empty() {
                    continue;
                }

                let mut recovered = Vec::new();
                {
                    let mut map = cooldowns.write().await;
                    for expiry in due {
                        let key = (expiry.channel_id, expiry.model);
                        if map.get(&key).is_some_and(|until| *until <= now) {
                            map.remove(&key);
                            recovered.push(key);
                        }
                    }
                }
                for (channel_id, model) in recovered {
                    events
                        .emit(Event::Operational(OperationalEvent::CooldownEnd(
                            CooldownEndEvent {
                                at: SystemTime::now(),
                                channel_id,
                                model,
                            },
                        )))
                        .await;
                }
            }
        });
    }

    async fn drain_due(&self, now: Instant) -> Vec<Expiry> {
        let mut heap = self.heap.lock().await;
        let mut due = Vec::new();
        while heap.peek().is_some_and(|Reverse(e)| e.at <= now) {
            if let Some(Reverse(expiry)) = heap.pop() {
                due.push(expiry);
            }
        }
        due
    }
}
