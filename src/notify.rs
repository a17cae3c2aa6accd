use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub for per-theater change feeds. Owned by the tenant's engine
/// and passed in explicitly — the scheduling core never holds connection
/// state of its own.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Event>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to change events for a theater. Creates the channel if needed.
    pub fn subscribe(&self, theater_id: Ulid) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(theater_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a notification. No-op if nobody is listening.
    pub fn send(&self, theater_id: Ulid, event: &Event) {
        if let Some(sender) = self.channels.get(&theater_id) {
            let _ = sender.send(event.clone());
        }
    }

    /// Remove a channel (e.g. when a theater is deleted).
    pub fn remove(&self, theater_id: &Ulid) {
        self.channels.remove(theater_id);
    }
}
