use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::model::{Event, ResourceKey};

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub for change events, one channel per artist or stage timeline.
pub struct NotifyHub {
    channels: DashMap<ResourceKey, broadcast::Sender<Event>>,
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

    /// Subscribe to a timeline's events. Creates the channel if needed.
    pub fn subscribe(&self, key: ResourceKey) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(key)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// No-op if nobody is listening.
    pub fn send(&self, key: ResourceKey, event: &Event) {
        if let Some(sender) = self.channels.get(&key) {
            let _ = sender.send(event.clone());
        }
    }

    /// Drop the channel of a deleted resource; open receivers see the stream close.
    pub fn remove(&self, key: &ResourceKey) {
        self.channels.remove(key);
    }

    pub fn subscriber_count(&self, key: &ResourceKey) -> usize {
        self.channels
            .get(key)
            .map(|s| s.receiver_count())
            .unwrap_or(0)
    }
}
