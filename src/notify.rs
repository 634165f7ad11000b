use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub for committed events: one channel per doctor plus a
/// firehose that sees every event.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Event>>,
    all: broadcast::Sender<Event>,
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
            all: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    /// Subscribe to one doctor's events. Creates the channel if needed.
    pub fn subscribe(&self, doctor_id: Ulid) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(doctor_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    pub fn subscribe_all(&self) -> broadcast::Receiver<Event> {
        self.all.subscribe()
    }

    /// Send a notification. No-op if nobody is listening.
    pub fn send(&self, doctor_id: Ulid, event: &Event) {
        if let Some(sender) = self.channels.get(&doctor_id) {
            let _ = sender.send(event.clone());
        }
        let _ = self.all.send(event.clone());
    }

    /// Drop a doctor's channel once the doctor is removed.
    pub fn remove(&self, doctor_id: &Ulid) {
        self.channels.remove(doctor_id);
    }
}
