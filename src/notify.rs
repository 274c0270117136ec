use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::model::{Event, RoomId};

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub for committed events. One channel per room plus a firehose
/// carrying everything — external notification/reminder systems subscribe
/// here; delivering SMS/email is their problem, not ours.
pub struct NotifyHub {
    channels: DashMap<RoomId, broadcast::Sender<Event>>,
    firehose: broadcast::Sender<Event>,
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
            firehose: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    /// Subscribe to notifications for a room. Creates the channel if needed.
    pub fn subscribe(&self, room_id: RoomId) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(room_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Subscribe to every committed event.
    pub fn subscribe_all(&self) -> broadcast::Receiver<Event> {
        self.firehose.subscribe()
    }

    /// Publish an event on each listed room's channel, and once on the
    /// firehose. No-op per channel if nobody is listening.
    pub fn publish(&self, rooms: &[RoomId], event: &Event) {
        for room_id in rooms {
            if let Some(sender) = self.channels.get(room_id) {
                let _ = sender.send(event.clone());
            }
        }
        let _ = self.firehose.send(event.clone());
    }

    /// Publish an event touching a single room.
    pub fn send(&self, room_id: RoomId, event: &Event) {
        self.publish(&[room_id], event);
    }

    /// Publish an event that has no room (e.g. tenant registration without
    /// an assignment) on the firehose only.
    pub fn send_global(&self, event: &Event) {
        self.publish(&[], event);
    }
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}
