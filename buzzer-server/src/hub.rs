//! In-process broadcast hub
//!
//! Every connection registers an outbound line channel; room events are
//! serialized once and fanned out to the connections joined to that room.

use std::collections::HashMap;

use buzzer_core::collaborators::Broadcaster;
use buzzer_core::{PublishError, RoomEvent, ServerMessage};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::debug;

/// Outbound side of one connection
struct Subscriber {
    tx: mpsc::UnboundedSender<String>,
    room_id: Option<String>,
}

#[derive(Default)]
pub struct Hub {
    subscribers: RwLock<HashMap<String, Subscriber>>,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection's outbound channel
    pub fn connect(&self, conn_id: &str, tx: mpsc::UnboundedSender<String>) {
        self.subscribers
            .write()
            .insert(conn_id.to_string(), Subscriber { tx, room_id: None });
    }

    /// Subscribe a connection to a room's events, leaving any previous room
    pub fn join(&self, conn_id: &str, room_id: &str) -> bool {
        match self.subscribers.write().get_mut(conn_id) {
            Some(sub) => {
                sub.room_id = Some(room_id.to_string());
                true
            }
            None => false,
        }
    }

    /// Forget a connection. Returns the room it was in.
    pub fn disconnect(&self, conn_id: &str) -> Option<String> {
        self.subscribers.write().remove(conn_id).and_then(|s| s.room_id)
    }

    pub fn room_size(&self, room_id: &str) -> usize {
        self.subscribers
            .read()
            .values()
            .filter(|s| s.room_id.as_deref() == Some(room_id))
            .count()
    }

    /// Queue a line for one connection
    pub fn send_to(&self, conn_id: &str, line: String) -> bool {
        self.subscribers
            .read()
            .get(conn_id)
            .is_some_and(|s| s.tx.send(line).is_ok())
    }
}

impl Broadcaster for Hub {
    fn publish(&self, room_id: &str, event: &RoomEvent) -> Result<(), PublishError> {
        let message = ServerMessage::Event {
            room_id: room_id.to_string(),
            event: event.clone(),
        };
        let line = serde_json::to_string(&message).map_err(|e| PublishError::Other(e.to_string()))?;

        let subscribers = self.subscribers.read();
        let mut members = 0;
        let mut delivered = 0;
        for sub in subscribers.values().filter(|s| s.room_id.as_deref() == Some(room_id)) {
            members += 1;
            if sub.tx.send(line.clone()).is_ok() {
                delivered += 1;
            }
        }

        if members == 0 {
            return Err(PublishError::NoSubscribers(room_id.to_string()));
        }
        if delivered == 0 {
            return Err(PublishError::ChannelClosed);
        }
        debug!("Published to {}/{} connections in {}", delivered, members, room_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use buzzer_core::round::ResetReason;

    fn reset() -> RoomEvent {
        RoomEvent::RoundReset {
            reason: ResetReason::Admin,
        }
    }

    #[test]
    fn test_publish_reaches_room_only() {
        let hub = Hub::new();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        hub.connect("c1", tx1);
        hub.connect("c2", tx2);
        hub.join("c1", "quiz");
        hub.join("c2", "other");

        hub.publish("quiz", &reset()).unwrap();
        let line = rx1.try_recv().unwrap();
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["type"], "event");
        assert_eq!(value["roomId"], "quiz");
        assert_eq!(value["event"]["type"], "roundReset");
        assert!(rx2.try_recv().is_err());
    }

    #[test]
    fn test_publish_errors() {
        let hub = Hub::new();
        assert_eq!(
            hub.publish("empty", &reset()),
            Err(PublishError::NoSubscribers("empty".to_string()))
        );

        let (tx, rx) = mpsc::unbounded_channel();
        hub.connect("c1", tx);
        hub.join("c1", "quiz");
        drop(rx);
        assert_eq!(hub.publish("quiz", &reset()), Err(PublishError::ChannelClosed));
    }

    #[test]
    fn test_disconnect_returns_room() {
        let hub = Hub::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        hub.connect("c1", tx);
        assert!(hub.join("c1", "quiz"));
        assert_eq!(hub.room_size("quiz"), 1);
        assert_eq!(hub.disconnect("c1"), Some("quiz".to_string()));
        assert_eq!(hub.room_size("quiz"), 0);
        assert!(!hub.join("c1", "quiz"));
    }
}
