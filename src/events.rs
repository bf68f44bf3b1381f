//! In-process event bus with typed variants.
//!
//! Cross-cutting consumers (sitemap warming, future auto-thread or
//! mark-solution reactions) subscribe independently; publishers never block
//! and do not care whether anyone is listening.

use tokio::sync::broadcast;

#[derive(Debug, Clone)]
pub enum Event {
    /// A single message was indexed from a live gateway event.
    MessageIndexed {
        server_id: String,
        channel_id: String,
        message_id: String,
    },
    /// One server finished its slice of an indexing run.
    ServerIndexed {
        server_id: String,
        messages: u64,
    },
    /// A whole indexing pass completed (successfully or best-effort).
    IndexRunCompleted {
        servers_indexed: usize,
        servers_failed: usize,
        messages: u64,
    },
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Fire-and-forget publish. A send error only means there are no
    /// subscribers right now.
    pub fn publish(&self, event: Event) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_and_subscribe() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.publish(Event::ServerIndexed {
            server_id: "g1".to_string(),
            messages: 12,
        });

        match rx.recv().await.unwrap() {
            Event::ServerIndexed { server_id, messages } => {
                assert_eq!(server_id, "g1");
                assert_eq!(messages, 12);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_publish_without_subscribers_is_fine() {
        let bus = EventBus::default();
        bus.publish(Event::IndexRunCompleted {
            servers_indexed: 0,
            servers_failed: 0,
            messages: 0,
        });
    }
}
