use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::events::EngineEvent;

/// Broadcast bus carrying engine events to persistence/notification
/// subscribers. Publishing never fails the caller: with no subscribers the
/// event is dropped and logged at debug, matching the fire-and-forget
/// contract.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1024);
        debug!("EventBus initialized with capacity: 1024");
        Self { tx }
    }

    pub fn publish(&self, event: EngineEvent) {
        let name = event.name();
        match self.tx.send(event) {
            Ok(subscriber_count) => {
                debug!(event = name, subscriber_count, "Published engine event");
            }
            Err(_) => {
                // No live subscribers; the engine must keep trading anyway.
                debug!(event = name, "Engine event dropped, no subscribers");
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    /// Emit an operator-facing alert. Used by the kill switch and the
    /// fatal-error escalation path.
    pub fn alert(&self, message: &str) {
        warn!(message, "Operator alert");
        self.publish(EngineEvent::OperatorAlert {
            message: message.to_string(),
            timestamp: chrono::Utc::now(),
        });
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_subscriber() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish(EngineEvent::CacheInvalidated {
            symbol: "SOL".into(),
            timestamp: chrono::Utc::now(),
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.name(), "cache_invalidated");
    }

    #[tokio::test]
    async fn publish_without_subscribers_does_not_panic() {
        let bus = EventBus::new();
        bus.publish(EngineEvent::OperatorAlert {
            message: "test".into(),
            timestamp: chrono::Utc::now(),
        });
    }
}
