//! Fan-out of [`GatewayEvent`]s from running turns to chat surfaces.
//!
//! Turns publish without knowing who renders them. A surface that falls more
//! than `BUS_CAPACITY` events behind gets `RecvError::Lagged` and skips ahead.

use tokio::sync::broadcast;
use tracing::trace;

use tc_types::event::GatewayEvent;

const BUS_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<GatewayEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(BUS_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.sender.subscribe()
    }

    /// Publish to every current subscriber and return how many there were.
    pub fn send(&self, event: GatewayEvent) -> usize {
        match self.sender.send(event) {
            Ok(receivers) => receivers,
            Err(broadcast::error::SendError(event)) => {
                trace!("Nobody listening for events of session {:?}", event.session_id());
                0
            }
        }
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
    use tokio::sync::broadcast::error::RecvError;
    use uuid::Uuid;

    #[tokio::test]
    async fn subscribers_see_events_in_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let id = Uuid::new_v4();

        assert_eq!(bus.send(GatewayEvent::TurnStarted { session_id: id, user_id: 7 }), 1);
        bus.send(GatewayEvent::TurnFinished { session_id: id });

        assert!(matches!(rx.recv().await, Ok(GatewayEvent::TurnStarted { user_id: 7, .. })));
        assert!(matches!(rx.recv().await, Ok(GatewayEvent::TurnFinished { .. })));
    }

    #[test]
    fn events_without_subscribers_are_dropped() {
        let bus = EventBus::default();
        let sent = bus.send(GatewayEvent::Error {
            session_id: None,
            message: "nobody home".into(),
        });
        assert_eq!(sent, 0);
    }

    #[tokio::test]
    async fn slow_subscriber_lags_then_catches_up() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let id = Uuid::new_v4();

        for i in 0..BUS_CAPACITY + 10 {
            bus.send(GatewayEvent::TextDelta { session_id: id, content: i.to_string() });
        }

        assert!(matches!(rx.recv().await, Err(RecvError::Lagged(10))));
        match rx.recv().await {
            Ok(GatewayEvent::TextDelta { content, .. }) => assert_eq!(content, "10"),
            other => panic!("unexpected {other:?}"),
        }
    }
}
