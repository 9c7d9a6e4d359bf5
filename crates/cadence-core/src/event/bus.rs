//! Engine event bus.
//!
//! The orchestrator owns one `EventBus` and hands clones to every run it
//! starts, static or adaptive. Each run publishes `RunStarted`, then level,
//! step and planner events, then `RunFinished`. Subscribers such as the
//! audit writer or a progress printer attach with `subscribe` before the run.
//!
//! Publishing never waits. With no subscribers an event is dropped, and a
//! subscriber that falls behind sees `Lagged` instead of stalling a level.
//! A receiver's stream ends (`RecvError::Closed`) once the orchestrator and
//! all its runners are dropped, which is how side tasks know a run is over.

use cadence_types::event::EngineEvent;
use tokio::sync::broadcast;

/// Fan-out of `EngineEvent`s from running queries to observers.
///
/// Clones share one channel; every clone keeps the stream open.
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    /// Create a new event bus with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Create a new subscriber that will receive all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    /// Publish an event to all current subscribers.
    ///
    /// If there are no subscribers, the event is silently dropped.
    pub fn publish(&self, event: EngineEvent) {
        let _ = self.sender.send(event);
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("receiver_count", &self.sender.receiver_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn sample_event() -> EngineEvent {
        EngineEvent::StepStarted {
            query_id: Uuid::now_v7(),
            step_id: "fetch".to_string(),
            capability: "retrieval/fetch".to_string(),
        }
    }

    #[tokio::test]
    async fn publish_and_subscribe_delivers_event() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.publish(sample_event());

        let received = rx.recv().await.unwrap();
        assert!(matches!(received, EngineEvent::StepStarted { .. }));
    }

    #[tokio::test]
    async fn multiple_subscribers_each_receive_event() {
        let bus = EventBus::new(16);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.publish(sample_event());

        assert!(matches!(rx1.recv().await.unwrap(), EngineEvent::StepStarted { .. }));
        assert!(matches!(rx2.recv().await.unwrap(), EngineEvent::StepStarted { .. }));
    }

    #[test]
    fn publish_with_no_subscribers_does_not_panic() {
        let bus = EventBus::new(16);
        bus.publish(sample_event());
        bus.publish(sample_event());
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn slow_subscriber_never_blocks_publisher() {
        let bus = EventBus::new(4);
        let mut rx = bus.subscribe();

        // Far more events than capacity; publish must return immediately.
        for _ in 0..100 {
            bus.publish(sample_event());
        }

        match rx.try_recv() {
            Err(broadcast::error::TryRecvError::Lagged(n)) => assert!(n > 0),
            other => panic!("expected lag, got {other:?}"),
        }
    }

    #[test]
    fn clone_shares_channel() {
        let bus = EventBus::new(16);
        let bus2 = bus.clone();
        let mut rx = bus.subscribe();

        bus2.publish(sample_event());

        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn stream_closes_after_last_clone_drops() {
        let bus = EventBus::default();
        let runner_bus = bus.clone();
        let mut rx = bus.subscribe();

        drop(bus);
        runner_bus.publish(sample_event());
        assert!(rx.recv().await.is_ok());

        drop(runner_bus);
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let bus = EventBus::new(0);
        let mut rx = bus.subscribe();
        bus.publish(sample_event());
        assert!(rx.try_recv().is_ok());
        assert!(format!("{bus:?}").contains("receiver_count: 1"));
    }
}
