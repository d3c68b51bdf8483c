//! Typed, topic-based publish/subscribe event bus.
//!
//! Uses [`tokio::sync::broadcast`] channels so that every subscriber receives
//! every message without a slow subscriber blocking the publisher.
//!
//! # Topics
//!
//! | Topic | Typical traffic |
//! |---|---|
//! | [`Topic::Telemetry`] | Telemetry and watchdog health snapshots |
//! | [`Topic::CommandStatus`] | Rejected and failed commands, LED echoes |
//! | [`Topic::SystemAlerts`] | Estop latched / cleared |
//!
//! Publishing never fails. With nobody listening the event is dropped and
//! [`EventBus::publish_to`] reports zero receivers.
//!
//! # Example
//!
//! ```
//! use rollbot_middleware::{EventBus, Topic};
//! use rollbot_types::{Event, EventPayload};
//!
//! let bus = EventBus::default();
//! let mut alerts = bus.subscribe_to(Topic::SystemAlerts);
//!
//! bus.publish_to(Topic::SystemAlerts, Event::new("test", EventPayload::EstopCleared));
//! assert!(matches!(alerts.try_recv(), Some(ev) if ev.payload == EventPayload::EstopCleared));
//! ```

use rollbot_types::Event;
use tokio::sync::broadcast;
use tracing::{trace, warn};

/// Number of buffered events per topic before slow subscribers start lagging.
const DEFAULT_CAPACITY: usize = 256;

/// Routing lanes on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Periodic telemetry and health snapshots.
    Telemetry,
    /// Per-command outcomes that the caller did not already see as a return
    /// value: rejections, failures of submitted work, LED echoes.
    CommandStatus,
    /// Safety-relevant state changes.
    SystemAlerts,
}

/// Shared event bus. Clones are cheap and share the underlying channels.
#[derive(Clone, Debug)]
pub struct EventBus {
    telemetry: broadcast::Sender<Event>,
    command_status: broadcast::Sender<Event>,
    system_alerts: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a bus whose topic channels each buffer `capacity` events.
    ///
    /// # Panics
    ///
    /// If `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        let (telemetry, _) = broadcast::channel(capacity);
        let (command_status, _) = broadcast::channel(capacity);
        let (system_alerts, _) = broadcast::channel(capacity);
        Self {
            telemetry,
            command_status,
            system_alerts,
        }
    }

    /// Publish `event` on `topic`. Returns how many subscribers were handed it.
    pub fn publish_to(&self, topic: Topic, event: Event) -> usize {
        match self.sender(topic).send(event) {
            Ok(n) => n,
            Err(broadcast::error::SendError(ev)) => {
                trace!(?topic, source = %ev.source, "no subscribers, event dropped");
                0
            }
        }
    }

    pub fn subscribe_to(&self, topic: Topic) -> TopicReceiver {
        TopicReceiver {
            topic,
            receiver: self.sender(topic).subscribe(),
        }
    }

    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.sender(topic).receiver_count()
    }

    fn sender(&self, topic: Topic) -> &broadcast::Sender<Event> {
        match topic {
            Topic::Telemetry => &self.telemetry,
            Topic::CommandStatus => &self.command_status,
            Topic::SystemAlerts => &self.system_alerts,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Topic-bound receiver
// ---------------------------------------------------------------------------

/// A receiver bound to a single [`Topic`]. Obtained via
/// [`EventBus::subscribe_to`].
pub struct TopicReceiver {
    topic: Topic,
    receiver: broadcast::Receiver<Event>,
}

impl TopicReceiver {
    /// Wait for the next event on this topic.
    ///
    /// Lagging is logged and skipped over. Returns `None` once the bus is
    /// gone.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(topic = ?self.topic, lagged_by = n, "subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking receive for callers outside an async context. Returns
    /// `None` when nothing is buffered.
    pub fn try_recv(&mut self) -> Option<Event> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    warn!(topic = ?self.topic, lagged_by = n, "subscriber lagged");
                }
                Err(_) => return None,
            }
        }
    }

    /// Drain everything currently buffered.
    pub fn drain(&mut self) -> Vec<Event> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }

    pub fn topic(&self) -> Topic {
        self.topic
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollbot_types::{EventPayload, Rgb};
    use std::time::Duration;

    fn make_event(source: &str) -> Event {
        Event::new(source, EventPayload::LedChanged(Rgb::new(1, 2, 3)))
    }

    #[test]
    fn publish_without_subscribers_is_not_an_error() {
        let bus = EventBus::default();
        assert_eq!(bus.publish_to(Topic::Telemetry, make_event("test")), 0);
    }

    #[tokio::test]
    async fn multiple_subscribers_receive_same_event() {
        let bus = EventBus::default();
        let mut a = bus.subscribe_to(Topic::CommandStatus);
        let mut b = bus.subscribe_to(Topic::CommandStatus);
        assert_eq!(bus.subscriber_count(Topic::CommandStatus), 2);

        let event = make_event("dispatcher");
        assert_eq!(bus.publish_to(Topic::CommandStatus, event.clone()), 2);

        assert_eq!(a.recv().await.map(|e| e.id), Some(event.id));
        assert_eq!(b.recv().await.map(|e| e.id), Some(event.id));
    }

    #[tokio::test]
    async fn topics_are_isolated() {
        let bus = EventBus::default();
        let mut alerts = bus.subscribe_to(Topic::SystemAlerts);
        let _telemetry = bus.subscribe_to(Topic::Telemetry);

        bus.publish_to(Topic::Telemetry, make_event("watchdog"));

        let result = tokio::time::timeout(Duration::from_millis(50), alerts.recv()).await;
        assert!(result.is_err(), "alerts must not see telemetry");
        assert_eq!(alerts.topic(), Topic::SystemAlerts);
    }

    #[test]
    fn lagging_subscriber_skips_to_newest() {
        let bus = EventBus::new(4);
        let mut slow = bus.subscribe_to(Topic::Telemetry);
        for i in 0..10 {
            bus.publish_to(Topic::Telemetry, make_event(&format!("flood-{i}")));
        }
        let got = slow.drain();
        assert_eq!(got.len(), 4);
        assert_eq!(got[3].source, "flood-9");
    }

    #[test]
    fn drain_on_empty_topic_is_empty() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe_to(Topic::SystemAlerts);
        assert!(rx.drain().is_empty());
    }
}
