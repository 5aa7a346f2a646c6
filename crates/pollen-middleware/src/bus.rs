//! Headless, typed, topic-based publish/subscribe event bus.
//!
//! Uses [`tokio::sync::broadcast`] channels under the hood so that every
//! subscriber receives every message without any single subscriber blocking
//! the others.
//!
//! # Topics
//!
//! | Topic | Typical traffic |
//! |---|---|
//! | [`Topic::Telemetry`] | Raw controller lines, status snapshots |
//! | [`Topic::Actuation`] | Outcomes of pollination strokes dispatched in the background |
//! | [`Topic::SystemAlerts`] | Link state changes and transport faults |
//!
//! Every event published to a topic is also mirrored onto a firehose
//! channel ([`EventBus::subscribe`]) for consumers that want everything,
//! such as the cockpit WebSocket bridge.

use pollen_types::Event;
use tokio::sync::broadcast;
use tracing::trace;

/// Events buffered per lane before the slowest subscriber starts lagging.
const DEFAULT_CAPACITY: usize = 256;

/// Routing lanes on the event bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Telemetry,
    Actuation,
    SystemAlerts,
}

impl Topic {
    pub const ALL: [Topic; 3] = [Topic::Telemetry, Topic::Actuation, Topic::SystemAlerts];

    fn lane(self) -> usize {
        match self {
            Topic::Telemetry => 0,
            Topic::Actuation => 1,
            Topic::SystemAlerts => 2,
        }
    }
}

/// Cheap to clone; clones share the same lanes.
#[derive(Clone, Debug)]
pub struct EventBus {
    firehose: broadcast::Sender<Event>,
    lanes: [broadcast::Sender<Event>; 3],
}

impl EventBus {
    /// `capacity` applies to the firehose and to each topic lane.
    pub fn new(capacity: usize) -> Self {
        Self {
            firehose: broadcast::channel(capacity).0,
            lanes: std::array::from_fn(|_| broadcast::channel(capacity).0),
        }
    }

    /// Publish `event` on `topic` and mirror it onto the firehose.
    ///
    /// Returns how many topic subscribers received it.  Zero is the normal
    /// state when no client is attached.
    pub fn publish_to(&self, topic: Topic, event: Event) -> usize {
        let _ = self.firehose.send(event.clone());
        self.lanes[topic.lane()].send(event).unwrap_or_else(|dropped| {
            trace!(?topic, event_id = %dropped.0.id, "no subscribers on topic");
            0
        })
    }

    pub fn subscribe_to(&self, topic: Topic) -> TopicReceiver {
        TopicReceiver {
            topic,
            receiver: self.lanes[topic.lane()].subscribe(),
        }
    }

    /// Every event regardless of topic, in publish order.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.firehose.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// An async receiver bound to a single [`Topic`] channel.
///
/// Obtained via [`EventBus::subscribe_to`].
pub struct TopicReceiver {
    topic: Topic,
    receiver: broadcast::Receiver<Event>,
}

impl TopicReceiver {
    /// Wait for the next event on this topic.
    ///
    /// `Err(Lagged(n))` means the subscriber fell behind and `n` events were
    /// dropped; `Err(Closed)` means the bus has shut down.
    pub async fn recv(&mut self) -> Result<Event, broadcast::error::RecvError> {
        self.receiver.recv().await
    }

    /// Non-blocking variant of [`recv`][Self::recv].
    pub fn try_recv(&mut self) -> Result<Event, broadcast::error::TryRecvError> {
        self.receiver.try_recv()
    }

    /// The [`Topic`] this receiver is bound to.
    pub fn topic(&self) -> Topic {
        self.topic
    }
}
