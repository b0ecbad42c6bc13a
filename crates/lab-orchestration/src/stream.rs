//! Outbound lab event stream
//!
//! Provisioning results are pushed to the platform through one bounded
//! buffer. When nobody drains it, the oldest event is dropped to make room
//! for the newest one, so the backlog never grows past the configured size.

use crate::api::LabDescriptor;
use async_channel::{Receiver, Sender};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

/// Event pushed to subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LabEvent {
    /// A lab finished provisioning and is registered
    LabReady(LabDescriptor),
    /// A queued lab creation failed
    LabFailed {
        /// Owning event tag
        event_tag: String,
        /// Failure description
        reason: String,
    },
    /// An environment finished its setup
    EnvironmentReady {
        /// Event tag
        event_tag: String,
    },
    /// An environment setup failed; the environment is being closed
    EnvironmentFailed {
        /// Event tag
        event_tag: String,
        /// Failure description
        reason: String,
    },
}

impl LabEvent {
    /// Event tag the event belongs to
    pub fn event_tag(&self) -> &str {
        match self {
            LabEvent::LabReady(descriptor) => &descriptor.event_tag,
            LabEvent::LabFailed { event_tag, .. }
            | LabEvent::EnvironmentReady { event_tag }
            | LabEvent::EnvironmentFailed { event_tag, .. } => event_tag,
        }
    }
}

/// Bounded drop-oldest event buffer
pub struct LabStream {
    tx: Sender<LabEvent>,
    rx: Receiver<LabEvent>,
    dropped: AtomicU64,
}

impl LabStream {
    /// Create a stream buffering at most `capacity` events
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = async_channel::bounded(capacity.max(1));
        Self {
            tx,
            rx,
            dropped: AtomicU64::new(0),
        }
    }

    /// Push an event, evicting the oldest one if the buffer is full
    pub fn publish(&self, event: LabEvent) {
        debug!("Publishing {} event for {}", event_kind(&event), event.event_tag());
        match self.tx.force_send(event) {
            Ok(None) => {}
            Ok(Some(evicted)) => {
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    "Lab stream full, dropped oldest event for {} ({} dropped so far)",
                    evicted.event_tag(),
                    total
                );
            }
            // The stream keeps its own receiver, so the channel never closes
            Err(_) => {}
        }
    }

    /// Receiver for the stream
    ///
    /// Subscribers share one buffer; each event goes to exactly one of them.
    pub fn subscribe(&self) -> Receiver<LabEvent> {
        self.rx.clone()
    }

    /// Events currently buffered
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// Whether nothing is buffered
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Events evicted since creation
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

fn event_kind(event: &LabEvent) -> &'static str {
    match event {
        LabEvent::LabReady(_) => "lab_ready",
        LabEvent::LabFailed { .. } => "lab_failed",
        LabEvent::EnvironmentReady { .. } => "environment_ready",
        LabEvent::EnvironmentFailed { .. } => "environment_failed",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready(tag: &str) -> LabEvent {
        LabEvent::EnvironmentReady {
            event_tag: tag.to_string(),
        }
    }

    #[smol_potat::test]
    async fn test_events_delivered_in_order() {
        let stream = LabStream::new(4);
        let rx = stream.subscribe();

        stream.publish(ready("a"));
        stream.publish(ready("b"));

        assert_eq!(rx.recv().await.unwrap(), ready("a"));
        assert_eq!(rx.recv().await.unwrap(), ready("b"));
        assert!(stream.is_empty());
    }

    #[smol_potat::test]
    async fn test_full_buffer_drops_oldest() {
        let stream = LabStream::new(2);

        stream.publish(ready("a"));
        stream.publish(ready("b"));
        stream.publish(ready("c"));

        assert_eq!(stream.len(), 2);
        assert_eq!(stream.dropped(), 1);
        let rx = stream.subscribe();
        assert_eq!(rx.recv().await.unwrap(), ready("b"));
        assert_eq!(rx.recv().await.unwrap(), ready("c"));
    }

    #[test]
    fn test_event_json_shape() {
        let event = LabEvent::LabFailed {
            event_tag: "spring".to_string(),
            reason: "no capacity".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "lab_failed");
        assert_eq!(json["event_tag"], "spring");
    }
}
