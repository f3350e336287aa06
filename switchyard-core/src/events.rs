//! Real-time relay events for an external monitoring component
//!
//! Events go through a bounded queue. Emitting never waits: when the queue is
//! full the event is dropped and counted, so a slow subscriber cannot stall
//! routing.

use crate::channel::ChannelStatus;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

/// An observable relay event
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayEvent {
    ChannelSelected {
        request_id: String,
        channel_id: String,
        model: String,
        attempt: u32,
    },
    RelaySucceeded {
        request_id: String,
        channel_id: String,
        model: String,
        latency_ms: u64,
        attempts: u32,
        stream: bool,
    },
    RelayFailed {
        request_id: String,
        model: String,
        error_kind: String,
        reason: String,
        tried: Vec<String>,
    },
    ChannelStatusChanged {
        channel_id: String,
        from: ChannelStatus,
        to: ChannelStatus,
        reason: String,
    },
}

impl RelayEvent {
    pub fn name(&self) -> &'static str {
        match self {
            RelayEvent::ChannelSelected { .. } => "channel_selected",
            RelayEvent::RelaySucceeded { .. } => "relay_succeeded",
            RelayEvent::RelayFailed { .. } => "relay_failed",
            RelayEvent::ChannelStatusChanged { .. } => "channel_status_changed",
        }
    }
}

/// Sending half of the event queue
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: mpsc::Sender<RelayEvent>,
    dropped: Arc<AtomicU64>,
}

impl EventBus {
    /// Create a bus and the receiver the monitoring side drains
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<RelayEvent>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (
            Self {
                sender,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            receiver,
        )
    }

    /// Queue an event without waiting
    pub fn emit(&self, event: RelayEvent) {
        match self.sender.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    event = event.name(),
                    dropped, "Event queue full, dropping event"
                );
            }
            Err(TrySendError::Closed(event)) => {
                debug!(event = event.name(), "Event receiver gone, dropping event");
            }
        }
    }

    /// Events dropped because the queue was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn selected(n: u32) -> RelayEvent {
        RelayEvent::ChannelSelected {
            request_id: "r".to_string(),
            channel_id: "c".to_string(),
            model: "m".to_string(),
            attempt: n,
        }
    }

    #[tokio::test]
    async fn test_full_queue_drops_instead_of_blocking() {
        let (bus, mut rx) = EventBus::new(2);
        bus.emit(selected(1));
        bus.emit(selected(2));
        bus.emit(selected(3));

        assert_eq!(bus.dropped(), 1);
        assert_eq!(rx.recv().await, Some(selected(1)));
        assert_eq!(rx.recv().await, Some(selected(2)));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_closed_receiver_is_ignored() {
        let (bus, rx) = EventBus::new(4);
        drop(rx);
        bus.emit(selected(1));
        assert_eq!(bus.dropped(), 0);
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let json = serde_json::to_value(selected(1)).unwrap();
        assert_eq!(json["type"], "channel_selected");
        assert_eq!(json["attempt"], 1);
    }
}
