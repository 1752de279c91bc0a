//! Connection status events
//!
//! Provides the status event definitions and the [`StatusBus`] that carries
//! them to connectivity indicators. Request outcomes never travel over this
//! bus; they are delivered to the awaiting caller directly.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Lifecycle state of the shared connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum ConnectionState {
    /// Initial state, after a drop, and after an intentional close
    Disconnected,
    /// Transport open in progress
    Connecting,
    /// Transport open; requests may be sent
    Connected,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "Disconnected"),
            ConnectionState::Connecting => write!(f, "Connecting"),
            ConnectionState::Connected => write!(f, "Connected"),
        }
    }
}

/// Status events for connectivity indicators
///
/// Serialized with an internal `type` tag so a renderer can forward them
/// verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StatusEvent {
    /// Connection state transition
    StateChanged {
        old_state: ConnectionState,
        new_state: ConnectionState,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// A reconnect attempt was scheduled after a failure
    ReconnectScheduled {
        /// Consecutive failures so far (1-based)
        attempt: u32,
        /// Delay before the attempt starts
        delay_ms: u64,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Reconnection gave up; fires once per abandonment
    ///
    /// The connection stays `Disconnected` until a consumer asks for a
    /// manual reconnect or the consumer count goes through zero again.
    ReconnectAbandoned {
        /// Failures observed before giving up
        attempts: u32,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
}

impl StatusEvent {
    /// Get event type as string for filtering
    pub fn event_type(&self) -> &str {
        match self {
            StatusEvent::StateChanged { .. } => "StateChanged",
            StatusEvent::ReconnectScheduled { .. } => "ReconnectScheduled",
            StatusEvent::ReconnectAbandoned { .. } => "ReconnectAbandoned",
        }
    }
}

/// Fan-out of [`StatusEvent`]s to any number of subscribers
///
/// Uses tokio::broadcast internally:
/// - Publishing never blocks the connection task
/// - Subscribers that fall behind observe `Lagged` and skip ahead
/// - Dropped receivers are cleaned up automatically
#[derive(Clone)]
pub struct StatusBus {
    tx: broadcast::Sender<StatusEvent>,
    capacity: usize,
}

impl StatusBus {
    /// Creates a new bus buffering up to `capacity` events per subscriber
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    ///
    /// Events emitted before subscription are not received.
    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Err` if nobody is listening.
    #[allow(clippy::result_large_err)]
    pub fn emit(
        &self,
        event: StatusEvent,
    ) -> Result<usize, broadcast::error::SendError<StatusEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: StatusEvent) {
        let _ = self.tx.send(event);
    }

    /// Get the current number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Get the configured channel capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_bus_delivers_to_all_subscribers() {
        let bus = StatusBus::new(8);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        bus.emit(StatusEvent::ReconnectAbandoned {
            attempts: 5,
            timestamp: chrono::Utc::now(),
        })
        .expect("emit should succeed");

        assert_eq!(rx1.try_recv().unwrap().event_type(), "ReconnectAbandoned");
        assert_eq!(rx2.try_recv().unwrap().event_type(), "ReconnectAbandoned");
    }

    #[test]
    fn test_emit_without_subscribers() {
        let bus = StatusBus::new(4);
        let event = StatusEvent::StateChanged {
            old_state: ConnectionState::Disconnected,
            new_state: ConnectionState::Connecting,
            timestamp: chrono::Utc::now(),
        };
        assert!(bus.emit(event.clone()).is_err());
        bus.emit_lossy(event);
        assert_eq!(bus.capacity(), 4);
    }

    #[test]
    fn test_status_event_serializes_with_type_tag() {
        let event = StatusEvent::ReconnectScheduled {
            attempt: 2,
            delay_ms: 4000,
            timestamp: chrono::Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "ReconnectScheduled");
        assert_eq!(json["delay_ms"], 4000);
    }
}
