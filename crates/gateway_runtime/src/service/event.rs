//! Service Events
//!
//! Events carry notifications between gateway services, e.g. a discovery
//! sweep announcing a new device to the object enumerator.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use wildmatch::WildMatch;

use super::ServiceResult;

// ─────────────────────────────────────────────────────────────────────────────
// Event
// ─────────────────────────────────────────────────────────────────────────────

/// A notification published on the runtime's event bus
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Event type (e.g. "device/discovered", "device/enabled")
    pub event_type: String,

    /// Service that generated the event
    pub source: String,

    pub data: serde_json::Value,

    /// Creation time (Unix milliseconds)
    pub timestamp: u64,
}

impl Event {
    pub fn new(
        event_type: impl Into<String>,
        source: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            source: source.into(),
            data,
            timestamp: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
        }
    }

    /// Check if this event matches a subscription pattern
    ///
    /// `*` matches everything, `device/*` matches `device/discovered` but not
    /// `device`, anything else is a glob over the whole event type.
    pub fn matches(&self, pattern: &str) -> bool {
        if pattern == "*" {
            return true;
        }
        WildMatch::new(pattern).matches(&self.event_type)
    }

    /// Deserialize the event data to a specific type
    pub fn parse_data<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.data.clone())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Event Publisher
// ─────────────────────────────────────────────────────────────────────────────

/// A cloneable handle for publishing events
#[derive(Clone)]
pub struct EventPublisher {
    tx: broadcast::Sender<Event>,
}

impl EventPublisher {
    pub fn new(tx: broadcast::Sender<Event>) -> Self {
        Self { tx }
    }

    /// Publish an event, returning how many services received it.
    ///
    /// Publishing with no live subscriber is not an error; events are
    /// notifications, not commands.
    pub fn publish(&self, event: Event) -> ServiceResult<usize> {
        Ok(self.tx.send(event).unwrap_or(0))
    }

    /// Create and publish an event
    pub fn emit(
        &self,
        event_type: impl Into<String>,
        source: impl Into<String>,
        data: serde_json::Value,
    ) -> ServiceResult<()> {
        self.publish(Event::new(event_type, source, data)).map(|_| ())
    }

    /// Subscribe to every event published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}
