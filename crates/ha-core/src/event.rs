//! Events handed to the recorder

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Context;

/// Typed event payloads
pub trait EventData: Clone + Send + Sync + 'static {
    /// The event type string for this data type
    fn event_type() -> &'static str;
}

/// Event type identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventType(String);

impl EventType {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self(event_type.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for EventType {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for EventType {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl PartialEq<str> for EventType {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Something that happened, as seen by the recorder
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event<T = serde_json::Value> {
    pub event_type: EventType,

    pub data: T,

    #[serde(default)]
    pub origin: EventOrigin,

    #[serde(default = "Utc::now")]
    pub time_fired: DateTime<Utc>,

    #[serde(default)]
    pub context: Context,
}

impl<T> Event<T> {
    /// Create a new event fired now
    pub fn new(event_type: impl Into<EventType>, data: T, context: Context) -> Self {
        Self {
            event_type: event_type.into(),
            data,
            origin: EventOrigin::Local,
            time_fired: Utc::now(),
            context,
        }
    }

    pub fn with_origin(mut self, origin: EventOrigin) -> Self {
        self.origin = origin;
        self
    }

    /// Override the firing time (replays and tests)
    pub fn fired_at(mut self, time_fired: DateTime<Utc>) -> Self {
        self.time_fired = time_fired;
        self
    }
}

impl<T: EventData + Serialize> Event<T> {
    /// Create a typed event from EventData
    pub fn typed(data: T, context: Context) -> Self {
        Self::new(T::event_type(), data, context)
    }

    /// Erase the payload type so the event can be queued for recording
    pub fn into_untyped(self) -> Result<Event, serde_json::Error> {
        Ok(Event {
            event_type: self.event_type,
            data: serde_json::to_value(self.data)?,
            origin: self.origin,
            time_fired: self.time_fired,
            context: self.context,
        })
    }
}

/// Origin of an event
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventOrigin {
    #[default]
    Local,
    Remote,
}

impl EventOrigin {
    /// Index stored in the `origin_idx` column
    pub fn index(self) -> i64 {
        match self {
            EventOrigin::Local => 0,
            EventOrigin::Remote => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::StateChangedData;
    use crate::{EntityId, State};

    #[test]
    fn test_typed_event_into_untyped() {
        let entity_id: EntityId = "sensor.x".parse().unwrap();
        let data = StateChangedData {
            entity_id: entity_id.clone(),
            old_state: None,
            new_state: Some(State::new(entity_id, "1", Default::default(), Context::new())),
        };
        let event = Event::typed(data, Context::new()).into_untyped().unwrap();
        assert_eq!(event.event_type.as_str(), "state_changed");
        assert_eq!(event.data["entity_id"], "sensor.x");
        assert_eq!(event.data["new_state"]["state"], "1");
    }

    #[test]
    fn test_deserialize_minimal_event() {
        let event: Event = serde_json::from_str(r#"{"event_type":"foo","data":{"a":1}}"#).unwrap();
        assert_eq!(event.event_type.as_str(), "foo");
        assert_eq!(event.origin, EventOrigin::Local);
        assert_eq!(event.data["a"], 1);
    }
}
