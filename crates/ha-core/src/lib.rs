//! Core types for Home Assistant recording
//!
//! Producers (entities, automations, integrations) describe what happened
//! with these types and hand them to the recorder: EntityId, State, Event
//! and Context.

mod context;
mod entity_id;
mod event;
mod state;

pub use context::Context;
pub use entity_id::{split_entity_id, EntityId, EntityIdError};
pub use event::{Event, EventData, EventOrigin, EventType};
pub use state::{Attributes, State};

/// Attribute key carrying the entity id in event data
pub const ATTR_ENTITY_ID: &str = "entity_id";

/// Standard event types the recorder treats specially
pub mod events {
    use super::*;

    /// Event type for state changes
    pub const STATE_CHANGED: &str = "state_changed";

    /// Event type for Home Assistant stop
    pub const HOMEASSISTANT_STOP: &str = "homeassistant_stop";

    /// Data for STATE_CHANGED events
    ///
    /// `new_state == None` means the entity was removed.
    #[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
    pub struct StateChangedData {
        pub entity_id: EntityId,
        #[serde(default)]
        pub old_state: Option<State>,
        #[serde(default)]
        pub new_state: Option<State>,
    }

    impl EventData for StateChangedData {
        fn event_type() -> &'static str {
            STATE_CHANGED
        }
    }
}
