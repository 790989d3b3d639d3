//! State type representing an entity's value at a point in time

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::{Context, EntityId};

/// Attribute map, kept sorted by key so that serialization is canonical
pub type Attributes = Map<String, Value>;

/// Represents the state of an entity at a point in time
///
/// Attributes live in a key-sorted map: two states carrying the same
/// attributes serialize to the same bytes regardless of insertion order,
/// which is what lets the recorder store identical attribute sets once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct State {
    pub entity_id: EntityId,

    /// The state value (e.g., "on", "off", "23.5", "unavailable")
    pub state: String,

    #[serde(default)]
    pub attributes: Attributes,

    /// When the state value last changed
    #[serde(default = "Utc::now")]
    pub last_changed: DateTime<Utc>,

    /// When the state or attributes were last written
    #[serde(default = "Utc::now")]
    pub last_updated: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reported: Option<DateTime<Utc>>,

    #[serde(default)]
    pub context: Context,
}

impl State {
    /// Create a new state with current timestamp
    pub fn new(
        entity_id: EntityId,
        state: impl Into<String>,
        attributes: Attributes,
        context: Context,
    ) -> Self {
        let now = Utc::now();
        Self {
            entity_id,
            state: state.into(),
            attributes,
            last_changed: now,
            last_updated: now,
            last_reported: None,
            context,
        }
    }

    /// Set `last_changed`/`last_updated` to the given time
    pub fn at(mut self, when: DateTime<Utc>) -> Self {
        self.last_changed = when;
        self.last_updated = when;
        self
    }

    /// Set an attribute from any serializable value.
    ///
    /// A value that cannot be represented as JSON is replaced with a
    /// placeholder string so the rest of the state is still recorded.
    pub fn with_attribute<V: Serialize>(mut self, key: impl Into<String>, value: V) -> Self {
        let key = key.into();
        let value = match serde_json::to_value(&value) {
            Ok(value) => value,
            Err(err) => {
                warn!(
                    entity_id = %self.entity_id,
                    attribute = %key,
                    error = %err,
                    "Attribute is not JSON serializable, storing placeholder"
                );
                Value::String(format!("<unserializable {}>", std::any::type_name::<V>()))
            }
        };
        self.attributes.insert(key, value);
        self
    }

    /// Get an attribute value by key
    pub fn attribute<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.attributes
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Numeric value of the state, if it parses as a finite float
    pub fn as_f64(&self) -> Option<f64> {
        self.state.parse::<f64>().ok().filter(|v| v.is_finite())
    }
}

impl PartialEq for State {
    fn eq(&self, other: &Self) -> bool {
        // Timestamps and context are not compared
        self.entity_id == other.entity_id
            && self.state == other.state
            && self.attributes == other.attributes
    }
}
