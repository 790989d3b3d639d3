//! Include/exclude filtering of entities and event types
//!
//! Entity filtering follows the Home Assistant precedence rules:
//!
//! 1. No filters: everything passes.
//! 2. Only includes: an entity passes if listed, in an included domain, or
//!    matching an included glob.
//! 3. Only excludes: an entity passes unless listed, in an excluded domain,
//!    or matching an excluded glob.
//! 4. Domain/glob includes (excludes may exist): listed entities pass;
//!    otherwise an entity passes if not listed as excluded and it matches an
//!    include glob, or sits in an included domain without matching an
//!    exclude glob.
//! 5. Domain/glob excludes without domain/glob includes: listed entities
//!    pass; otherwise an entity passes unless excluded by id, glob or domain.
//! 6. Otherwise only explicitly included entities pass.

use std::collections::HashSet;

use ha_core::{split_entity_id, Event, ATTR_ENTITY_ID};
use regex::Regex;
use serde_json::Value;

use crate::config::FilterConfig;
use crate::error::{ConfigError, ConfigResult};

/// Translate shell-style globs into one anchored alternation
fn globs_to_regex(globs: &[String]) -> ConfigResult<Option<Regex>> {
    if globs.is_empty() {
        return Ok(None);
    }
    let alternation = globs
        .iter()
        .map(|glob| {
            let mut pattern = String::with_capacity(glob.len() + 8);
            for c in glob.chars() {
                match c {
                    '*' => pattern.push_str(".*"),
                    '?' => pattern.push('.'),
                    other => pattern.push_str(&regex::escape(&other.to_string())),
                }
            }
            pattern
        })
        .collect::<Vec<_>>()
        .join("|");
    Regex::new(&format!("^(?:{alternation})$"))
        .map(Some)
        .map_err(|e| ConfigError::InvalidValue {
            key: "entity_globs".to_string(),
            reason: e.to_string(),
        })
}

#[derive(Debug, Clone, Default)]
struct Rules {
    entities: HashSet<String>,
    domains: HashSet<String>,
    globs: Option<Regex>,
}

impl Rules {
    fn from_config(config: &FilterConfig) -> ConfigResult<Self> {
        Ok(Self {
            entities: config.entities.iter().cloned().collect(),
            domains: config.domains.iter().cloned().collect(),
            globs: globs_to_regex(&config.entity_globs)?,
        })
    }

    fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.domains.is_empty() && self.globs.is_none()
    }

    fn has_domain_or_glob(&self) -> bool {
        !self.domains.is_empty() || self.globs.is_some()
    }

    fn glob_match(&self, entity_id: &str) -> bool {
        self.globs.as_ref().is_some_and(|re| re.is_match(entity_id))
    }

    fn matches(&self, entity_id: &str) -> bool {
        self.entities.contains(entity_id)
            || self.domains.contains(split_entity_id(entity_id).0)
            || self.glob_match(entity_id)
    }
}

/// Predicate over entity ids
#[derive(Debug, Clone, Default)]
pub struct EntityFilter {
    include: Rules,
    exclude: Rules,
}

impl EntityFilter {
    /// Build from `include:` / `exclude:` configuration
    pub fn new(include: &FilterConfig, exclude: &FilterConfig) -> ConfigResult<Self> {
        Ok(Self {
            include: Rules::from_config(include)?,
            exclude: Rules::from_config(exclude)?,
        })
    }

    /// Filter that accepts exactly the given entities, domains and globs
    pub fn matching(
        entity_ids: &[String],
        domains: &[String],
        entity_globs: &[String],
    ) -> ConfigResult<Self> {
        let include = FilterConfig {
            entities: entity_ids.to_vec(),
            domains: domains.to_vec(),
            entity_globs: entity_globs.to_vec(),
            event_types: Vec::new(),
        };
        Self::new(&include, &FilterConfig::default())
    }

    /// Filter with no rules
    pub fn is_empty(&self) -> bool {
        self.include.is_empty() && self.exclude.is_empty()
    }

    pub fn accepts(&self, entity_id: &str) -> bool {
        let include = &self.include;
        let exclude = &self.exclude;
        let domain = split_entity_id(entity_id).0;

        match (include.is_empty(), exclude.is_empty()) {
            (true, true) => true,
            (false, true) => include.matches(entity_id),
            (true, false) => !exclude.matches(entity_id),
            (false, false) if include.has_domain_or_glob() => {
                include.entities.contains(entity_id)
                    || (!exclude.entities.contains(entity_id)
                        && (include.glob_match(entity_id)
                            || (include.domains.contains(domain)
                                && !exclude.glob_match(entity_id))))
            }
            (false, false) if exclude.has_domain_or_glob() => {
                include.entities.contains(entity_id)
                    || (!exclude.entities.contains(entity_id)
                        && !exclude.glob_match(entity_id)
                        && !exclude.domains.contains(domain))
            }
            (false, false) => include.entities.contains(entity_id),
        }
    }
}

/// Decides which events reach the writer
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    entity_filter: Option<EntityFilter>,
    exclude_event_types: HashSet<String>,
}

impl EventFilter {
    pub fn new(include: &FilterConfig, exclude: &FilterConfig) -> ConfigResult<Self> {
        let entity_filter = EntityFilter::new(include, exclude)?;
        Ok(Self {
            entity_filter: (!entity_filter.is_empty()).then_some(entity_filter),
            exclude_event_types: exclude.event_types.iter().cloned().collect(),
        })
    }

    pub fn entity_filter(&self) -> Option<&EntityFilter> {
        self.entity_filter.as_ref()
    }

    pub fn excluded_event_types(&self) -> &HashSet<String> {
        &self.exclude_event_types
    }

    pub fn is_event_type_excluded(&self, event_type: &str) -> bool {
        self.exclude_event_types.contains(event_type)
    }

    /// Whether an entity's states are recorded
    pub fn accepts_entity(&self, entity_id: &str) -> bool {
        self.entity_filter
            .as_ref()
            .map_or(true, |filter| filter.accepts(entity_id))
    }

    /// Apply event-type exclusion, then the entity filter to the entity id(s)
    /// carried in the event data. Events without an entity id pass.
    pub fn should_record(&self, event: &Event) -> bool {
        if self.is_event_type_excluded(event.event_type.as_str()) {
            return false;
        }
        let Some(filter) = &self.entity_filter else {
            return true;
        };
        match event.data.get(ATTR_ENTITY_ID) {
            Some(Value::String(entity_id)) => filter.accepts(entity_id),
            Some(Value::Array(ids)) => ids
                .iter()
                .filter_map(Value::as_str)
                .any(|entity_id| filter.accepts(entity_id)),
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ha_core::Context;
    use serde_json::json;

    fn cfg(entities: &[&str], domains: &[&str], globs: &[&str]) -> FilterConfig {
        let own = |v: &[&str]| -> Vec<String> { v.iter().map(|s| s.to_string()).collect() };
        FilterConfig {
            entities: own(entities),
            domains: own(domains),
            entity_globs: own(globs),
            event_types: Vec::new(),
        }
    }

    #[test]
    fn test_no_filters_accepts_everything() {
        let filter = EntityFilter::default();
        assert!(filter.is_empty());
        assert!(filter.accepts("light.kitchen"));
    }

    #[test]
    fn test_include_only() {
        let filter = EntityFilter::new(
            &cfg(&["sensor.outside"], &["light"], &["binary_sensor.*_motion"]),
            &FilterConfig::default(),
        )
        .unwrap();
        assert!(filter.accepts("sensor.outside"));
        assert!(filter.accepts("light.kitchen"));
        assert!(filter.accepts("binary_sensor.hall_motion"));
        assert!(!filter.accepts("sensor.inside"));
        assert!(!filter.accepts("binary_sensor.door"));
    }

    #[test]
    fn test_exclude_only() {
        let filter = EntityFilter::new(
            &FilterConfig::default(),
            &cfg(&["sensor.noisy"], &["automation"], &["sensor.weather_*"]),
        )
        .unwrap();
        assert!(!filter.accepts("sensor.noisy"));
        assert!(!filter.accepts("automation.wake_up"));
        assert!(!filter.accepts("sensor.weather_temp"));
        assert!(filter.accepts("sensor.power"));
    }

    #[test]
    fn test_domain_include_with_glob_exclude() {
        let filter = EntityFilter::new(
            &cfg(&["sensor.weather_keep"], &["sensor"], &[]),
            &cfg(&["sensor.power"], &[], &["sensor.weather_*"]),
        )
        .unwrap();
        assert!(filter.accepts("sensor.temperature"));
        assert!(filter.accepts("sensor.weather_keep"));
        assert!(!filter.accepts("sensor.weather_wind"));
        assert!(!filter.accepts("sensor.power"));
        assert!(!filter.accepts("light.kitchen"));
    }

    #[test]
    fn test_entity_include_with_domain_exclude() {
        let filter = EntityFilter::new(
            &cfg(&["light.keep"], &[], &[]),
            &cfg(&[], &["light"], &[]),
        )
        .unwrap();
        assert!(filter.accepts("light.keep"));
        assert!(!filter.accepts("light.other"));
        assert!(filter.accepts("switch.any"));
    }

    #[test]
    fn test_entity_lists_only() {
        let filter = EntityFilter::new(
            &cfg(&["light.keep"], &[], &[]),
            &cfg(&["light.drop"], &[], &[]),
        )
        .unwrap();
        assert!(filter.accepts("light.keep"));
        assert!(!filter.accepts("light.drop"));
        assert!(!filter.accepts("switch.any"));
    }

    #[test]
    fn test_glob_escapes_regex_metacharacters() {
        let filter = EntityFilter::matching(&[], &[], &["sensor.a+b?".to_string()]).unwrap();
        assert!(filter.accepts("sensor.a+bc"));
        assert!(!filter.accepts("sensor.aabc"));
    }

    #[test]
    fn test_event_filter() {
        let mut exclude = cfg(&[], &["automation"], &[]);
        exclude.event_types = vec!["call_service".to_string()];
        let filter = EventFilter::new(&FilterConfig::default(), &exclude).unwrap();

        let event = |event_type: &str, data| Event::new(event_type, data, Context::new());
        assert!(!filter.should_record(&event("call_service", json!({}))));
        assert!(filter.should_record(&event("custom_event", json!({"a": 1}))));
        assert!(!filter.should_record(&event(
            "automation_triggered",
            json!({"entity_id": "automation.wake_up"})
        )));
        assert!(filter.should_record(&event(
            "custom_event",
            json!({"entity_id": ["automation.wake_up", "light.kitchen"]})
        )));
    }
}
