//! Admin services: `recorder.purge`, `recorder.purge_entities`,
//! `recorder.enable` and `recorder.disable`

use ha_core::EntityId;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use tracing::{info, instrument};

use crate::config::string_or_list;
use crate::error::{ServiceError, ServiceResult};
use crate::filters::EntityFilter;
use crate::recorder::Recorder;

pub const SERVICE_PURGE: &str = "purge";
pub const SERVICE_PURGE_ENTITIES: &str = "purge_entities";
pub const SERVICE_ENABLE: &str = "enable";
pub const SERVICE_DISABLE: &str = "disable";

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct PurgeData {
    #[serde(default)]
    keep_days: Option<u32>,
    #[serde(default)]
    repack: bool,
    #[serde(default)]
    apply_filter: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct PurgeEntitiesData {
    #[serde(default, deserialize_with = "string_or_list")]
    entity_id: Vec<String>,
    #[serde(default, deserialize_with = "string_or_list")]
    domains: Vec<String>,
    #[serde(default, deserialize_with = "string_or_list")]
    entity_globs: Vec<String>,
    #[serde(default)]
    keep_days: u32,
}

fn parse<T: DeserializeOwned + Default>(service: &str, data: &Value) -> ServiceResult<T> {
    if data.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(data.clone()).map_err(|e| ServiceError::InvalidData {
        service: service.to_string(),
        reason: e.to_string(),
    })
}

impl Recorder {
    /// Handle a `recorder.<service>` call
    #[instrument(skip(self, data))]
    pub fn call_service(&self, service: &str, data: &Value) -> ServiceResult<()> {
        if !self.is_running() {
            return Err(ServiceError::NotRunning);
        }
        let queued = match service {
            SERVICE_PURGE => {
                let data: PurgeData = parse(service, data)?;
                let keep_days = data.keep_days.unwrap_or(self.config().keep_days);
                info!(keep_days, repack = data.repack, apply_filter = data.apply_filter, "Purge requested");
                self.purge(keep_days, data.repack, data.apply_filter)
            }
            SERVICE_PURGE_ENTITIES => {
                let data: PurgeEntitiesData = parse(service, data)?;
                let invalid = |reason: String| ServiceError::InvalidData {
                    service: service.to_string(),
                    reason,
                };
                if data.entity_id.is_empty() && data.domains.is_empty() && data.entity_globs.is_empty() {
                    return Err(invalid(
                        "at least one of entity_id, domains or entity_globs is required".to_string(),
                    ));
                }
                for entity_id in &data.entity_id {
                    entity_id
                        .parse::<EntityId>()
                        .map_err(|e| invalid(format!("{entity_id}: {e}")))?;
                }
                let filter = EntityFilter::matching(&data.entity_id, &data.domains, &data.entity_globs)
                    .map_err(|e| invalid(e.to_string()))?;
                self.purge_entities(filter, data.keep_days)
            }
            SERVICE_ENABLE => {
                self.enable();
                true
            }
            SERVICE_DISABLE => {
                self.disable();
                true
            }
            other => return Err(ServiceError::UnknownService(other.to_string())),
        };
        if queued {
            Ok(())
        } else {
            Err(ServiceError::NotRunning)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_purge_data_defaults() {
        let data: PurgeData = parse(SERVICE_PURGE, &Value::Null).unwrap();
        assert_eq!(data.keep_days, None);
        assert!(!data.repack);

        let data: PurgeData = parse(SERVICE_PURGE, &json!({"keep_days": 3, "repack": true})).unwrap();
        assert_eq!(data.keep_days, Some(3));
        assert!(data.repack);
    }

    #[test]
    fn test_purge_data_rejects_unknown_keys() {
        let result: ServiceResult<PurgeData> = parse(SERVICE_PURGE, &json!({"days": 3}));
        assert!(matches!(result, Err(ServiceError::InvalidData { .. })));
    }

    #[test]
    fn test_purge_entities_accepts_string_or_list() {
        let data: PurgeEntitiesData = parse(
            SERVICE_PURGE_ENTITIES,
            &json!({"entity_id": "sensor.a", "domains": ["light", "switch"]}),
        )
        .unwrap();
        assert_eq!(data.entity_id, vec!["sensor.a"]);
        assert_eq!(data.domains, vec!["light", "switch"]);
        assert_eq!(data.keep_days, 0);
    }
}
