//! Topic Mapper
//!
//! Without an override a tuple publishes on
//! `{prefix}/{device_id}/{object_type}/{instance}/{property}`, with the object
//! type's hyphens turned into underscores. An enabled mapping for the
//! (device, object type, instance) replaces that topic for every property of
//! the object. Duplicate topics across mappings are allowed.

use std::collections::BTreeMap;
use std::path::Path;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::bacnet::types::ObjectType;
use crate::error::{GatewayError, Result};
use crate::registry::TupleKey;
use crate::registry::persistence::{self, SnapshotWriter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MappingKey {
    pub device_id: u32,
    pub object_type: ObjectType,
    pub object_instance: u32,
}

impl MappingKey {
    pub fn new(device_id: u32, object_type: ObjectType, object_instance: u32) -> Self {
        Self {
            device_id,
            object_type,
            object_instance,
        }
    }
}

/// Operator-defined topic for one object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicMapping {
    pub device_id: u32,
    pub object_type: ObjectType,
    pub object_instance: u32,
    pub mqtt_topic: String,
    /// Takes precedence over `mqtt_topic` when set
    #[serde(default)]
    pub custom_topic: Option<String>,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

impl TopicMapping {
    pub fn key(&self) -> MappingKey {
        MappingKey::new(self.device_id, self.object_type, self.object_instance)
    }

    pub fn effective_topic(&self) -> &str {
        self.custom_topic
            .as_deref()
            .filter(|t| !t.is_empty())
            .unwrap_or(&self.mqtt_topic)
    }
}

pub struct TopicMapper {
    prefix: String,
    mappings: RwLock<BTreeMap<MappingKey, TopicMapping>>,
    writer: SnapshotWriter<Vec<TopicMapping>>,
}

impl TopicMapper {
    pub fn new(prefix: impl Into<String>, writer: SnapshotWriter<Vec<TopicMapping>>) -> Self {
        Self {
            prefix: prefix.into(),
            mappings: RwLock::new(BTreeMap::new()),
            writer,
        }
    }

    pub fn in_memory(prefix: impl Into<String>) -> Self {
        Self::new(prefix, SnapshotWriter::disabled("mappings"))
    }

    /// Restore mappings saved at `path` and persist further changes there
    pub async fn open(prefix: impl Into<String>, path: &Path) -> Result<Self> {
        let saved: Option<Vec<TopicMapping>> = persistence::read_json(path).await?;
        let mapper = Self::new(prefix, SnapshotWriter::spawn(path, "mappings"));
        if let Some(saved) = saved {
            let mut mappings = mapper.mappings.write();
            for mapping in saved {
                mappings.insert(mapping.key(), mapping);
            }
            info!(mappings = mappings.len(), path = %path.display(), "Restored topic mappings");
        }
        Ok(mapper)
    }

    pub async fn flush(&self) {
        self.writer.flush().await;
    }

    /// Topic derived from identity alone
    pub fn default_topic(
        &self,
        device_id: u32,
        object_type: ObjectType,
        instance: u32,
        property: &str,
    ) -> String {
        let object_type = object_type.name().replace(['-', ' '], "_");
        format!("{}/{device_id}/{object_type}/{instance}/{property}", self.prefix)
    }

    /// Topic a tuple publishes on
    pub fn resolve(&self, key: &TupleKey) -> String {
        let mapping_key = MappingKey::new(key.device_id, key.object.object_type, key.object.instance);
        if let Some(mapping) = self.mappings.read().get(&mapping_key).filter(|m| m.enabled) {
            return mapping.effective_topic().to_string();
        }
        self.default_topic(
            key.device_id,
            key.object.object_type,
            key.object.instance,
            &key.property,
        )
    }

    pub fn status_topic(&self, device_id: u32) -> String {
        format!("{}/{device_id}/status", self.prefix)
    }

    /// Create or replace the mapping for its key
    pub fn save(&self, mapping: TopicMapping) -> Result<TopicMapping> {
        if mapping.effective_topic().is_empty() {
            return Err(GatewayError::Rejected("mapping topic must not be empty".into()));
        }
        let mut mappings = self.mappings.write();
        debug!(
            device_id = mapping.device_id,
            object_type = %mapping.object_type,
            instance = mapping.object_instance,
            topic = mapping.effective_topic(),
            "Saving topic mapping"
        );
        mappings.insert(mapping.key(), mapping.clone());
        self.persist(&mappings);
        Ok(mapping)
    }

    pub fn remove(&self, key: &MappingKey) -> Result<TopicMapping> {
        let mut mappings = self.mappings.write();
        let removed = mappings.remove(key).ok_or_else(|| {
            GatewayError::NotFound(format!(
                "mapping {}:{}:{}",
                key.device_id, key.object_type, key.object_instance
            ))
        })?;
        self.persist(&mappings);
        Ok(removed)
    }

    pub fn get(&self, key: &MappingKey) -> Option<TopicMapping> {
        self.mappings.read().get(key).cloned()
    }

    pub fn list(&self) -> Vec<TopicMapping> {
        self.mappings.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.mappings.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.read().is_empty()
    }

    fn persist(&self, mappings: &BTreeMap<MappingKey, TopicMapping>) {
        self.writer.submit(mappings.values().cloned().collect());
    }
}
