//! Device Registry
//!
//! Authoritative store of known devices, their objects, and the last value
//! read for every tracked property. The whole tree sits behind one
//! `parking_lot::RwLock`; every operation holds it briefly, never across an
//! await, and hands out clones so readers never see a half-applied change.
//!
//! Structural mutations (devices added/removed, enable flags, object lists)
//! queue a snapshot write. In-memory state stays authoritative when that
//! write fails.

mod model;
pub mod persistence;

pub use model::*;

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::bacnet::types::{DeviceAnnouncement, ObjectId, ObjectType, PropertyValue, property};
use crate::error::{GatewayError, Result};

use persistence::SnapshotWriter;

/// On-disk form of the registry
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    pub devices: Vec<DeviceRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceRecord {
    #[serde(flatten)]
    pub device: Device,
    #[serde(default)]
    pub objects: Vec<BacnetObject>,
}

pub struct DeviceRegistry {
    devices: RwLock<BTreeMap<u32, Device>>,
    writer: SnapshotWriter<RegistrySnapshot>,
}

impl DeviceRegistry {
    /// An empty registry persisting through `writer`
    pub fn new(writer: SnapshotWriter<RegistrySnapshot>) -> Self {
        Self {
            devices: RwLock::new(BTreeMap::new()),
            writer,
        }
    }

    /// An empty registry that never touches disk
    pub fn in_memory() -> Self {
        Self::new(SnapshotWriter::disabled("devices"))
    }

    /// Restore the snapshot at `path` (if any) and persist back to it
    pub async fn open(path: &Path) -> Result<Self> {
        let snapshot: Option<RegistrySnapshot> = persistence::read_json(path).await?;
        let registry = Self::new(SnapshotWriter::spawn(path, "devices"));
        if let Some(snapshot) = snapshot {
            let mut devices = registry.devices.write();
            for record in snapshot.devices {
                let mut device = record.device;
                device.objects = record
                    .objects
                    .into_iter()
                    .map(|object| (object.id, object))
                    .collect();
                devices.insert(device.device_id, device);
            }
            info!(devices = devices.len(), path = %path.display(), "Restored device registry");
        }
        Ok(registry)
    }

    /// Wait for pending snapshot writes
    pub async fn flush(&self) {
        self.writer.flush().await;
    }

    // ─────────────────────────────────────────────────────────────────────
    // Devices
    // ─────────────────────────────────────────────────────────────────────

    /// Insert a newly announced device or refresh a known one
    ///
    /// Re-announcement never duplicates: it advances `last_seen` and updates
    /// the transport address and link parameters.
    pub fn upsert_device(&self, announcement: &DeviceAnnouncement) -> DeviceUpsert {
        let now = Utc::now();
        let mut devices = self.devices.write();
        let (upsert, structural) = match devices.get_mut(&announcement.device_id) {
            Some(device) => {
                let moved = device.address != announcement.address
                    || device.network != announcement.network;
                if moved {
                    info!(
                        device_id = device.device_id,
                        from = %device.address,
                        to = %announcement.address,
                        "Device address changed"
                    );
                }
                device.address = announcement.address.clone();
                device.network = announcement.network;
                device.max_apdu = announcement.max_apdu;
                device.vendor_id = announcement.vendor_id;
                device.segmentation = announcement.segmentation.clone();
                device.last_seen = advance_timestamp(device.last_seen, now);
                (
                    DeviceUpsert {
                        device: device.clone(),
                        created: false,
                    },
                    moved,
                )
            }
            None => {
                let device = Device::from_announcement(announcement, now);
                info!(device_id = device.device_id, address = %device.address, "New device registered");
                devices.insert(device.device_id, device.clone());
                (
                    DeviceUpsert {
                        device,
                        created: true,
                    },
                    true,
                )
            }
        };
        if structural {
            self.persist(&devices);
        }
        upsert
    }

    /// All devices ordered by device id
    pub fn list_devices(&self) -> Vec<Device> {
        self.devices.read().values().cloned().collect()
    }

    pub fn get_device(&self, device_id: u32) -> Result<Device> {
        self.devices
            .read()
            .get(&device_id)
            .cloned()
            .ok_or_else(|| GatewayError::device_not_found(device_id))
    }

    pub fn contains(&self, device_id: u32) -> bool {
        self.devices.read().contains_key(&device_id)
    }

    pub fn set_enabled(&self, device_id: u32, enabled: bool) -> Result<Device> {
        let mut devices = self.devices.write();
        let device = devices
            .get_mut(&device_id)
            .ok_or_else(|| GatewayError::device_not_found(device_id))?;
        device.enabled = enabled;
        let device = device.clone();
        info!(device_id, enabled, "Device enable flag changed");
        self.persist(&devices);
        Ok(device)
    }

    pub fn remove_device(&self, device_id: u32) -> Result<Device> {
        let mut devices = self.devices.write();
        let device = devices
            .remove(&device_id)
            .ok_or_else(|| GatewayError::device_not_found(device_id))?;
        info!(device_id, "Device removed");
        self.persist(&devices);
        Ok(device)
    }

    /// Store metadata read from the device object; unset fields are left alone
    pub fn update_device_info(&self, device_id: u32, info: DeviceInfo) -> Result<Device> {
        let mut devices = self.devices.write();
        let device = devices
            .get_mut(&device_id)
            .ok_or_else(|| GatewayError::device_not_found(device_id))?;
        let fields = [
            (&mut device.name, info.name),
            (&mut device.vendor_name, info.vendor_name),
            (&mut device.model_name, info.model_name),
            (&mut device.firmware_revision, info.firmware_revision),
            (&mut device.application_software_version, info.application_software_version),
        ];
        for (slot, value) in fields {
            if value.is_some() {
                *slot = value;
            }
        }
        let device = device.clone();
        self.persist(&devices);
        Ok(device)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Objects
    // ─────────────────────────────────────────────────────────────────────

    /// Merge a freshly read object list into a device
    ///
    /// The merge is additive: new objects are inserted, known ones keep their
    /// property records, and objects missing from the list are marked stale
    /// rather than deleted. Unsupported-property marks are cleared so the
    /// next poll probes again.
    pub fn upsert_objects(
        &self,
        device_id: u32,
        descriptors: Vec<ObjectDescriptor>,
    ) -> Result<Reconciliation> {
        let mut devices = self.devices.write();
        let device = devices
            .get_mut(&device_id)
            .ok_or_else(|| GatewayError::device_not_found(device_id))?;

        let mut outcome = Reconciliation::default();
        let seen: std::collections::BTreeSet<ObjectId> =
            descriptors.iter().map(|d| d.id).collect();

        for descriptor in descriptors {
            if descriptor.id.object_type == ObjectType::Device {
                continue;
            }
            match device.objects.get_mut(&descriptor.id) {
                Some(object) => {
                    if object.stale {
                        object.stale = false;
                        outcome.revived += 1;
                    }
                    if descriptor.name.is_some() {
                        object.name = descriptor.name;
                    }
                    object.unsupported.clear();
                }
                None => {
                    device.objects.insert(
                        descriptor.id,
                        BacnetObject::new(descriptor.id, descriptor.name),
                    );
                    outcome.added += 1;
                }
            }
        }

        for object in device.objects.values_mut() {
            if !seen.contains(&object.id) && !object.stale {
                object.stale = true;
                outcome.marked_stale += 1;
            }
        }
        outcome.total = device.objects.len();

        debug!(
            device_id,
            added = outcome.added,
            revived = outcome.revived,
            stale = outcome.marked_stale,
            "Object list reconciled"
        );
        // Names and unsupported marks may have changed even without a structural change
        self.persist(&devices);
        Ok(outcome)
    }

    pub fn get_object(&self, device_id: u32, object: ObjectId) -> Result<BacnetObject> {
        let devices = self.devices.read();
        let device = devices
            .get(&device_id)
            .ok_or_else(|| GatewayError::device_not_found(device_id))?;
        device
            .objects
            .get(&object)
            .cloned()
            .ok_or_else(|| GatewayError::NotFound(format!("object {object} on device {device_id}")))
    }

    // ─────────────────────────────────────────────────────────────────────
    // Properties
    // ─────────────────────────────────────────────────────────────────────

    /// Record a successful read
    ///
    /// Creates the object if the device is known but the object is not yet
    /// enumerated. Reports whether the value differs from the recorded one.
    pub fn update_property(
        &self,
        device_id: u32,
        object: ObjectId,
        property: &str,
        value: PropertyValue,
        unit: Option<String>,
        timestamp: DateTime<Utc>,
    ) -> Result<ValueChange> {
        let mut devices = self.devices.write();
        let device = devices
            .get_mut(&device_id)
            .ok_or_else(|| GatewayError::device_not_found(device_id))?;

        let mut created = false;
        let entry = device.objects.entry(object).or_insert_with(|| {
            created = true;
            BacnetObject::new(object, None)
        });
        entry.last_poll = Some(timestamp);

        let change = match entry.properties.get_mut(property) {
            Some(recorded) => {
                let change = if recorded.value.same_as(&value) {
                    ValueChange::Unchanged
                } else {
                    ValueChange::Changed
                };
                recorded.value = value;
                recorded.timestamp = timestamp;
                if unit.is_some() {
                    recorded.unit = unit;
                }
                change
            }
            None => {
                entry.properties.insert(
                    property.to_string(),
                    Property {
                        value,
                        unit,
                        timestamp,
                    },
                );
                ValueChange::First
            }
        };

        if created {
            debug!(device_id, %object, "Object created from first successful read");
            self.persist(&devices);
        }
        Ok(change)
    }

    /// Remember that an object does not implement a property
    pub fn mark_unsupported(&self, device_id: u32, object: ObjectId, property: &str) -> Result<()> {
        let mut devices = self.devices.write();
        let device = devices
            .get_mut(&device_id)
            .ok_or_else(|| GatewayError::device_not_found(device_id))?;
        let Some(entry) = device.objects.get_mut(&object) else {
            return Err(GatewayError::NotFound(format!(
                "object {object} on device {device_id}"
            )));
        };
        if entry.unsupported.insert(property.to_string()) {
            debug!(device_id, %object, property, "Property marked unsupported");
            self.persist(&devices);
        }
        Ok(())
    }

    pub fn get_property(
        &self,
        device_id: u32,
        object: ObjectId,
        property: &str,
    ) -> Result<Option<Property>> {
        Ok(self
            .get_object(device_id, object)?
            .properties
            .get(property)
            .cloned())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Polling support
    // ─────────────────────────────────────────────────────────────────────

    /// Tuples to read in the next poll cycle, grouped by device
    ///
    /// Covers enabled devices only, skips stale objects, objects without a
    /// present-value when asked for one, and properties marked unsupported.
    pub fn poll_schedule(&self, properties: &[String]) -> Vec<DevicePollPlan> {
        let devices = self.devices.read();
        devices
            .values()
            .filter(|device| device.enabled && !device.objects.is_empty())
            .filter_map(|device| {
                let objects: Vec<ObjectPollPlan> = device
                    .objects
                    .values()
                    .filter(|object| !object.stale)
                    .filter_map(|object| {
                        let props: Vec<String> = properties
                            .iter()
                            .filter(|p| {
                                p.as_str() != property::PRESENT_VALUE
                                    || object.id.object_type.has_present_value()
                            })
                            .filter(|p| !object.unsupported.contains(p.as_str()))
                            .cloned()
                            .collect();
                        if props.is_empty() {
                            return None;
                        }
                        let unit = object
                            .properties
                            .get(property::PRESENT_VALUE)
                            .and_then(|p| p.unit.clone());
                        let read_units = unit.is_none()
                            && object.id.object_type.has_units()
                            && props.iter().any(|p| p == property::PRESENT_VALUE)
                            && !object.unsupported.contains(property::UNITS);
                        Some(ObjectPollPlan {
                            id: object.id,
                            name: object.name.clone(),
                            properties: props,
                            unit,
                            read_units,
                        })
                    })
                    .collect();
                (!objects.is_empty()).then(|| DevicePollPlan {
                    target: device.target(),
                    device_name: device.display_name(),
                    objects,
                })
            })
            .collect()
    }

    /// Enabled devices with no known objects
    pub fn devices_without_objects(&self) -> Vec<u32> {
        self.devices
            .read()
            .values()
            .filter(|d| d.enabled && d.objects.is_empty())
            .map(|d| d.device_id)
            .collect()
    }

    pub fn counts(&self) -> RegistryCounts {
        let devices = self.devices.read();
        RegistryCounts {
            devices: devices.len(),
            enabled: devices.values().filter(|d| d.enabled).count(),
            objects: devices.values().map(|d| d.object_count()).sum(),
        }
    }

    fn persist(&self, devices: &BTreeMap<u32, Device>) {
        let snapshot = RegistrySnapshot {
            devices: devices
                .values()
                .map(|device| DeviceRecord {
                    device: device.clone(),
                    objects: device.objects.values().cloned().collect(),
                })
                .collect(),
        };
        self.writer.submit(snapshot);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RegistryCounts {
    pub devices: usize,
    pub enabled: usize,
    pub objects: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bacnet::types::property;
    use tempfile::TempDir;

    fn announcement(device_id: u32, address: &str) -> DeviceAnnouncement {
        DeviceAnnouncement {
            device_id,
            address: address.to_string(),
            network: None,
            max_apdu: 1476,
            vendor_id: 8,
            segmentation: "segmented-both".to_string(),
        }
    }

    fn ai(instance: u32) -> ObjectId {
        ObjectId::new(ObjectType::AnalogInput, instance)
    }

    fn descriptor(id: ObjectId, name: &str) -> ObjectDescriptor {
        ObjectDescriptor {
            id,
            name: Some(name.to_string()),
        }
    }

    #[test]
    fn test_reannouncement_updates_instead_of_duplicating() {
        let registry = DeviceRegistry::in_memory();
        let first = registry.upsert_device(&announcement(42, "10.0.0.42:47808"));
        assert!(first.created);
        assert!(first.device.enabled);

        let second = registry.upsert_device(&announcement(42, "10.0.0.99:47808"));
        assert!(!second.created);
        assert_eq!(second.device.address, "10.0.0.99:47808");
        assert!(second.device.last_seen > first.device.last_seen);
        assert_eq!(second.device.discovered_at, first.device.discovered_at);
        assert_eq!(registry.list_devices().len(), 1);
    }

    #[test]
    fn test_list_is_ordered_by_id() {
        let registry = DeviceRegistry::in_memory();
        for id in [42, 5, 17] {
            registry.upsert_device(&announcement(id, "10.0.0.1:47808"));
        }
        let ids: Vec<u32> = registry.list_devices().iter().map(|d| d.device_id).collect();
        assert_eq!(ids, vec![5, 17, 42]);
    }

    #[test]
    fn test_unknown_device_operations_are_not_found() {
        let registry = DeviceRegistry::in_memory();
        assert!(matches!(registry.get_device(1), Err(GatewayError::NotFound(_))));
        assert!(matches!(registry.set_enabled(1, false), Err(GatewayError::NotFound(_))));
        assert!(matches!(registry.remove_device(1), Err(GatewayError::NotFound(_))));
        assert!(matches!(registry.upsert_objects(1, vec![]), Err(GatewayError::NotFound(_))));
        let update = registry.update_property(
            1,
            ai(1),
            property::PRESENT_VALUE,
            PropertyValue::Real(1.0),
            None,
            Utc::now(),
        );
        assert!(matches!(update, Err(GatewayError::NotFound(_))));
    }

    #[test]
    fn test_enable_disable_and_remove() {
        let registry = DeviceRegistry::in_memory();
        registry.upsert_device(&announcement(5, "10.0.0.5:47808"));

        let device = registry.set_enabled(5, false).unwrap();
        assert!(!device.enabled);
        assert_eq!(registry.counts().enabled, 0);

        registry.remove_device(5).unwrap();
        assert!(!registry.contains(5));
    }

    #[test]
    fn test_object_reconciliation_is_additive() {
        let registry = DeviceRegistry::in_memory();
        registry.upsert_device(&announcement(5, "10.0.0.5:47808"));

        let first = registry
            .upsert_objects(
                5,
                vec![
                    descriptor(ai(1), "Zone Temp"),
                    descriptor(ai(2), "Supply Temp"),
                    descriptor(ObjectId::device(5), "Device"),
                ],
            )
            .unwrap();
        assert_eq!(first.added, 2);
        assert_eq!(first.total, 2);

        // ai:2 vanishes from the next enumeration: kept, but stale
        let second = registry
            .upsert_objects(5, vec![descriptor(ai(1), "Zone Temp")])
            .unwrap();
        assert_eq!(second.marked_stale, 1);
        assert_eq!(second.total, 2);
        assert!(registry.get_object(5, ai(2)).unwrap().stale);

        let third = registry
            .upsert_objects(5, vec![descriptor(ai(1), "Zone Temp"), descriptor(ai(2), "Supply")])
            .unwrap();
        assert_eq!(third.revived, 1);
        assert_eq!(registry.get_object(5, ai(2)).unwrap().name.as_deref(), Some("Supply"));
    }

    #[test]
    fn test_property_change_detection() {
        let registry = DeviceRegistry::in_memory();
        registry.upsert_device(&announcement(5, "10.0.0.5:47808"));
        let t0 = Utc::now();

        let update = |value: f64| {
            registry
                .update_property(
                    5,
                    ai(1),
                    property::PRESENT_VALUE,
                    PropertyValue::Real(value),
                    Some("degrees-celsius".into()),
                    t0,
                )
                .unwrap()
        };
        assert_eq!(update(21.5), ValueChange::First);
        assert_eq!(update(21.5), ValueChange::Unchanged);
        assert_eq!(update(22.0), ValueChange::Changed);

        // Object was created lazily by the first read
        let object = registry.get_object(5, ai(1)).unwrap();
        assert_eq!(object.last_poll, Some(t0));
        let recorded = registry.get_property(5, ai(1), property::PRESENT_VALUE).unwrap().unwrap();
        assert_eq!(recorded.value, PropertyValue::Real(22.0));
        assert_eq!(recorded.unit.as_deref(), Some("degrees-celsius"));
    }

    #[test]
    fn test_poll_schedule_filters() {
        let registry = DeviceRegistry::in_memory();
        registry.upsert_device(&announcement(5, "10.0.0.5:47808"));
        registry.upsert_device(&announcement(6, "10.0.0.6:47808"));
        registry.upsert_device(&announcement(7, "10.0.0.7:47808"));
        let trend = ObjectId::new(ObjectType::TrendLog, 1);
        registry
            .upsert_objects(5, vec![descriptor(ai(1), "Zone"), descriptor(trend, "Log")])
            .unwrap();
        registry.upsert_objects(6, vec![descriptor(ai(1), "Zone")]).unwrap();
        registry.set_enabled(6, false).unwrap();
        registry
            .mark_unsupported(5, ai(1), property::STATUS_FLAGS)
            .unwrap();

        let properties = vec![
            property::PRESENT_VALUE.to_string(),
            property::STATUS_FLAGS.to_string(),
        ];
        let schedule = registry.poll_schedule(&properties);

        // device 6 is disabled, device 7 has no objects
        assert_eq!(schedule.len(), 1);
        let plan = &schedule[0];
        assert_eq!(plan.target.device_id, 5);
        assert_eq!(plan.tuple_count(), 2);
        let ai_plan = plan.objects.iter().find(|o| o.id == ai(1)).unwrap();
        assert_eq!(ai_plan.properties, vec![property::PRESENT_VALUE.to_string()]);
        let trend_plan = plan.objects.iter().find(|o| o.id == trend).unwrap();
        assert_eq!(trend_plan.properties, vec![property::STATUS_FLAGS.to_string()]);
        assert_eq!(registry.devices_without_objects(), vec![7]);
    }

    #[tokio::test]
    async fn test_snapshot_round_trip_keeps_identity_not_values() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("devices.json");

        let registry = DeviceRegistry::open(&path).await.unwrap();
        registry.upsert_device(&announcement(42, "10.0.0.42:47808"));
        registry.upsert_objects(42, vec![descriptor(ai(3), "Return Temp")]).unwrap();
        registry.set_enabled(42, false).unwrap();
        registry
            .update_property(42, ai(3), property::PRESENT_VALUE, PropertyValue::Real(19.0), None, Utc::now())
            .unwrap();
        registry.flush().await;

        let restored = DeviceRegistry::open(&path).await.unwrap();
        let device = restored.get_device(42).unwrap();
        assert!(!device.enabled);
        assert_eq!(device.address, "10.0.0.42:47808");
        let object = restored.get_object(42, ai(3)).unwrap();
        assert_eq!(object.name.as_deref(), Some("Return Temp"));
        assert!(object.properties.is_empty());
    }
}
