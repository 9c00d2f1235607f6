//! Registry data model
//!
//! Devices own their objects, objects own their property records. Identity
//! (devices, objects, enable flags, unsupported-property marks) is persisted;
//! property values are volatile and rebuilt by the poller after a restart.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::bacnet::types::{DeviceAnnouncement, DeviceTarget, ObjectId, PropertyValue};

/// A field device known to the gateway
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    /// BACnet device instance; the registry's primary key
    pub device_id: u32,
    pub network: Option<u16>,
    pub address: String,
    pub name: Option<String>,
    pub vendor_name: Option<String>,
    pub model_name: Option<String>,
    pub firmware_revision: Option<String>,
    pub application_software_version: Option<String>,
    pub max_apdu: u16,
    pub vendor_id: u16,
    pub segmentation: String,
    pub enabled: bool,
    pub discovered_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    #[serde(skip)]
    pub objects: BTreeMap<ObjectId, BacnetObject>,
}

impl Device {
    pub(crate) fn from_announcement(announcement: &DeviceAnnouncement, now: DateTime<Utc>) -> Self {
        Self {
            device_id: announcement.device_id,
            network: announcement.network,
            address: announcement.address.clone(),
            name: None,
            vendor_name: None,
            model_name: None,
            firmware_revision: None,
            application_software_version: None,
            max_apdu: announcement.max_apdu,
            vendor_id: announcement.vendor_id,
            segmentation: announcement.segmentation.clone(),
            enabled: true,
            discovered_at: now,
            last_seen: now,
            objects: BTreeMap::new(),
        }
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    pub fn target(&self) -> DeviceTarget {
        DeviceTarget {
            device_id: self.device_id,
            address: self.address.clone(),
            network: self.network,
        }
    }

    /// Name for payloads: the device's object-name, or "device-{id}"
    pub fn display_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("device-{}", self.device_id))
    }

    pub fn status(&self) -> DeviceStatus {
        DeviceStatus {
            device_id: self.device_id,
            name: self.display_name(),
            address: self.address.clone(),
            online: self.enabled,
            last_seen: self.last_seen,
            object_count: self.object_count(),
        }
    }
}

/// Availability summary published on `{prefix}/{device_id}/status`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub device_id: u32,
    #[serde(rename = "device_name")]
    pub name: String,
    pub address: String,
    pub online: bool,
    pub last_seen: DateTime<Utc>,
    pub object_count: usize,
}

/// An object owned by one device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacnetObject {
    pub id: ObjectId,
    pub name: Option<String>,
    /// Absent from the most recent successful enumeration
    #[serde(default)]
    pub stale: bool,
    #[serde(default)]
    pub unsupported: BTreeSet<String>,
    #[serde(skip)]
    pub last_poll: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub properties: BTreeMap<String, Property>,
}

impl BacnetObject {
    pub fn new(id: ObjectId, name: Option<String>) -> Self {
        Self {
            id,
            name,
            stale: false,
            unsupported: BTreeSet::new(),
            last_poll: None,
            properties: BTreeMap::new(),
        }
    }
}

/// Last successfully read value of one property
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Property {
    pub value: PropertyValue,
    pub unit: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// What the enumerator found for one object
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectDescriptor {
    pub id: ObjectId,
    pub name: Option<String>,
}

/// Metadata read from a device object during enumeration
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceInfo {
    pub name: Option<String>,
    pub vendor_name: Option<String>,
    pub model_name: Option<String>,
    pub firmware_revision: Option<String>,
    pub application_software_version: Option<String>,
}

impl DeviceInfo {
    pub fn is_empty(&self) -> bool {
        *self == DeviceInfo::default()
    }
}

/// One pollable value: (device, object, property)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TupleKey {
    pub device_id: u32,
    pub object: ObjectId,
    pub property: String,
}

impl TupleKey {
    pub fn new(device_id: u32, object: ObjectId, property: impl Into<String>) -> Self {
        Self {
            device_id,
            object,
            property: property.into(),
        }
    }
}

impl fmt::Display for TupleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.device_id, self.object, self.property)
    }
}

/// Result of `upsert_device`
#[derive(Debug, Clone)]
pub struct DeviceUpsert {
    pub device: Device,
    /// First time this device id was seen
    pub created: bool,
}

/// Result of merging a fresh object list into a device
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciliation {
    pub added: usize,
    /// Present again after having been marked stale
    pub revived: usize,
    pub marked_stale: usize,
    /// Objects in the device after the merge, stale ones included
    pub total: usize,
}

/// How a successful read compared with the recorded value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueChange {
    /// No value had been recorded for the tuple
    First,
    Changed,
    Unchanged,
}

impl ValueChange {
    /// Whether the read must be forwarded to the publisher
    pub fn should_notify(&self) -> bool {
        !matches!(self, ValueChange::Unchanged)
    }
}

/// Work for one device in one poll cycle
#[derive(Debug, Clone)]
pub struct DevicePollPlan {
    pub target: DeviceTarget,
    pub device_name: String,
    pub objects: Vec<ObjectPollPlan>,
}

impl DevicePollPlan {
    pub fn tuple_count(&self) -> usize {
        self.objects.iter().map(|o| o.properties.len()).sum()
    }
}

#[derive(Debug, Clone)]
pub struct ObjectPollPlan {
    pub id: ObjectId,
    pub name: Option<String>,
    pub properties: Vec<String>,
    /// Unit already recorded for `present-value`
    pub unit: Option<String>,
    /// `units` still has to be read alongside `present-value`
    pub read_units: bool,
}

/// Later of `now` and just after `previous`, so re-announcements always move
/// `last_seen` forward even under clock adjustments
pub(crate) fn advance_timestamp(previous: DateTime<Utc>, now: DateTime<Utc>) -> DateTime<Utc> {
    if now > previous {
        now
    } else {
        previous + TimeDelta::microseconds(1)
    }
}
