//! Simulated field network
//!
//! An in-memory [`FieldClient`] used by the bundled binary (devices described
//! in the `simulation` config section) and by the tests, which also use its
//! fault-injection knobs.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::FieldError;

use super::client::{FieldClient, FieldResult};
use super::types::{
    DeviceAnnouncement, DeviceRange, DeviceTarget, ObjectId, ObjectType, PropertyValue, property,
};

/// Simulated device as described in configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimDeviceConfig {
    pub device_id: u32,
    pub address: String,
    #[serde(default)]
    pub network: Option<u16>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub vendor: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub objects: Vec<SimObjectConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimObjectConfig {
    pub object_type: ObjectType,
    pub instance: u32,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub value: Option<PropertyValue>,
    #[serde(default)]
    pub unit: Option<String>,
}

/// One simulated device and its property table
#[derive(Debug, Clone)]
pub struct SimDevice {
    announcement: DeviceAnnouncement,
    objects: BTreeMap<ObjectId, HashMap<String, PropertyValue>>,
    unreachable: bool,
}

impl SimDevice {
    pub fn new(device_id: u32, address: impl Into<String>) -> Self {
        let mut device = Self {
            announcement: DeviceAnnouncement {
                device_id,
                address: address.into(),
                network: None,
                max_apdu: 1476,
                vendor_id: 0,
                segmentation: "segmented-both".to_string(),
            },
            objects: BTreeMap::new(),
            unreachable: false,
        };
        device.objects.insert(ObjectId::device(device_id), HashMap::new());
        device
    }

    /// Set a property on the device object (vendor-name, model-name, ...)
    pub fn with_device_property(mut self, property: &str, value: PropertyValue) -> Self {
        let id = ObjectId::device(self.announcement.device_id);
        self.objects
            .entry(id)
            .or_default()
            .insert(property.to_string(), value);
        self
    }

    /// Add an object exposing `present-value`, `status-flags`, and optionally
    /// `object-name` and `units`
    pub fn with_object(
        mut self,
        object_type: ObjectType,
        instance: u32,
        name: Option<&str>,
        value: PropertyValue,
        unit: Option<&str>,
    ) -> Self {
        let mut props = HashMap::new();
        props.insert(property::PRESENT_VALUE.to_string(), value);
        props.insert(
            property::STATUS_FLAGS.to_string(),
            PropertyValue::BitString(vec![false; 4]),
        );
        if let Some(name) = name {
            props.insert(property::OBJECT_NAME.to_string(), PropertyValue::Text(name.to_string()));
        }
        if let Some(unit) = unit {
            props.insert(property::UNITS.to_string(), PropertyValue::Text(unit.to_string()));
        }
        self.objects.insert(ObjectId::new(object_type, instance), props);
        self
    }

    fn from_config(config: &SimDeviceConfig) -> Self {
        let mut device = SimDevice::new(config.device_id, config.address.clone());
        device.announcement.network = config.network;
        let device_props = [
            (property::OBJECT_NAME, &config.name),
            (property::VENDOR_NAME, &config.vendor),
            (property::MODEL_NAME, &config.model),
        ];
        for (prop, value) in device_props {
            if let Some(value) = value {
                device = device.with_device_property(prop, PropertyValue::Text(value.clone()));
            }
        }
        for object in &config.objects {
            device = device.with_object(
                object.object_type,
                object.instance,
                object.name.as_deref(),
                object.value.clone().unwrap_or(PropertyValue::Null),
                object.unit.as_deref(),
            );
        }
        device
    }
}

/// Live count of concurrent requests and the highest count seen
#[derive(Default)]
struct Gauge {
    current: AtomicUsize,
    peak: AtomicUsize,
    total: AtomicUsize,
}

impl Gauge {
    fn enter(self: &Arc<Self>) -> GaugeGuard {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.total.fetch_add(1, Ordering::SeqCst);
        GaugeGuard(Arc::clone(self))
    }

    fn is_busy(&self) -> bool {
        self.current.load(Ordering::SeqCst) > 0
    }
}

/// Leaves the gauge on drop, so cancelled requests are released too
struct GaugeGuard(Arc<Gauge>);

impl Drop for GaugeGuard {
    fn drop(&mut self) {
        self.0.current.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct SimState {
    devices: BTreeMap<u32, SimDevice>,
    stray_announcements: Vec<DeviceAnnouncement>,
    discovery_failure: bool,
    latency: Duration,
    registrations: Vec<(String, u16)>,
}

/// In-memory field network
#[derive(Clone, Default)]
pub struct SimulatedNetwork {
    state: Arc<Mutex<SimState>>,
    reads: Arc<AtomicUsize>,
    in_flight: Arc<Mutex<HashMap<u32, Arc<Gauge>>>>,
    peak_busy_devices: Arc<AtomicUsize>,
    sweeps: Arc<Gauge>,
}

impl SimulatedNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(devices: &[SimDeviceConfig]) -> Self {
        let network = Self::new();
        for config in devices {
            network.add_device(SimDevice::from_config(config));
        }
        network
    }

    pub fn add_device(&self, device: SimDevice) {
        self.state
            .lock()
            .devices
            .insert(device.announcement.device_id, device);
    }

    /// Change a property value as if the field point moved
    pub fn set_value(&self, device_id: u32, object: ObjectId, prop: &str, value: PropertyValue) {
        if let Some(device) = self.state.lock().devices.get_mut(&device_id) {
            device
                .objects
                .entry(object)
                .or_default()
                .insert(prop.to_string(), value);
        }
    }

    pub fn remove_object(&self, device_id: u32, object: ObjectId) {
        if let Some(device) = self.state.lock().devices.get_mut(&device_id) {
            device.objects.remove(&object);
        }
    }

    /// An unreachable device answers nothing: discovery skips it and reads time out
    pub fn set_unreachable(&self, device_id: u32, unreachable: bool) {
        if let Some(device) = self.state.lock().devices.get_mut(&device_id) {
            device.unreachable = unreachable;
        }
    }

    /// Make the next discovery requests fail at the transport level
    pub fn set_discovery_failure(&self, fail: bool) {
        self.state.lock().discovery_failure = fail;
    }

    /// Delay applied to every request
    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().latency = latency;
    }

    /// Announcement delivered with every sweep regardless of the requested range
    pub fn push_stray_announcement(&self, announcement: DeviceAnnouncement) {
        self.state.lock().stray_announcements.push(announcement);
    }

    pub fn registrations(&self) -> Vec<(String, u16)> {
        self.state.lock().registrations.clone()
    }

    /// Total property and object-list reads served
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneous requests seen for one device
    pub fn max_concurrent_requests(&self, device_id: u32) -> usize {
        self.in_flight
            .lock()
            .get(&device_id)
            .map(|gauge| gauge.peak.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Highest number of devices with a request in flight at the same time
    pub fn max_concurrent_devices(&self) -> usize {
        self.peak_busy_devices.load(Ordering::SeqCst)
    }

    /// Discovery broadcasts sent
    pub fn sweep_count(&self) -> usize {
        self.sweeps.total.load(Ordering::SeqCst)
    }

    /// Highest number of announcement streams open at the same time
    pub fn max_concurrent_sweeps(&self) -> usize {
        self.sweeps.peak.load(Ordering::SeqCst)
    }

    fn latency(&self) -> Duration {
        self.state.lock().latency
    }

    async fn request<T>(
        &self,
        device_id: u32,
        op: impl FnOnce(&mut SimDevice) -> FieldResult<T>,
    ) -> FieldResult<T> {
        let _request = {
            let mut in_flight = self.in_flight.lock();
            let guard = in_flight.entry(device_id).or_default().enter();
            let busy = in_flight.values().filter(|gauge| gauge.is_busy()).count();
            self.peak_busy_devices.fetch_max(busy, Ordering::SeqCst);
            guard
        };
        tokio::time::sleep(self.latency()).await;
        let mut state = self.state.lock();
        match state.devices.get_mut(&device_id) {
            Some(device) if device.unreachable => Err(FieldError::Timeout),
            Some(device) => op(device),
            None => Err(FieldError::Timeout),
        }
    }
}

#[async_trait]
impl FieldClient for SimulatedNetwork {
    async fn discover(
        &self,
        range: DeviceRange,
        _timeout: Duration,
    ) -> FieldResult<BoxStream<'static, DeviceAnnouncement>> {
        let latency = self.latency();
        let announcements: Vec<DeviceAnnouncement> = {
            let state = self.state.lock();
            if state.discovery_failure {
                return Err(FieldError::Unreachable("broadcast send failed".to_string()));
            }
            state
                .devices
                .values()
                .filter(|d| !d.unreachable && range.contains(d.announcement.device_id))
                .map(|d| d.announcement.clone())
                .chain(state.stray_announcements.iter().cloned())
                .collect()
        };

        let sweep = self.sweeps.enter();
        Ok(futures::stream::iter(announcements)
            .then(move |announcement| async move {
                tokio::time::sleep(latency).await;
                announcement
            })
            .map(move |announcement| {
                let _open = &sweep;
                announcement
            })
            .boxed())
    }

    async fn read_property(
        &self,
        target: &DeviceTarget,
        object: ObjectId,
        prop: &str,
    ) -> FieldResult<PropertyValue> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.request(target.device_id, |device| {
            let props = device
                .objects
                .get(&object)
                .ok_or_else(|| FieldError::Rejected("unknown-object".to_string()))?;
            props.get(prop).cloned().ok_or(FieldError::UnknownProperty)
        })
        .await
    }

    async fn read_object_list(&self, target: &DeviceTarget) -> FieldResult<Vec<ObjectId>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.request(target.device_id, |device| {
            Ok(device.objects.keys().copied().collect())
        })
        .await
    }

    async fn write_property(
        &self,
        target: &DeviceTarget,
        object: ObjectId,
        prop: &str,
        value: PropertyValue,
        _priority: Option<u8>,
    ) -> FieldResult<()> {
        self.request(target.device_id, |device| {
            let props = device
                .objects
                .get_mut(&object)
                .ok_or_else(|| FieldError::Rejected("unknown-object".to_string()))?;
            match props.get_mut(prop) {
                Some(slot) => {
                    *slot = value;
                    Ok(())
                }
                None => Err(FieldError::UnknownProperty),
            }
        })
        .await
    }

    async fn register_foreign_device(&self, relay: &str, ttl: u16) -> FieldResult<()> {
        self.state.lock().registrations.push((relay.to_string(), ttl));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(device_id: u32) -> DeviceTarget {
        DeviceTarget {
            device_id,
            address: format!("10.0.0.{device_id}:47808"),
            network: None,
        }
    }

    #[tokio::test]
    async fn test_discover_filters_by_range() {
        let network = SimulatedNetwork::new();
        network.add_device(SimDevice::new(5, "10.0.0.5:47808"));
        network.add_device(SimDevice::new(500, "10.0.0.50:47808"));

        let found: Vec<_> = network
            .discover(DeviceRange::new(1, 100), Duration::from_millis(10))
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].device_id, 5);
    }

    #[tokio::test]
    async fn test_reads_and_faults() {
        let ai1 = ObjectId::new(ObjectType::AnalogInput, 1);
        let network = SimulatedNetwork::new();
        network.add_device(SimDevice::new(5, "10.0.0.5:47808").with_object(
            ObjectType::AnalogInput,
            1,
            Some("Zone Temp"),
            PropertyValue::Real(21.5),
            Some("degrees-celsius"),
        ));

        let value = network.read_property(&target(5), ai1, property::PRESENT_VALUE).await;
        assert_eq!(value, Ok(PropertyValue::Real(21.5)));
        let missing = network.read_property(&target(5), ai1, "cov-increment").await;
        assert_eq!(missing, Err(FieldError::UnknownProperty));

        let objects = network.read_object_list(&target(5)).await.unwrap();
        assert_eq!(objects, vec![ai1, ObjectId::device(5)]);

        network.set_unreachable(5, true);
        let value = network.read_property(&target(5), ai1, property::PRESENT_VALUE).await;
        assert_eq!(value, Err(FieldError::Timeout));
        assert_eq!(network.read_count(), 4);
    }
}
