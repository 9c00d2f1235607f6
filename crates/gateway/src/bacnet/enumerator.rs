//! Object Enumerator
//!
//! Reads a device's object list and merges it into the registry. A failed
//! list read leaves the device's known objects untouched and is reported to
//! the caller; there is no retry loop here.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use gateway_runtime::{
    Event, EventPublisher, Service, ServiceContext, ServiceResult, ServiceSpec,
};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::EnumerationConfig;
use crate::error::{GatewayError, Result};
use crate::events;
use crate::registry::{DeviceInfo, DeviceRegistry, DeviceStatus, ObjectDescriptor};

use super::DeviceLocks;
use super::client::{FieldClient, read_bounded, read_object_list_bounded};
use super::types::{DeviceTarget, ObjectId, ObjectType, property};

const SOURCE: &str = "bacnet/enumeration";

#[derive(Debug, Clone, Serialize)]
pub struct EnumerationReport {
    pub device_id: u32,
    /// Objects known for the device after the merge, stale ones included
    pub objects: usize,
    pub added: usize,
    pub marked_stale: usize,
}

pub struct ObjectEnumerator {
    client: Arc<dyn FieldClient>,
    registry: Arc<DeviceRegistry>,
    locks: Arc<DeviceLocks>,
    events: EventPublisher,
    config: EnumerationConfig,
}

impl ObjectEnumerator {
    pub fn new(
        client: Arc<dyn FieldClient>,
        registry: Arc<DeviceRegistry>,
        locks: Arc<DeviceLocks>,
        events: EventPublisher,
        config: EnumerationConfig,
    ) -> Self {
        Self {
            client,
            registry,
            locks,
            events,
            config,
        }
    }

    /// Read the object list of `device_id` and reconcile it into the registry
    pub async fn enumerate(&self, device_id: u32) -> Result<EnumerationReport> {
        let device = self.registry.get_device(device_id)?;
        let target = device.target();
        let _guard = self.locks.lock(device_id).await;

        let ids = read_object_list_bounded(self.client.as_ref(), &target, self.config.read_timeout())
            .await
            .map_err(|e| {
                warn!(device_id, error = %e, "Object list read failed");
                GatewayError::from(e)
            })?;

        if self.config.read_device_info {
            let info = self.read_device_info(&target).await;
            if !info.is_empty() {
                self.registry.update_device_info(device_id, info)?;
            }
        }

        let mut descriptors = Vec::with_capacity(ids.len());
        for id in ids {
            if id.object_type == ObjectType::Device {
                continue;
            }
            let name = if self.config.read_object_names {
                self.read_text(&target, id, property::OBJECT_NAME).await
            } else {
                None
            };
            descriptors.push(ObjectDescriptor { id, name });
        }

        let merged = self.registry.upsert_objects(device_id, descriptors)?;
        info!(
            device_id,
            objects = merged.total,
            added = merged.added,
            stale = merged.marked_stale,
            "Device enumerated"
        );

        let device = self.registry.get_device(device_id)?;
        events::emit_device(&self.events, events::DEVICE_ENUMERATED, SOURCE, &device);

        Ok(EnumerationReport {
            device_id,
            objects: merged.total,
            added: merged.added,
            marked_stale: merged.marked_stale,
        })
    }

    async fn read_device_info(&self, target: &DeviceTarget) -> DeviceInfo {
        let device = ObjectId::device(target.device_id);
        DeviceInfo {
            name: self.read_text(target, device, property::OBJECT_NAME).await,
            vendor_name: self.read_text(target, device, property::VENDOR_NAME).await,
            model_name: self.read_text(target, device, property::MODEL_NAME).await,
            firmware_revision: self.read_text(target, device, property::FIRMWARE_REVISION).await,
            application_software_version: self
                .read_text(target, device, property::APPLICATION_SOFTWARE_VERSION)
                .await,
        }
    }

    /// Best-effort text read; failures only show up in debug logs
    async fn read_text(&self, target: &DeviceTarget, object: ObjectId, prop: &str) -> Option<String> {
        match read_bounded(self.client.as_ref(), target, object, prop, self.config.read_timeout()).await {
            Ok(value) => value.as_text().map(str::to_string),
            Err(e) => {
                debug!(device_id = target.device_id, %object, property = prop, error = %e, "Optional read failed");
                None
            }
        }
    }
}

/// Enumerates newly discovered devices
///
/// Also enumerates, once at start, every enabled device restored without
/// objects, and re-enumerates all enabled devices on the refresh interval
/// when one is configured.
pub struct EnumerationService {
    enumerator: Arc<ObjectEnumerator>,
    registry: Arc<DeviceRegistry>,
    refresh_interval: Option<Duration>,
    tasks: Vec<JoinHandle<()>>,
}

impl EnumerationService {
    pub fn new(
        enumerator: Arc<ObjectEnumerator>,
        registry: Arc<DeviceRegistry>,
        refresh_interval: Option<Duration>,
    ) -> Self {
        Self {
            enumerator,
            registry,
            refresh_interval,
            tasks: Vec::new(),
        }
    }

    fn spawn_enumeration(&mut self, devices: Vec<u32>) {
        if devices.is_empty() {
            return;
        }
        self.tasks.retain(|task| !task.is_finished());
        let enumerator = Arc::clone(&self.enumerator);
        self.tasks.push(tokio::spawn(async move {
            for device_id in devices {
                if let Err(e) = enumerator.enumerate(device_id).await {
                    warn!(device_id, error = %e, "Enumeration failed");
                }
            }
        }));
    }
}

#[async_trait]
impl Service for EnumerationService {
    fn spec(&self) -> ServiceSpec {
        let spec = ServiceSpec::new(SOURCE, "Object Enumerator")
            .subscribe(events::DEVICE_DISCOVERED)
            .subscribe(events::DEVICE_ENABLED)
            .with_description("Reads object lists of discovered devices");
        match self.refresh_interval {
            Some(interval) => spec.with_tick_interval(interval),
            None => spec,
        }
    }

    async fn on_start(&mut self, _ctx: &ServiceContext) -> ServiceResult<()> {
        let pending = self.registry.devices_without_objects();
        if !pending.is_empty() {
            info!(devices = pending.len(), "Enumerating restored devices without objects");
        }
        self.spawn_enumeration(pending);
        Ok(())
    }

    async fn on_stop(&mut self, _ctx: &ServiceContext) -> ServiceResult<()> {
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        Ok(())
    }

    async fn on_event(&mut self, _ctx: &ServiceContext, event: Event) -> ServiceResult<()> {
        let Ok(status) = event.parse_data::<DeviceStatus>() else {
            debug!(event_type = %event.event_type, "Ignoring device event without status");
            return Ok(());
        };
        if event.event_type == events::DEVICE_ENABLED && status.object_count > 0 {
            return Ok(());
        }
        self.spawn_enumeration(vec![status.device_id]);
        Ok(())
    }

    async fn on_tick(&mut self, _ctx: &ServiceContext) -> ServiceResult<()> {
        let devices: Vec<u32> = self
            .registry
            .list_devices()
            .into_iter()
            .filter(|d| d.enabled)
            .map(|d| d.device_id)
            .collect();
        debug!(devices = devices.len(), "Refreshing object lists");
        self.spawn_enumeration(devices);
        Ok(())
    }
}
