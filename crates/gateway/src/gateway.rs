//! Gateway assembly and control surface
//!
//! [`Gateway`] wires the registry, topic mapper, BACnet components and the
//! publisher together, starts them as services, and exposes the operations
//! an API layer would call. Every operation maps onto one component.

use std::sync::Arc;
use std::time::Duration;

use gateway_runtime::{EventPublisher, ServiceManager};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::info;

use crate::activity::ActivityStatus;
use crate::bacnet::client::{FieldClient, read_bounded};
use crate::bacnet::{
    ChangeNotification, CycleReport, DeviceLocks, DeviceRange, DiscoveryCoordinator,
    DiscoveryService, EnumerationReport, EnumerationService, ForeignDeviceService, ObjectEnumerator,
    ObjectId, Poller, PollingService, PropertyValue, SweepReport,
};
use crate::config::GatewayConfig;
use crate::error::{FieldError, GatewayError, Result};
use crate::events;
use crate::mqtt::{
    Bus, ConnectionState, MappingKey, Publisher, PublisherService, PublisherStats, TopicMapper,
    TopicMapping,
};
use crate::registry::{Device, DeviceRegistry};

const SOURCE: &str = "gateway";

/// Snapshot of the gateway's health
#[derive(Debug, Clone, Serialize)]
pub struct GatewayStatus {
    pub devices: usize,
    pub enabled_devices: usize,
    pub objects: usize,
    pub mappings: usize,
    pub bus: ConnectionState,
    pub pending_messages: usize,
    pub published: u64,
    pub discovery: ActivityStatus,
    pub polling: ActivityStatus,
}

pub struct Gateway {
    config: GatewayConfig,
    client: Arc<dyn FieldClient>,
    bus: Arc<dyn Bus>,
    registry: Arc<DeviceRegistry>,
    mapper: Arc<TopicMapper>,
    locks: Arc<DeviceLocks>,
    discovery: Arc<DiscoveryCoordinator>,
    enumerator: Arc<ObjectEnumerator>,
    poller: Arc<Poller>,
    stats: Arc<PublisherStats>,
    events: EventPublisher,
    publisher: Mutex<Option<(Publisher, mpsc::Receiver<ChangeNotification>)>>,
}

impl Gateway {
    pub fn new(
        config: GatewayConfig,
        client: Arc<dyn FieldClient>,
        bus: Arc<dyn Bus>,
        registry: Arc<DeviceRegistry>,
        mapper: Arc<TopicMapper>,
        events: EventPublisher,
    ) -> Self {
        let locks = Arc::new(DeviceLocks::new());
        let (changes_tx, changes_rx) = mpsc::channel(config.mqtt.channel_capacity.max(1));
        let stats = Arc::new(PublisherStats::default());

        let discovery = Arc::new(DiscoveryCoordinator::new(
            Arc::clone(&client),
            Arc::clone(&registry),
            events.clone(),
            &config.discovery,
        ));
        let enumerator = Arc::new(ObjectEnumerator::new(
            Arc::clone(&client),
            Arc::clone(&registry),
            Arc::clone(&locks),
            events.clone(),
            config.enumeration.clone(),
        ));
        let poller = Arc::new(Poller::new(
            Arc::clone(&client),
            Arc::clone(&registry),
            Arc::clone(&locks),
            changes_tx,
            config.polling.clone(),
        ));
        let publisher = Publisher::new(
            Arc::clone(&bus),
            Arc::clone(&mapper),
            config.mqtt.retain,
            config.mqtt.buffer_capacity,
            Arc::clone(&stats),
        );

        Self {
            config,
            client,
            bus,
            registry,
            mapper,
            locks,
            discovery,
            enumerator,
            poller,
            stats,
            events,
            publisher: Mutex::new(Some((publisher, changes_rx))),
        }
    }

    /// Build a gateway whose registry and mappings persist to the configured files
    pub async fn open(
        config: GatewayConfig,
        client: Arc<dyn FieldClient>,
        bus: Arc<dyn Bus>,
        events: EventPublisher,
    ) -> Result<Self> {
        let registry = Arc::new(DeviceRegistry::open(&config.storage.devices_file).await?);
        let mapper = Arc::new(
            TopicMapper::open(config.mqtt.topic_prefix.clone(), &config.storage.mappings_file).await?,
        );
        Ok(Self::new(config, client, bus, registry, mapper, events))
    }

    /// Spawn the gateway's services on `manager`
    pub async fn start(&self, manager: &ServiceManager) -> Result<()> {
        let (publisher, changes) = self
            .publisher
            .lock()
            .take()
            .ok_or_else(|| GatewayError::Service("gateway already started".into()))?;

        // Publisher first so no lifecycle event is missed
        manager
            .spawn(PublisherService::new(
                publisher,
                changes,
                self.config.mqtt.channel_capacity,
            ))
            .await?;
        manager
            .spawn(EnumerationService::new(
                Arc::clone(&self.enumerator),
                Arc::clone(&self.registry),
                self.config.enumeration.refresh_interval(),
            ))
            .await?;
        if let Some(foreign) = &self.config.bacnet.foreign_device {
            manager
                .spawn(ForeignDeviceService::new(Arc::clone(&self.client), foreign.clone()))
                .await?;
        }
        if self.config.discovery.enabled {
            manager
                .spawn(DiscoveryService::new(
                    Arc::clone(&self.discovery),
                    self.config.discovery.interval(),
                ))
                .await?;
        }
        if self.config.polling.enabled {
            manager
                .spawn(PollingService::new(
                    Arc::clone(&self.poller),
                    self.config.polling.interval(),
                ))
                .await?;
        }

        info!(services = manager.len(), "Gateway started");
        Ok(())
    }

    /// Wait for pending snapshot writes
    pub async fn flush(&self) {
        self.registry.flush().await;
        self.mapper.flush().await;
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    pub fn mapper(&self) -> &Arc<TopicMapper> {
        &self.mapper
    }

    // ─────────────────────────────────────────────────────────────────────
    // Activities
    // ─────────────────────────────────────────────────────────────────────

    /// Manual discovery sweep; `Busy` while another sweep runs
    pub async fn trigger_sweep(
        &self,
        range: Option<DeviceRange>,
        timeout: Option<Duration>,
    ) -> Result<SweepReport> {
        self.discovery.run_sweep(range, timeout).await
    }

    pub async fn enumerate_device(&self, device_id: u32) -> Result<EnumerationReport> {
        self.enumerator.enumerate(device_id).await
    }

    /// Manual poll cycle; `Busy` while another cycle runs
    pub async fn poll_now(&self) -> Result<CycleReport> {
        self.poller.run_cycle().await
    }

    // ─────────────────────────────────────────────────────────────────────
    // Devices
    // ─────────────────────────────────────────────────────────────────────

    pub fn list_devices(&self) -> Vec<Device> {
        self.registry.list_devices()
    }

    pub fn get_device(&self, device_id: u32) -> Result<Device> {
        self.registry.get_device(device_id)
    }

    pub fn set_device_enabled(&self, device_id: u32, enabled: bool) -> Result<Device> {
        let device = self.registry.set_enabled(device_id, enabled)?;
        let event = if enabled {
            events::DEVICE_ENABLED
        } else {
            events::DEVICE_DISABLED
        };
        events::emit_device(&self.events, event, SOURCE, &device);
        Ok(device)
    }

    pub fn remove_device(&self, device_id: u32) -> Result<Device> {
        let device = self.registry.remove_device(device_id)?;
        self.locks.forget(device_id);
        events::emit_device(&self.events, events::DEVICE_REMOVED, SOURCE, &device);
        Ok(device)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Single-property access
    // ─────────────────────────────────────────────────────────────────────

    /// Read one property straight from the device
    ///
    /// The result is returned to the caller only; the cached value stays as
    /// the poller last recorded it.
    pub async fn read_property(
        &self,
        device_id: u32,
        object: ObjectId,
        property: &str,
    ) -> Result<PropertyValue> {
        let target = self.registry.get_device(device_id)?.target();
        let _guard = self.locks.lock(device_id).await;
        read_bounded(
            self.client.as_ref(),
            &target,
            object,
            property,
            self.config.polling.read_timeout(),
        )
        .await
        .map_err(GatewayError::from)
    }

    /// Write one property, optionally at a command priority (1..=16)
    pub async fn write_property(
        &self,
        device_id: u32,
        object: ObjectId,
        property: &str,
        value: PropertyValue,
        priority: Option<u8>,
    ) -> Result<()> {
        if let Some(priority) = priority.filter(|p| !(1..=16).contains(p)) {
            return Err(GatewayError::Rejected(format!(
                "priority {priority} outside 1..=16"
            )));
        }
        let target = self.registry.get_device(device_id)?.target();
        let _guard = self.locks.lock(device_id).await;
        let write = self
            .client
            .write_property(&target, object, property, value, priority);
        tokio::time::timeout(self.config.polling.read_timeout(), write)
            .await
            .unwrap_or(Err(FieldError::Timeout))?;
        info!(device_id, %object, property, ?priority, "Property written");
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Topic mappings
    // ─────────────────────────────────────────────────────────────────────

    pub fn save_mapping(&self, mapping: TopicMapping) -> Result<TopicMapping> {
        self.mapper.save(mapping)
    }

    pub fn delete_mapping(&self, key: &MappingKey) -> Result<TopicMapping> {
        self.mapper.remove(key)
    }

    pub fn get_mapping(&self, key: &MappingKey) -> Result<TopicMapping> {
        self.mapper.get(key).ok_or_else(|| {
            GatewayError::NotFound(format!(
                "mapping {}:{}:{}",
                key.device_id, key.object_type, key.object_instance
            ))
        })
    }

    pub fn list_mappings(&self) -> Vec<TopicMapping> {
        self.mapper.list()
    }

    pub fn status(&self) -> GatewayStatus {
        use std::sync::atomic::Ordering;

        let counts = self.registry.counts();
        GatewayStatus {
            devices: counts.devices,
            enabled_devices: counts.enabled,
            objects: counts.objects,
            mappings: self.mapper.len(),
            bus: *self.bus.connection().borrow(),
            pending_messages: self.stats.pending.load(Ordering::Relaxed),
            published: self.stats.published.load(Ordering::Relaxed),
            discovery: self.discovery.status(),
            polling: self.poller.status(),
        }
    }
}
