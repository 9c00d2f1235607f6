//! Poller
//!
//! Each cycle reads every scheduled (device, object, property) tuple, records
//! successful reads in the registry and forwards a [`ChangeNotification`]
//! when a value is new or different. Devices are polled concurrently up to
//! `max_concurrent_devices`; reads to one device run one at a time.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use gateway_runtime::{Service, ServiceContext, ServiceResult, ServiceSpec};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::activity::{Activity, ActivityStatus, Outcome};
use crate::config::PollingConfig;
use crate::error::{FieldError, GatewayError, Result};
use crate::registry::{DevicePollPlan, DeviceRegistry, TupleKey};

use super::DeviceLocks;
use super::client::{FieldClient, read_bounded};
use super::types::{DeviceTarget, ObjectId, PropertyValue, property};

/// A tuple whose value was read for the first time or changed
///
/// Carries everything the publisher needs, so it never re-reads the
/// registry (which a later cycle may already have overwritten).
#[derive(Debug, Clone, Serialize)]
pub struct ChangeNotification {
    pub key: TupleKey,
    pub value: PropertyValue,
    pub unit: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub device_name: String,
    pub device_address: String,
    pub object_name: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleReport {
    pub devices: usize,
    pub reads: usize,
    pub changes: usize,
    pub failures: usize,
    /// Properties found missing on their object this cycle
    pub unsupported: usize,
    pub duration_ms: u64,
}

impl CycleReport {
    fn absorb(&mut self, device: CycleReport) {
        self.devices += device.devices;
        self.reads += device.reads;
        self.changes += device.changes;
        self.failures += device.failures;
        self.unsupported += device.unsupported;
    }
}

pub struct Poller {
    client: Arc<dyn FieldClient>,
    registry: Arc<DeviceRegistry>,
    locks: Arc<DeviceLocks>,
    changes: mpsc::Sender<ChangeNotification>,
    activity: Activity,
    config: PollingConfig,
}

impl Poller {
    pub fn new(
        client: Arc<dyn FieldClient>,
        registry: Arc<DeviceRegistry>,
        locks: Arc<DeviceLocks>,
        changes: mpsc::Sender<ChangeNotification>,
        config: PollingConfig,
    ) -> Self {
        Self {
            client,
            registry,
            locks,
            changes,
            activity: Activity::new("polling"),
            config,
        }
    }

    pub fn is_running(&self) -> bool {
        self.activity.is_running()
    }

    pub fn status(&self) -> ActivityStatus {
        self.activity.status()
    }

    /// Run one poll cycle over the current schedule
    ///
    /// Read failures are counted, never propagated; the only error is `Busy`
    /// when a cycle is already in progress.
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        let guard = self
            .activity
            .try_begin()
            .ok_or(GatewayError::Busy("polling"))?;
        let started = Instant::now();

        let schedule = self.registry.poll_schedule(&self.config.properties);
        let tuples: usize = schedule.iter().map(DevicePollPlan::tuple_count).sum();
        debug!(devices = schedule.len(), tuples, "Starting poll cycle");

        let mut report = futures::stream::iter(schedule)
            .map(|plan| self.poll_device(plan))
            .buffer_unordered(self.config.max_concurrent_devices.max(1))
            .fold(CycleReport::default(), |mut total, device| async move {
                total.absorb(device);
                total
            })
            .await;

        report.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            devices = report.devices,
            reads = report.reads,
            changes = report.changes,
            failures = report.failures,
            duration_ms = report.duration_ms,
            "Poll cycle finished"
        );
        guard.finish(Outcome::Completed);
        Ok(report)
    }

    async fn poll_device(&self, plan: DevicePollPlan) -> CycleReport {
        let device_id = plan.target.device_id;
        let timeout = self.config.read_timeout();
        let mut tally = CycleReport {
            devices: 1,
            ..CycleReport::default()
        };
        let _guard = self.locks.lock(device_id).await;

        'objects: for object in &plan.objects {
            let mut unit = object.unit.clone();
            for prop in &object.properties {
                tally.reads += 1;
                let value = match read_bounded(self.client.as_ref(), &plan.target, object.id, prop, timeout).await {
                    Ok(value) => value,
                    Err(FieldError::UnknownProperty) => {
                        debug!(device_id, object = %object.id, property = %prop, "Property not supported");
                        tally.unsupported += 1;
                        let _ = self.registry.mark_unsupported(device_id, object.id, prop);
                        continue;
                    }
                    Err(e) => {
                        debug!(device_id, object = %object.id, property = %prop, error = %e, "Read failed");
                        tally.failures += 1;
                        continue;
                    }
                };

                let is_present_value = prop == property::PRESENT_VALUE;
                if is_present_value && object.read_units && unit.is_none() {
                    unit = self.read_units(&plan.target, object.id, timeout).await;
                    tally.reads += 1;
                }

                let timestamp = Utc::now();
                let reading_unit = if is_present_value { unit.clone() } else { None };
                let change = match self.registry.update_property(
                    device_id,
                    object.id,
                    prop,
                    value.clone(),
                    reading_unit.clone(),
                    timestamp,
                ) {
                    Ok(change) => change,
                    Err(e) => {
                        // Device removed while the cycle was running
                        debug!(device_id, error = %e, "Dropping reads for vanished device");
                        break 'objects;
                    }
                };
                if !change.should_notify() {
                    continue;
                }

                tally.changes += 1;
                let notification = ChangeNotification {
                    key: TupleKey::new(device_id, object.id, prop.clone()),
                    value,
                    unit: reading_unit,
                    timestamp,
                    device_name: plan.device_name.clone(),
                    device_address: plan.target.address.clone(),
                    object_name: object.name.clone(),
                };
                if self.changes.send(notification).await.is_err() {
                    warn!(device_id, "Publisher queue closed, change dropped");
                }
            }
        }
        tally
    }

    async fn read_units(
        &self,
        target: &DeviceTarget,
        object: ObjectId,
        timeout: Duration,
    ) -> Option<String> {
        match read_bounded(self.client.as_ref(), target, object, property::UNITS, timeout).await {
            Ok(value) => Some(value.to_string()),
            Err(FieldError::UnknownProperty) => {
                let _ = self
                    .registry
                    .mark_unsupported(target.device_id, object, property::UNITS);
                None
            }
            Err(_) => None,
        }
    }
}

/// Periodic polling
///
/// A tick that fires while the previous cycle is still running is skipped.
pub struct PollingService {
    poller: Arc<Poller>,
    interval: Duration,
    in_flight: Option<JoinHandle<()>>,
}

impl PollingService {
    pub fn new(poller: Arc<Poller>, interval: Duration) -> Self {
        Self {
            poller,
            interval,
            in_flight: None,
        }
    }
}

#[async_trait]
impl Service for PollingService {
    fn spec(&self) -> ServiceSpec {
        ServiceSpec::new("bacnet/polling", "Poller")
            .with_tick_interval(self.interval)
            .with_description("Cyclic property reads of enabled devices")
    }

    async fn on_start(&mut self, _ctx: &ServiceContext) -> ServiceResult<()> {
        info!(interval_secs = self.interval.as_secs(), "Polling service started");
        Ok(())
    }

    async fn on_stop(&mut self, _ctx: &ServiceContext) -> ServiceResult<()> {
        if let Some(cycle) = self.in_flight.take() {
            let _ = cycle.await;
        }
        Ok(())
    }

    async fn on_tick(&mut self, _ctx: &ServiceContext) -> ServiceResult<()> {
        if self.poller.is_running() {
            info!("Previous poll cycle still running, skipping tick");
            return Ok(());
        }
        let poller = Arc::clone(&self.poller);
        self.in_flight = Some(tokio::spawn(async move {
            if let Err(e) = poller.run_cycle().await {
                debug!(error = %e, "Poll tick coalesced");
            }
        }));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bacnet::sim::{SimDevice, SimulatedNetwork};
    use crate::bacnet::types::{DeviceAnnouncement, ObjectType};
    use crate::registry::ObjectDescriptor;

    fn ai(instance: u32) -> ObjectId {
        ObjectId::new(ObjectType::AnalogInput, instance)
    }

    struct Rig {
        network: SimulatedNetwork,
        registry: Arc<DeviceRegistry>,
        poller: Arc<Poller>,
        rx: mpsc::Receiver<ChangeNotification>,
    }

    fn rig(device_ids: &[u32], properties: &[&str]) -> Rig {
        rig_with(device_ids, properties, PollingConfig::default().max_concurrent_devices)
    }

    fn rig_with(device_ids: &[u32], properties: &[&str], max_concurrent_devices: usize) -> Rig {
        let network = SimulatedNetwork::new();
        let registry = Arc::new(DeviceRegistry::in_memory());
        for &id in device_ids {
            network.add_device(
                SimDevice::new(id, format!("10.0.0.{id}:47808"))
                    .with_object(ObjectType::AnalogInput, 1, Some("Zone Temp"), PropertyValue::Real(21.0), Some("degrees-celsius"))
                    .with_object(ObjectType::AnalogInput, 2, Some("Supply Temp"), PropertyValue::Real(14.0), Some("degrees-celsius")),
            );
            registry.upsert_device(&DeviceAnnouncement {
                device_id: id,
                address: format!("10.0.0.{id}:47808"),
                network: None,
                max_apdu: 1476,
                vendor_id: 0,
                segmentation: "segmented-both".into(),
            });
            registry
                .upsert_objects(
                    id,
                    vec![
                        ObjectDescriptor { id: ai(1), name: Some("Zone Temp".into()) },
                        ObjectDescriptor { id: ai(2), name: Some("Supply Temp".into()) },
                    ],
                )
                .unwrap();
        }
        let (tx, rx) = mpsc::channel(64);
        let poller = Arc::new(Poller::new(
            Arc::new(network.clone()),
            Arc::clone(&registry),
            Arc::new(DeviceLocks::new()),
            tx,
            PollingConfig {
                read_timeout_ms: 100,
                properties: properties.iter().map(|p| p.to_string()).collect(),
                max_concurrent_devices,
                ..PollingConfig::default()
            },
        ));
        Rig {
            network,
            registry,
            poller,
            rx,
        }
    }

    fn drain(rx: &mut mpsc::Receiver<ChangeNotification>) -> Vec<ChangeNotification> {
        let mut out = Vec::new();
        while let Ok(n) = rx.try_recv() {
            out.push(n);
        }
        out
    }

    #[tokio::test]
    async fn test_only_first_reads_and_changes_are_notified() {
        let mut rig = rig(&[5], &[property::PRESENT_VALUE]);

        let first = rig.poller.run_cycle().await.unwrap();
        assert_eq!(first.changes, 2);
        let notifications = drain(&mut rig.rx);
        assert_eq!(notifications.len(), 2);
        assert_eq!(notifications[0].unit.as_deref(), Some("degrees-celsius"));
        assert_eq!(notifications[0].device_name, "device-5");
        assert_eq!(notifications[0].object_name.as_deref(), Some("Zone Temp"));

        let second = rig.poller.run_cycle().await.unwrap();
        assert_eq!(second.changes, 0);
        assert!(drain(&mut rig.rx).is_empty());

        rig.network.set_value(5, ai(2), property::PRESENT_VALUE, PropertyValue::Real(15.5));
        rig.poller.run_cycle().await.unwrap();
        let notifications = drain(&mut rig.rx);
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0].key, TupleKey::new(5, ai(2), property::PRESENT_VALUE));
        assert_eq!(notifications[0].value, PropertyValue::Real(15.5));
    }

    #[tokio::test]
    async fn test_units_are_read_once() {
        let rig = rig(&[5], &[property::PRESENT_VALUE]);
        rig.poller.run_cycle().await.unwrap();
        let after_first = rig.network.read_count();
        assert_eq!(after_first, 4);

        rig.poller.run_cycle().await.unwrap();
        assert_eq!(rig.network.read_count() - after_first, 2);
    }

    #[tokio::test]
    async fn test_failing_device_does_not_abort_cycle() {
        let mut rig = rig(&[5, 6], &[property::PRESENT_VALUE]);
        rig.poller.run_cycle().await.unwrap();
        drain(&mut rig.rx);
        let before = rig
            .registry
            .get_property(5, ai(1), property::PRESENT_VALUE)
            .unwrap()
            .unwrap();

        rig.network.set_unreachable(5, true);
        rig.network.set_value(5, ai(1), property::PRESENT_VALUE, PropertyValue::Real(30.0));
        rig.network.set_value(6, ai(1), property::PRESENT_VALUE, PropertyValue::Real(30.0));
        let report = rig.poller.run_cycle().await.unwrap();

        assert_eq!(report.failures, 2);
        let notifications = drain(&mut rig.rx);
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0].key.device_id, 6);
        let after = rig
            .registry
            .get_property(5, ai(1), property::PRESENT_VALUE)
            .unwrap()
            .unwrap();
        assert_eq!(after, before);
    }

    #[tokio::test]
    async fn test_unsupported_property_is_skipped_afterwards() {
        let rig = rig(&[5], &[property::PRESENT_VALUE, "cov-increment"]);
        let first = rig.poller.run_cycle().await.unwrap();
        assert_eq!(first.unsupported, 2);

        let second = rig.poller.run_cycle().await.unwrap();
        assert_eq!(second.unsupported, 0);
        assert_eq!(second.reads, 2);
    }

    #[tokio::test]
    async fn test_disabled_device_is_not_polled() {
        let mut rig = rig(&[5, 6], &[property::PRESENT_VALUE]);
        rig.registry.set_enabled(6, false).unwrap();
        let report = rig.poller.run_cycle().await.unwrap();
        assert_eq!(report.devices, 1);
        assert!(drain(&mut rig.rx).iter().all(|n| n.key.device_id == 5));
    }

    #[tokio::test]
    async fn test_overlapping_cycle_is_rejected_and_reads_are_serialized_per_device() {
        let rig = rig(&[5, 6], &[property::PRESENT_VALUE, property::STATUS_FLAGS]);
        rig.network.set_latency(Duration::from_millis(20));

        let running = {
            let poller = Arc::clone(&rig.poller);
            tokio::spawn(async move { poller.run_cycle().await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(matches!(rig.poller.run_cycle().await, Err(GatewayError::Busy("polling"))));

        let report = running.await.unwrap().unwrap();
        assert_eq!(report.devices, 2);
        assert_eq!(rig.network.max_concurrent_requests(5), 1);
        assert_eq!(rig.network.max_concurrent_requests(6), 1);
        assert!(!rig.poller.is_running());
    }

    #[tokio::test]
    async fn test_device_fan_out_is_bounded() {
        let serial = rig_with(&[5, 6, 7], &[property::PRESENT_VALUE], 1);
        serial.network.set_latency(Duration::from_millis(5));
        let report = serial.poller.run_cycle().await.unwrap();
        assert_eq!(report.devices, 3);
        assert_eq!(serial.network.max_concurrent_devices(), 1);

        let parallel = rig_with(&[5, 6, 7], &[property::PRESENT_VALUE], 3);
        parallel.network.set_latency(Duration::from_millis(5));
        parallel.poller.run_cycle().await.unwrap();
        assert!(parallel.network.max_concurrent_devices() > 1);
    }

    #[tokio::test]
    async fn test_ticks_during_a_running_cycle_are_skipped() {
        let rig = rig_with(&[5, 6, 7], &[property::PRESENT_VALUE], 1);
        rig.network.set_latency(Duration::from_millis(20));
        let manager = gateway_runtime::ServiceManager::new();

        manager
            .spawn(PollingService::new(Arc::clone(&rig.poller), Duration::from_millis(20)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;
        manager.shutdown_all().await.unwrap();

        // A cycle takes 120ms or more; queued ticks would start ~20 cycles.
        // Overlapping cycles would also show up as two busy devices.
        let cycles = rig.poller.status().runs;
        assert!((1..=4).contains(&cycles), "unexpected cycle count {cycles}");
        assert_eq!(rig.network.max_concurrent_devices(), 1);
        assert!(!rig.poller.is_running());
    }
}
