//! Discovery Coordinator
//!
//! Runs Who-Is sweeps and upserts every announcing device into the registry.
//! Sweeps are single-flight: a manual trigger during a sweep is rejected with
//! `Busy`, a periodic tick during a sweep is skipped.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use gateway_runtime::{EventPublisher, Service, ServiceContext, ServiceResult, ServiceSpec};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::activity::{Activity, ActivityStatus, Outcome};
use crate::config::DiscoveryConfig;
use crate::error::{GatewayError, Result};
use crate::events;
use crate::registry::DeviceRegistry;

use super::client::FieldClient;
use super::types::DeviceRange;

const SOURCE: &str = "bacnet/discovery";

/// Result of one sweep
#[derive(Debug, Clone, Serialize)]
pub struct SweepReport {
    pub range: DeviceRange,
    /// Distinct devices accepted during the sweep
    pub found: usize,
    /// Devices seen for the first time
    pub new_devices: Vec<u32>,
    /// Announcements dropped as out of range or blocked
    pub ignored: usize,
    pub outcome: Outcome,
    pub duration_ms: u64,
}

pub struct DiscoveryCoordinator {
    client: Arc<dyn FieldClient>,
    registry: Arc<DeviceRegistry>,
    events: EventPublisher,
    activity: Activity,
    blocked: BTreeSet<u32>,
    range: DeviceRange,
    timeout: Duration,
}

impl DiscoveryCoordinator {
    pub fn new(
        client: Arc<dyn FieldClient>,
        registry: Arc<DeviceRegistry>,
        events: EventPublisher,
        config: &DiscoveryConfig,
    ) -> Self {
        Self {
            client,
            registry,
            events,
            activity: Activity::new("discovery"),
            blocked: config.blocked_devices.iter().copied().collect(),
            range: config.range(),
            timeout: config.timeout(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.activity.is_running()
    }

    pub fn status(&self) -> ActivityStatus {
        self.activity.status()
    }

    /// Run one sweep over `range` (configured range when `None`), collecting
    /// announcements for up to `timeout`
    ///
    /// Transport failures are not errors: the sweep ends `Failed` having
    /// found nothing, and the next scheduled sweep tries again.
    pub async fn run_sweep(
        &self,
        range: Option<DeviceRange>,
        timeout: Option<Duration>,
    ) -> Result<SweepReport> {
        let guard = self
            .activity
            .try_begin()
            .ok_or(GatewayError::Busy("discovery"))?;

        let range = range.unwrap_or(self.range);
        let timeout = timeout.unwrap_or(self.timeout);
        let started = Instant::now();
        let mut report = SweepReport {
            range,
            found: 0,
            new_devices: Vec::new(),
            ignored: 0,
            outcome: Outcome::Completed,
            duration_ms: 0,
        };

        info!(
            low = range.low,
            high = range.high,
            timeout_ms = timeout.as_millis() as u64,
            "Starting discovery sweep"
        );

        let mut announcements = match self.client.discover(range, timeout).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, "Discovery sweep failed");
                report.outcome = Outcome::Failed;
                report.duration_ms = started.elapsed().as_millis() as u64;
                guard.finish(Outcome::Failed);
                return Ok(report);
            }
        };

        let deadline = sweep_deadline(tokio::time::Instant::now(), timeout);
        let mut seen = BTreeSet::new();
        loop {
            let announcement = match tokio::time::timeout_at(deadline, announcements.next()).await {
                Ok(Some(announcement)) => announcement,
                Ok(None) => break,
                Err(_) => {
                    report.outcome = Outcome::TimedOut;
                    break;
                }
            };

            let device_id = announcement.device_id;
            if !range.contains(device_id) {
                debug!(device_id, "Ignoring announcement outside sweep range");
                report.ignored += 1;
                continue;
            }
            if self.blocked.contains(&device_id) {
                debug!(device_id, "Ignoring announcement from blocked device");
                report.ignored += 1;
                continue;
            }

            let upsert = self.registry.upsert_device(&announcement);
            if !seen.insert(device_id) {
                continue;
            }
            if upsert.created {
                report.new_devices.push(device_id);
                events::emit_device(&self.events, events::DEVICE_DISCOVERED, SOURCE, &upsert.device);
            }
        }

        drop(announcements);
        report.found = seen.len();
        report.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            found = report.found,
            new = report.new_devices.len(),
            ignored = report.ignored,
            outcome = ?report.outcome,
            "Discovery sweep finished"
        );
        guard.finish(report.outcome);
        Ok(report)
    }
}

/// `now + timeout`, saturating at a far-future deadline for absurd timeouts
fn sweep_deadline(now: tokio::time::Instant, timeout: Duration) -> tokio::time::Instant {
    const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);
    now.checked_add(timeout.min(FAR_FUTURE)).unwrap_or(now)
}

/// Periodic discovery
///
/// The first tick fires at start, so a sweep runs as soon as the service is
/// up. Sweeps run on their own task; the service loop stays responsive.
pub struct DiscoveryService {
    coordinator: Arc<DiscoveryCoordinator>,
    interval: Duration,
    in_flight: Option<JoinHandle<()>>,
}

impl DiscoveryService {
    pub fn new(coordinator: Arc<DiscoveryCoordinator>, interval: Duration) -> Self {
        Self {
            coordinator,
            interval,
            in_flight: None,
        }
    }
}

#[async_trait]
impl Service for DiscoveryService {
    fn spec(&self) -> ServiceSpec {
        ServiceSpec::new(SOURCE, "Discovery Coordinator")
            .with_tick_interval(self.interval)
            .with_description("Periodic Who-Is sweeps feeding the device registry")
    }

    async fn on_start(&mut self, _ctx: &ServiceContext) -> ServiceResult<()> {
        info!(interval_secs = self.interval.as_secs(), "Discovery service started");
        Ok(())
    }

    async fn on_stop(&mut self, _ctx: &ServiceContext) -> ServiceResult<()> {
        // Let an in-flight sweep finish; it is bounded by its own timeout
        if let Some(sweep) = self.in_flight.take() {
            let _ = sweep.await;
        }
        Ok(())
    }

    async fn on_tick(&mut self, _ctx: &ServiceContext) -> ServiceResult<()> {
        if self.coordinator.is_running() {
            info!("Discovery sweep still running, skipping tick");
            return Ok(());
        }
        let coordinator = Arc::clone(&self.coordinator);
        self.in_flight = Some(tokio::spawn(async move {
            if let Err(e) = coordinator.run_sweep(None, None).await {
                debug!(error = %e, "Scheduled sweep coalesced");
            }
        }));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bacnet::sim::{SimDevice, SimulatedNetwork};
    use crate::bacnet::types::DeviceAnnouncement;
    use gateway_runtime::ServiceManager;

    fn setup(
        network: &SimulatedNetwork,
        config: DiscoveryConfig,
    ) -> (Arc<DiscoveryCoordinator>, Arc<DeviceRegistry>, ServiceManager) {
        let registry = Arc::new(DeviceRegistry::in_memory());
        let manager = ServiceManager::new();
        let coordinator = Arc::new(DiscoveryCoordinator::new(
            Arc::new(network.clone()),
            Arc::clone(&registry),
            manager.event_publisher(),
            &config,
        ));
        (coordinator, registry, manager)
    }

    fn network_with(ids: &[u32]) -> SimulatedNetwork {
        let network = SimulatedNetwork::new();
        for id in ids {
            network.add_device(SimDevice::new(*id, format!("10.0.0.{}:47808", id % 250)));
        }
        network
    }

    #[tokio::test]
    async fn test_sweep_registers_devices_in_range() {
        let network = network_with(&[5, 42, 500]);
        let (coordinator, registry, _manager) = setup(&network, DiscoveryConfig::default());

        let report = coordinator
            .run_sweep(Some(DeviceRange::new(1, 100)), Some(Duration::from_millis(200)))
            .await
            .unwrap();

        assert_eq!(report.found, 2);
        assert_eq!(report.new_devices, vec![5, 42]);
        assert_eq!(report.outcome, Outcome::Completed);
        let devices = registry.list_devices();
        assert_eq!(devices.len(), 2);
        assert!(devices.iter().all(|d| d.enabled));
    }

    #[tokio::test]
    async fn test_repeat_sweep_updates_without_duplicates() {
        let network = network_with(&[5]);
        let (coordinator, registry, _manager) = setup(&network, DiscoveryConfig::default());

        coordinator.run_sweep(None, None).await.unwrap();
        let first_seen = registry.get_device(5).unwrap().last_seen;
        let report = coordinator.run_sweep(None, None).await.unwrap();

        assert_eq!(report.found, 1);
        assert!(report.new_devices.is_empty());
        assert_eq!(registry.list_devices().len(), 1);
        assert!(registry.get_device(5).unwrap().last_seen > first_seen);
    }

    #[tokio::test]
    async fn test_stray_and_blocked_announcements_are_ignored() {
        let network = network_with(&[5, 7]);
        network.push_stray_announcement(DeviceAnnouncement {
            device_id: 900,
            address: "10.0.9.0:47808".into(),
            network: None,
            max_apdu: 480,
            vendor_id: 1,
            segmentation: "no-segmentation".into(),
        });
        let config = DiscoveryConfig {
            blocked_devices: vec![7],
            ..DiscoveryConfig::default()
        };
        let (coordinator, registry, _manager) = setup(&network, config);

        let report = coordinator
            .run_sweep(Some(DeviceRange::new(1, 100)), None)
            .await
            .unwrap();
        assert_eq!(report.found, 1);
        assert_eq!(report.ignored, 2);
        assert!(!registry.contains(900));
        assert!(!registry.contains(7));
    }

    #[tokio::test]
    async fn test_transport_failure_finds_nothing() {
        let network = network_with(&[5]);
        network.set_discovery_failure(true);
        let (coordinator, registry, _manager) = setup(&network, DiscoveryConfig::default());

        let report = coordinator.run_sweep(None, None).await.unwrap();
        assert_eq!(report.found, 0);
        assert_eq!(report.outcome, Outcome::Failed);
        assert!(registry.list_devices().is_empty());
        assert!(!coordinator.is_running());

        network.set_discovery_failure(false);
        assert_eq!(coordinator.run_sweep(None, None).await.unwrap().found, 1);
    }

    #[tokio::test]
    async fn test_manual_trigger_during_sweep_is_busy() {
        let network = network_with(&[5, 6, 7]);
        network.set_latency(Duration::from_millis(30));
        let (coordinator, _registry, _manager) = setup(&network, DiscoveryConfig::default());

        let running = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move { coordinator.run_sweep(None, Some(Duration::from_secs(1))).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let second = coordinator.run_sweep(None, None).await;
        assert!(matches!(second, Err(GatewayError::Busy("discovery"))));

        let report = running.await.unwrap().unwrap();
        assert_eq!(report.found, 3);
    }

    #[tokio::test]
    async fn test_slow_responses_are_cut_at_timeout() {
        let network = network_with(&[1, 2, 3, 4, 5]);
        network.set_latency(Duration::from_millis(40));
        let (coordinator, registry, _manager) = setup(&network, DiscoveryConfig::default());

        let report = coordinator
            .run_sweep(None, Some(Duration::from_millis(100)))
            .await
            .unwrap();
        assert_eq!(report.outcome, Outcome::TimedOut);
        assert!(report.found >= 1 && report.found < 5);
        assert_eq!(registry.list_devices().len(), report.found);
    }

    #[tokio::test]
    async fn test_new_devices_are_announced_on_the_bus() {
        let network = network_with(&[5]);
        let (coordinator, _registry, manager) = setup(&network, DiscoveryConfig::default());
        let mut rx = manager.event_publisher().subscribe();

        coordinator.run_sweep(None, None).await.unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type, events::DEVICE_DISCOVERED);
        let status: crate::registry::DeviceStatus = event.parse_data().unwrap();
        assert_eq!(status.device_id, 5);
    }

    #[tokio::test]
    async fn test_huge_timeout_does_not_overflow_the_deadline() {
        let network = network_with(&[5, 42]);
        let (coordinator, _registry, _manager) = setup(&network, DiscoveryConfig::default());

        let report = coordinator
            .run_sweep(None, Some(Duration::MAX))
            .await
            .unwrap();
        assert_eq!(report.found, 2);
        assert_eq!(report.outcome, Outcome::Completed);

        let now = tokio::time::Instant::now();
        assert!(sweep_deadline(now, Duration::from_secs(u64::MAX)) > now);
        assert_eq!(sweep_deadline(now, Duration::from_secs(2)), now + Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_ticks_during_a_running_sweep_are_skipped() {
        let network = network_with(&[1, 2, 3, 4, 5]);
        network.set_latency(Duration::from_millis(30));
        let (coordinator, _registry, manager) = setup(&network, DiscoveryConfig::default());

        manager
            .spawn(DiscoveryService::new(Arc::clone(&coordinator), Duration::from_millis(20)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;
        manager.shutdown_all().await.unwrap();

        // Each sweep takes ~150ms; queued ticks would start ~20 sweeps
        let sweeps = network.sweep_count();
        assert!((1..=4).contains(&sweeps), "unexpected sweep count {sweeps}");
        assert_eq!(network.max_concurrent_sweeps(), 1);
        assert_eq!(coordinator.status().runs, sweeps as u64);
        assert!(!coordinator.is_running());
    }
}
