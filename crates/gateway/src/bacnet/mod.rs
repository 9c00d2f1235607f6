//! BACnet side of the gateway
//!
//! Everything that talks to field devices: discovery sweeps, object-list
//! enumeration, cyclic polling, and foreign-device registration. All
//! requests go through a [`FieldClient`].

pub mod client;
pub mod discovery;
pub mod enumerator;
pub mod foreign;
pub mod poller;
pub mod sim;
pub mod types;

pub use client::{FieldClient, FieldResult};
pub use discovery::{DiscoveryCoordinator, DiscoveryService, SweepReport};
pub use enumerator::{EnumerationReport, EnumerationService, ObjectEnumerator};
pub use foreign::ForeignDeviceService;
pub use poller::{ChangeNotification, CycleReport, Poller, PollingService};
pub use sim::{SimDevice, SimulatedNetwork};
pub use types::*;

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Per-device request serialization
///
/// Enumeration, polling, and manual reads of one device never overlap;
/// requests to different devices run freely.
#[derive(Default)]
pub struct DeviceLocks {
    locks: DashMap<u32, Arc<Mutex<()>>>,
}

impl DeviceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `device_id`
    pub async fn lock(&self, device_id: u32) -> OwnedMutexGuard<()> {
        // Clone out of the map before awaiting so no shard lock is held
        let lock = Arc::clone(self.locks.entry(device_id).or_default().value());
        lock.lock_owned().await
    }

    /// Drop the lock entry of a removed device
    pub fn forget(&self, device_id: u32) {
        self.locks.remove(&device_id);
    }
}
