//! Event types exchanged between gateway services
//!
//! Device lifecycle events carry a [`DeviceStatus`] as their data so the
//! publisher can forward them without going back to the registry.

use gateway_runtime::EventPublisher;
use tracing::debug;

use crate::registry::{Device, DeviceStatus};

pub const DEVICE_DISCOVERED: &str = "device/discovered";
pub const DEVICE_ENUMERATED: &str = "device/enumerated";
pub const DEVICE_ENABLED: &str = "device/enabled";
pub const DEVICE_DISABLED: &str = "device/disabled";
pub const DEVICE_REMOVED: &str = "device/removed";

/// Subscription pattern covering every device lifecycle event
pub const DEVICE_ALL: &str = "device/*";

/// Events whose status is worth publishing
pub fn publishes_status(event_type: &str) -> bool {
    matches!(
        event_type,
        DEVICE_DISCOVERED | DEVICE_ENUMERATED | DEVICE_ENABLED | DEVICE_DISABLED
    )
}

pub fn emit_device(events: &EventPublisher, event_type: &str, source: &str, device: &Device) {
    let status: DeviceStatus = device.status();
    let data = match serde_json::to_value(&status) {
        Ok(data) => data,
        Err(e) => {
            debug!(device_id = device.device_id, error = %e, "Could not encode device event");
            return;
        }
    };
    if let Err(e) = events.emit(event_type, source, data) {
        debug!(device_id = device.device_id, event_type, error = %e, "Device event not delivered");
    }
}
