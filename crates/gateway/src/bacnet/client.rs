//! Field-protocol collaborator
//!
//! The gateway never frames BACnet PDUs itself. Everything it needs from the
//! network is expressed by [`FieldClient`]; a BACnet/IP stack (or the
//! simulated network in [`super::sim`]) sits behind it.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::FieldError;

use super::types::{DeviceAnnouncement, DeviceRange, DeviceTarget, ObjectId, PropertyValue};

/// Result type for field-protocol calls
pub type FieldResult<T> = Result<T, FieldError>;

#[async_trait]
pub trait FieldClient: Send + Sync + 'static {
    /// Broadcast a Who-Is bounded by `range` and stream the I-Am responses
    /// received within `timeout`. The stream ends when the window closes.
    async fn discover(
        &self,
        range: DeviceRange,
        timeout: Duration,
    ) -> FieldResult<BoxStream<'static, DeviceAnnouncement>>;

    async fn read_property(
        &self,
        target: &DeviceTarget,
        object: ObjectId,
        property: &str,
    ) -> FieldResult<PropertyValue>;

    /// Read the device object's `object-list`
    async fn read_object_list(&self, target: &DeviceTarget) -> FieldResult<Vec<ObjectId>>;

    async fn write_property(
        &self,
        target: &DeviceTarget,
        object: ObjectId,
        property: &str,
        value: PropertyValue,
        priority: Option<u8>,
    ) -> FieldResult<()>;

    /// Register with a broadcast-relay node; a `ttl` of zero unregisters
    async fn register_foreign_device(&self, relay: &str, ttl: u16) -> FieldResult<()>;
}

/// `read_property` bounded by `timeout`; an expired bound is `FieldError::Timeout`
pub async fn read_bounded(
    client: &dyn FieldClient,
    target: &DeviceTarget,
    object: ObjectId,
    property: &str,
    timeout: Duration,
) -> FieldResult<PropertyValue> {
    tokio::time::timeout(timeout, client.read_property(target, object, property))
        .await
        .unwrap_or(Err(FieldError::Timeout))
}

/// `read_object_list` bounded by `timeout`
pub async fn read_object_list_bounded(
    client: &dyn FieldClient,
    target: &DeviceTarget,
    timeout: Duration,
) -> FieldResult<Vec<ObjectId>> {
    tokio::time::timeout(timeout, client.read_object_list(target))
        .await
        .unwrap_or(Err(FieldError::Timeout))
}
