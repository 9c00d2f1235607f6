//! Publisher
//!
//! Turns change notifications and device status updates into bus messages.
//! While the bus is down, messages collapse into a bounded buffer holding the
//! latest message per tuple (or per device for status); on reconnect the
//! buffer is replayed oldest first before live forwarding resumes.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use gateway_runtime::{Event, Service, ServiceContext, ServiceError, ServiceResult, ServiceSpec};
use serde_json::json;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bacnet::poller::ChangeNotification;
use crate::events;
use crate::registry::{DeviceStatus, TupleKey};

use super::bus::{Bus, ConnectionState};
use super::topic::TopicMapper;

/// Counters shared with the gateway status report
#[derive(Debug, Default)]
pub struct PublisherStats {
    pub published: AtomicU64,
    pub failed: AtomicU64,
    pub evicted: AtomicU64,
    pub pending: AtomicUsize,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum PendingKey {
    Value(TupleKey),
    Status(u32),
}

#[derive(Debug, Clone)]
struct Message {
    topic: String,
    payload: Vec<u8>,
    retain: bool,
}

/// Latest-message-per-key buffer, bounded by key count
struct PendingBuffer {
    capacity: usize,
    next_seq: u64,
    entries: HashMap<PendingKey, (u64, Message)>,
    order: BTreeMap<u64, PendingKey>,
}

impl PendingBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            next_seq: 0,
            entries: HashMap::new(),
            order: BTreeMap::new(),
        }
    }

    /// Store `message` as the latest for `key`; returns the key evicted to make room
    fn insert(&mut self, key: PendingKey, message: Message) -> Option<PendingKey> {
        let mut evicted = None;
        if let Some((seq, _)) = self.entries.remove(&key) {
            self.order.remove(&seq);
        } else if self.entries.len() >= self.capacity {
            if let Some((_, oldest)) = self.order.pop_first() {
                self.entries.remove(&oldest);
                evicted = Some(oldest);
            }
        }
        self.next_seq += 1;
        self.order.insert(self.next_seq, key.clone());
        self.entries.insert(key, (self.next_seq, message));
        evicted
    }

    fn oldest(&self) -> Option<(u64, Message)> {
        let (seq, key) = self.order.first_key_value()?;
        self.entries.get(key).map(|(_, message)| (*seq, message.clone()))
    }

    fn remove_seq(&mut self, seq: u64) {
        if let Some(key) = self.order.remove(&seq) {
            self.entries.remove(&key);
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub struct Publisher {
    bus: Arc<dyn Bus>,
    mapper: Arc<TopicMapper>,
    connection: watch::Receiver<ConnectionState>,
    retain: bool,
    buffer: PendingBuffer,
    stats: Arc<PublisherStats>,
}

impl Publisher {
    pub fn new(
        bus: Arc<dyn Bus>,
        mapper: Arc<TopicMapper>,
        retain: bool,
        buffer_capacity: usize,
        stats: Arc<PublisherStats>,
    ) -> Self {
        let connection = bus.connection();
        Self {
            bus,
            mapper,
            connection,
            retain,
            buffer: PendingBuffer::new(buffer_capacity),
            stats,
        }
    }

    fn is_connected(&self) -> bool {
        self.connection.borrow().is_connected()
    }

    pub async fn on_change(&mut self, change: ChangeNotification) {
        let topic = self.mapper.resolve(&change.key);
        let mut payload = json!({
            "value": change.value.to_json(),
            "timestamp": change.timestamp.to_rfc3339(),
            "device": {
                "id": change.key.device_id,
                "name": change.device_name,
                "address": change.device_address,
            },
            "object": {
                "type": change.key.object.object_type.name(),
                "instance": change.key.object.instance,
                "name": change.object_name,
            },
            "property": change.key.property,
        });
        if let Some(unit) = &change.unit {
            payload["unit"] = json!(unit);
        }
        let message = Message {
            topic,
            payload: payload.to_string().into_bytes(),
            retain: self.retain,
        };
        self.deliver(PendingKey::Value(change.key), message).await;
    }

    pub async fn on_status(&mut self, status: DeviceStatus) {
        let payload = match serde_json::to_vec(&status) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(device_id = status.device_id, error = %e, "Could not encode device status");
                return;
            }
        };
        let message = Message {
            topic: self.mapper.status_topic(status.device_id),
            payload,
            retain: true,
        };
        self.deliver(PendingKey::Status(status.device_id), message).await;
    }

    async fn deliver(&mut self, key: PendingKey, message: Message) {
        if self.buffer.is_empty() && self.is_connected() {
            if self.send(&message).await {
                return;
            }
            self.hold(key, message);
            return;
        }
        self.hold(key, message);
        if self.is_connected() {
            self.flush().await;
        }
    }

    async fn send(&self, message: &Message) -> bool {
        match self
            .bus
            .publish(&message.topic, message.payload.clone(), message.retain)
            .await
        {
            Ok(()) => {
                self.stats.published.fetch_add(1, Ordering::Relaxed);
                debug!(topic = %message.topic, "Published");
                true
            }
            Err(e) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                debug!(topic = %message.topic, error = %e, "Publish failed, buffering");
                false
            }
        }
    }

    fn hold(&mut self, key: PendingKey, message: Message) {
        if let Some(evicted) = self.buffer.insert(key, message) {
            self.stats.evicted.fetch_add(1, Ordering::Relaxed);
            warn!(?evicted, capacity = self.buffer.capacity, "Publish buffer full, dropped oldest pending message");
        }
        self.stats.pending.store(self.buffer.len(), Ordering::Relaxed);
    }

    /// Replay buffered messages oldest first; stops at the first failure
    pub async fn flush(&mut self) {
        let mut flushed = 0usize;
        while let Some((seq, message)) = self.buffer.oldest() {
            if !self.send(&message).await {
                break;
            }
            self.buffer.remove_seq(seq);
            flushed += 1;
        }
        self.stats.pending.store(self.buffer.len(), Ordering::Relaxed);
        if flushed > 0 {
            info!(flushed, remaining = self.buffer.len(), "Flushed buffered messages");
        }
    }

    /// Forward notifications until `stop` fires or both inputs close
    pub async fn run(
        mut self,
        mut changes: mpsc::Receiver<ChangeNotification>,
        mut statuses: mpsc::Receiver<DeviceStatus>,
        mut stop: oneshot::Receiver<()>,
    ) {
        let mut connection = self.connection.clone();
        let mut last_state = *connection.borrow();
        let mut signal_alive = true;
        if self.is_connected() {
            self.flush().await;
        }

        loop {
            tokio::select! {
                _ = &mut stop => break,

                changed = connection.changed(), if signal_alive => {
                    if changed.is_err() {
                        warn!("Bus connection signal dropped");
                        signal_alive = false;
                        continue;
                    }
                    let state = *connection.borrow_and_update();
                    if state.is_connected() {
                        info!(pending = self.buffer.len(), "Bus connected");
                        self.flush().await;
                    } else if state.is_loss_from(last_state) {
                        warn!(?state, "Bus disconnected, buffering messages");
                    } else {
                        debug!(?state, pending = self.buffer.len(), "Bus still down");
                    }
                    last_state = state;
                }

                Some(change) = changes.recv() => self.on_change(change).await,

                Some(status) = statuses.recv() => self.on_status(status).await,

                else => break,
            }
        }

        // Forward what the poller already queued before stopping
        while let Ok(change) = changes.try_recv() {
            self.on_change(change).await;
        }
        if self.is_connected() {
            self.flush().await;
        }
        if !self.buffer.is_empty() {
            warn!(pending = self.buffer.len(), "Stopping with unpublished messages");
        }
    }
}

/// Runs the [`Publisher`] and feeds it device lifecycle events
pub struct PublisherService {
    publisher: Option<Publisher>,
    changes: Option<mpsc::Receiver<ChangeNotification>>,
    statuses: mpsc::Sender<DeviceStatus>,
    status_rx: Option<mpsc::Receiver<DeviceStatus>>,
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl PublisherService {
    pub fn new(
        publisher: Publisher,
        changes: mpsc::Receiver<ChangeNotification>,
        status_capacity: usize,
    ) -> Self {
        let (statuses, status_rx) = mpsc::channel(status_capacity.max(1));
        Self {
            publisher: Some(publisher),
            changes: Some(changes),
            statuses,
            status_rx: Some(status_rx),
            stop: None,
            task: None,
        }
    }
}

#[async_trait]
impl Service for PublisherService {
    fn spec(&self) -> ServiceSpec {
        ServiceSpec::new("mqtt/publisher", "Publisher")
            .subscribe(events::DEVICE_ALL)
            .with_description("Publishes value changes and device status to MQTT")
    }

    async fn on_start(&mut self, _ctx: &ServiceContext) -> ServiceResult<()> {
        let (Some(publisher), Some(changes), Some(statuses)) =
            (self.publisher.take(), self.changes.take(), self.status_rx.take())
        else {
            return Err(ServiceError::AlreadyRunning("mqtt/publisher".into()));
        };
        let (stop_tx, stop_rx) = oneshot::channel();
        self.stop = Some(stop_tx);
        self.task = Some(tokio::spawn(publisher.run(changes, statuses, stop_rx)));
        Ok(())
    }

    async fn on_stop(&mut self, _ctx: &ServiceContext) -> ServiceResult<()> {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        Ok(())
    }

    async fn on_event(&mut self, _ctx: &ServiceContext, event: Event) -> ServiceResult<()> {
        if !events::publishes_status(&event.event_type) {
            return Ok(());
        }
        let status: DeviceStatus = event
            .parse_data()
            .map_err(|e| ServiceError::EventError(e.to_string()))?;
        self.statuses
            .send(status)
            .await
            .map_err(|_| ServiceError::ChannelClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bacnet::types::{ObjectId, ObjectType, PropertyValue, property};
    use crate::mqtt::bus::testing::RecordingBus;
    use crate::mqtt::topic::TopicMapping;
    use chrono::Utc;
    use std::time::Duration;

    fn change(device_id: u32, instance: u32, value: f64) -> ChangeNotification {
        ChangeNotification {
            key: TupleKey::new(
                device_id,
                ObjectId::new(ObjectType::AnalogInput, instance),
                property::PRESENT_VALUE,
            ),
            value: PropertyValue::Real(value),
            unit: Some("degrees-celsius".into()),
            timestamp: Utc::now(),
            device_name: format!("device-{device_id}"),
            device_address: "10.0.0.5:47808".into(),
            object_name: Some("Zone Temp".into()),
        }
    }

    fn publisher(bus: &Arc<RecordingBus>, capacity: usize) -> Publisher {
        Publisher::new(
            Arc::clone(bus) as Arc<dyn Bus>,
            Arc::new(TopicMapper::in_memory("bacnet")),
            true,
            capacity,
            Arc::new(PublisherStats::default()),
        )
    }

    #[tokio::test]
    async fn test_payload_shape() {
        let bus = Arc::new(RecordingBus::new(ConnectionState::Connected));
        let mut publisher = publisher(&bus, 16);
        publisher.on_change(change(5, 1, 21.5)).await;

        let published = bus.published();
        assert_eq!(published.len(), 1);
        let message = &published[0];
        assert_eq!(message.topic, "bacnet/5/analog_input/1/present-value");
        assert!(message.retain);
        assert_eq!(message.payload["value"], json!(21.5));
        assert_eq!(message.payload["unit"], json!("degrees-celsius"));
        assert_eq!(message.payload["device"]["id"], json!(5));
        assert_eq!(message.payload["object"]["type"], json!("analog-input"));
        assert_eq!(message.payload["object"]["name"], json!("Zone Temp"));
        assert_eq!(message.payload["property"], json!("present-value"));
    }

    #[tokio::test]
    async fn test_mapping_override_is_used() {
        let bus = Arc::new(RecordingBus::new(ConnectionState::Connected));
        let mapper = Arc::new(TopicMapper::in_memory("bacnet"));
        mapper
            .save(TopicMapping {
                device_id: 5,
                object_type: ObjectType::AnalogInput,
                object_instance: 1,
                mqtt_topic: "site/zone/temp".into(),
                custom_topic: None,
                enabled: true,
            })
            .unwrap();
        let mut publisher = Publisher::new(
            Arc::clone(&bus) as Arc<dyn Bus>,
            mapper,
            false,
            16,
            Arc::new(PublisherStats::default()),
        );
        publisher.on_change(change(5, 1, 21.5)).await;
        assert_eq!(bus.published()[0].topic, "site/zone/temp");
        assert!(!bus.published()[0].retain);
    }

    #[tokio::test]
    async fn test_reconnect_replays_latest_value_per_tuple() {
        let bus = Arc::new(RecordingBus::new(ConnectionState::Connected));
        let mut publisher = publisher(&bus, 16);

        bus.set_connected(false);
        publisher.on_change(change(5, 1, 20.0)).await;
        publisher.on_change(change(5, 2, 10.0)).await;
        publisher.on_change(change(5, 1, 21.0)).await;
        publisher.on_change(change(5, 1, 22.0)).await;
        assert!(bus.published().is_empty());
        assert_eq!(publisher.stats.pending.load(Ordering::Relaxed), 2);

        bus.set_connected(true);
        publisher.flush().await;

        let published = bus.take();
        assert_eq!(published.len(), 2);
        // Ordered by the last update of each tuple
        assert_eq!(published[0].topic, "bacnet/5/analog_input/2/present-value");
        assert_eq!(published[1].payload["value"], json!(22.0));
        assert_eq!(publisher.stats.pending.load(Ordering::Relaxed), 0);

        publisher.flush().await;
        assert!(bus.published().is_empty());
    }

    #[tokio::test]
    async fn test_buffer_overflow_evicts_oldest_key() {
        let bus = Arc::new(RecordingBus::new(ConnectionState::Disconnected));
        let mut publisher = publisher(&bus, 2);

        publisher.on_change(change(5, 1, 1.0)).await;
        publisher.on_change(change(5, 2, 2.0)).await;
        publisher.on_change(change(5, 3, 3.0)).await;
        assert_eq!(publisher.stats.evicted.load(Ordering::Relaxed), 1);

        bus.set_connected(true);
        publisher.flush().await;
        let topics: Vec<String> = bus.take().into_iter().map(|p| p.topic).collect();
        assert_eq!(
            topics,
            vec![
                "bacnet/5/analog_input/2/present-value",
                "bacnet/5/analog_input/3/present-value",
            ]
        );
    }

    #[tokio::test]
    async fn test_status_messages_are_retained_and_collapsed() {
        let bus = Arc::new(RecordingBus::new(ConnectionState::Disconnected));
        let mut publisher = publisher(&bus, 16);
        let status = |online: bool| DeviceStatus {
            device_id: 5,
            name: "AHU-1".into(),
            address: "10.0.0.5:47808".into(),
            online,
            last_seen: Utc::now(),
            object_count: 3,
        };

        publisher.on_status(status(true)).await;
        publisher.on_status(status(false)).await;
        bus.set_connected(true);
        publisher.flush().await;

        let published = bus.take();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].topic, "bacnet/5/status");
        assert!(published[0].retain);
        assert_eq!(published[0].payload["online"], json!(false));
        assert_eq!(published[0].payload["device_name"], json!("AHU-1"));
        assert!(published[0].payload.get("name").is_none());
    }

    #[tokio::test]
    async fn test_run_loop_flushes_on_connection_signal() {
        let bus = Arc::new(RecordingBus::new(ConnectionState::Disconnected));
        let publisher = publisher(&bus, 16);
        let (change_tx, change_rx) = mpsc::channel(8);
        let (_status_tx, status_rx) = mpsc::channel(8);
        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(publisher.run(change_rx, status_rx, stop_rx));

        change_tx.send(change(5, 1, 20.0)).await.unwrap();
        change_tx.send(change(5, 1, 23.0)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(bus.published().is_empty());

        bus.set_connected(true);
        tokio::time::sleep(Duration::from_millis(20)).await;
        let published = bus.take();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].payload["value"], json!(23.0));

        // Live forwarding resumes once the buffer is empty
        change_tx.send(change(5, 1, 24.0)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(bus.take().len(), 1);

        stop_tx.send(()).unwrap();
        task.await.unwrap();
    }
}
