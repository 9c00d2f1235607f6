//! MQTT side of the gateway: topic derivation, the publisher, and the
//! broker connection.

pub mod bus;
pub mod client;
pub mod publisher;
pub mod topic;

pub use bus::{Bus, ConnectionState};
pub use client::MqttBus;
pub use publisher::{Publisher, PublisherService, PublisherStats};
pub use topic::{MappingKey, TopicMapper, TopicMapping};
