//! Gateway Configuration
//!
//! Layered as: built-in defaults, then the TOML file, then `GATEWAY_*`
//! environment variables (`__` separates nested keys, e.g.
//! `GATEWAY_MQTT__BROKER=broker.local`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};

use crate::bacnet::sim::SimDeviceConfig;
use crate::bacnet::types::{DeviceRange, property};
use crate::error::{GatewayError, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub bacnet: BacnetConfig,
    pub discovery: DiscoveryConfig,
    pub enumeration: EnumerationConfig,
    pub polling: PollingConfig,
    pub mqtt: MqttConfig,
    pub storage: StorageConfig,
    pub simulation: SimulationConfig,
}

/// Local BACnet/IP endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BacnetConfig {
    /// Interface to bind to (e.g., "0.0.0.0" for all interfaces)
    pub interface: String,
    /// UDP port (default: 47808 / 0xBAC0)
    pub port: u16,
    /// Device instance the gateway itself answers as
    pub device_id: u32,
    pub device_name: String,
    /// Register with a BBMD to reach devices on other subnets
    pub foreign_device: Option<ForeignDeviceConfig>,
}

impl Default for BacnetConfig {
    fn default() -> Self {
        Self {
            interface: "0.0.0.0".to_string(),
            port: 47808,
            device_id: 999_999,
            device_name: "BACnet-MQTT Gateway".to_string(),
            foreign_device: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForeignDeviceConfig {
    pub address: String,
    #[serde(default = "default_bacnet_port")]
    pub port: u16,
    /// Registration time-to-live in seconds
    #[serde(default = "default_ttl")]
    pub ttl: u16,
}

fn default_bacnet_port() -> u16 {
    47808
}

fn default_ttl() -> u16 {
    30
}

impl ForeignDeviceConfig {
    pub fn relay_address(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    /// Renew at half the TTL, never more often than every 5 seconds
    pub fn renewal_interval(&self) -> Duration {
        Duration::from_secs((u64::from(self.ttl) / 2).max(5))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub enabled: bool,
    /// Seconds between periodic sweeps
    pub interval_secs: u64,
    /// Seconds to collect I-Am responses per sweep
    pub timeout_secs: u64,
    pub low_limit: Option<u32>,
    pub high_limit: Option<u32>,
    /// Device ids whose announcements are ignored
    pub blocked_devices: Vec<u32>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 300,
            timeout_secs: 5,
            low_limit: None,
            high_limit: None,
            blocked_devices: Vec::new(),
        }
    }
}

impl DiscoveryConfig {
    pub fn range(&self) -> DeviceRange {
        let full = DeviceRange::full();
        DeviceRange::new(
            self.low_limit.unwrap_or(full.low),
            self.high_limit.unwrap_or(full.high),
        )
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnumerationConfig {
    /// Bound for each individual read during enumeration
    pub read_timeout_ms: u64,
    /// Read `object-name` of every enumerated object
    pub read_object_names: bool,
    /// Read vendor/model/firmware from the device object
    pub read_device_info: bool,
    /// Re-enumerate every enabled device on this period; disabled when unset
    pub refresh_interval_secs: Option<u64>,
}

impl Default for EnumerationConfig {
    fn default() -> Self {
        Self {
            read_timeout_ms: 5000,
            read_object_names: true,
            read_device_info: true,
            refresh_interval_secs: None,
        }
    }
}

impl EnumerationConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Period of object-list refreshes; `None` enumerates only on discovery
    pub fn refresh_interval(&self) -> Option<Duration> {
        self.refresh_interval_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    /// Bound for each individual property read
    pub read_timeout_ms: u64,
    /// Properties read from every pollable object
    pub properties: Vec<String>,
    /// Devices polled at the same time within one cycle
    pub max_concurrent_devices: usize,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 60,
            read_timeout_ms: 5000,
            properties: vec![
                property::PRESENT_VALUE.to_string(),
                property::STATUS_FLAGS.to_string(),
            ],
            max_concurrent_devices: 8,
        }
    }
}

impl PollingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub broker: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub client_id: String,
    pub topic_prefix: String,
    pub qos: u8,
    pub retain: bool,
    pub keepalive_secs: u64,
    /// Distinct tuples held while the broker is unreachable
    pub buffer_capacity: usize,
    /// Poller to publisher queue depth
    pub channel_capacity: usize,
    pub reconnect_delay_secs: u64,
    pub max_reconnect_delay_secs: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker: "localhost".to_string(),
            port: 1883,
            username: String::new(),
            password: String::new(),
            client_id: "bacnet_gateway".to_string(),
            topic_prefix: "bacnet".to_string(),
            qos: 1,
            retain: true,
            keepalive_secs: 60,
            buffer_capacity: 10_000,
            channel_capacity: 1024,
            reconnect_delay_secs: 5,
            max_reconnect_delay_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub devices_file: PathBuf,
    pub mappings_file: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            devices_file: PathBuf::from("devices.json"),
            mappings_file: PathBuf::from("mqtt_mappings.json"),
        }
    }
}

/// Devices served by the simulated field network
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub devices: Vec<SimDeviceConfig>,
}

impl GatewayConfig {
    /// Load configuration from an optional TOML file and the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(GatewayConfig::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        let config: GatewayConfig = figment
            .merge(Env::prefixed("GATEWAY_").split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string (no environment layer)
    pub fn from_toml(toml: &str) -> Result<Self> {
        let config: GatewayConfig = Figment::from(Serialized::defaults(GatewayConfig::default()))
            .merge(Toml::string(toml))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.polling.interval_secs == 0 {
            return Err(GatewayError::Config("polling.interval_secs must be > 0".into()));
        }
        if self.discovery.interval_secs == 0 {
            return Err(GatewayError::Config("discovery.interval_secs must be > 0".into()));
        }
        if self.enumeration.refresh_interval_secs == Some(0) {
            return Err(GatewayError::Config(
                "enumeration.refresh_interval_secs must be > 0 when set".into(),
            ));
        }
        if let (Some(low), Some(high)) = (self.discovery.low_limit, self.discovery.high_limit) {
            if low > high {
                return Err(GatewayError::Config(format!(
                    "discovery.low_limit {low} exceeds high_limit {high}"
                )));
            }
        }
        if self.mqtt.qos > 2 {
            return Err(GatewayError::Config(format!("mqtt.qos {} out of range", self.mqtt.qos)));
        }
        if self.mqtt.buffer_capacity == 0 || self.mqtt.channel_capacity == 0 {
            return Err(GatewayError::Config("mqtt buffer and channel capacity must be > 0".into()));
        }
        if self.polling.max_concurrent_devices == 0 {
            return Err(GatewayError::Config("polling.max_concurrent_devices must be > 0".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bacnet::types::ObjectType;

    #[test]
    fn test_defaults() {
        let config = GatewayConfig::default();
        assert_eq!(config.bacnet.port, 47808);
        assert_eq!(config.discovery.interval_secs, 300);
        assert_eq!(config.polling.interval_secs, 60);
        assert_eq!(config.polling.properties, vec!["present-value", "status-flags"]);
        assert_eq!(config.mqtt.topic_prefix, "bacnet");
        assert_eq!(config.discovery.range(), DeviceRange::full());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_toml_overrides() {
        let config = GatewayConfig::from_toml(
            r#"
[bacnet.foreign_device]
address = "10.1.0.1"
ttl = 60

[discovery]
interval_secs = 120
low_limit = 1
high_limit = 100

[mqtt]
broker = "broker.local"
retain = false

[[simulation.devices]]
device_id = 5
address = "10.0.0.5:47808"
vendor = "Acme"

[[simulation.devices.objects]]
object_type = "analog-input"
instance = 1
value = { type = "real", value = 21.5 }
unit = "degrees-celsius"
"#,
        )
        .unwrap();

        let fd = config.bacnet.foreign_device.as_ref().unwrap();
        assert_eq!(fd.relay_address(), "10.1.0.1:47808");
        assert_eq!(fd.renewal_interval(), Duration::from_secs(30));
        assert_eq!(config.discovery.range(), DeviceRange::new(1, 100));
        assert_eq!(config.mqtt.broker, "broker.local");
        assert!(!config.mqtt.retain);
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.simulation.devices.len(), 1);
        assert_eq!(config.simulation.devices[0].objects[0].object_type, ObjectType::AnalogInput);
    }

    #[test]
    fn test_renewal_interval_floor() {
        let fd = ForeignDeviceConfig {
            address: "10.1.0.1".into(),
            port: 47808,
            ttl: 6,
        };
        assert_eq!(fd.renewal_interval(), Duration::from_secs(5));
    }

    #[test]
    fn test_validation() {
        let err = GatewayConfig::from_toml("[discovery]\nlow_limit = 50\nhigh_limit = 10\n");
        assert!(matches!(err, Err(GatewayError::Config(_))));

        let err = GatewayConfig::from_toml("[mqtt]\nqos = 3\n");
        assert!(matches!(err, Err(GatewayError::Config(_))));

        let err = GatewayConfig::from_toml("[polling]\ninterval_secs = 0\n");
        assert!(matches!(err, Err(GatewayError::Config(_))));

        let err = GatewayConfig::from_toml("[enumeration]\nrefresh_interval_secs = 0\n");
        assert!(matches!(err, Err(GatewayError::Config(_))));

        let config = GatewayConfig::from_toml("[enumeration]\nrefresh_interval_secs = 600\n").unwrap();
        assert_eq!(config.enumeration.refresh_interval(), Some(Duration::from_secs(600)));
    }
}
