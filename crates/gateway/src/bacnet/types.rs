//! BACnet types shared by the gateway components

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Highest valid device instance number (22-bit instance field)
pub const MAX_INSTANCE: u32 = 4_194_303;

/// BACnet object type
///
/// Serialized with its standard kebab-case name (e.g. "analog-input").
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ObjectType {
    AnalogInput,
    AnalogOutput,
    AnalogValue,
    BinaryInput,
    BinaryOutput,
    BinaryValue,
    MultiStateInput,
    MultiStateOutput,
    MultiStateValue,
    Accumulator,
    PulseConverter,
    Loop,
    IntegerValue,
    PositiveIntegerValue,
    LargeAnalogValue,
    CharacterStringValue,
    Calendar,
    Schedule,
    TrendLog,
    NotificationClass,
    Device,
    /// Vendor-specific or unrecognised type number
    Proprietary(u16),
}

const NAMED_TYPES: &[(ObjectType, &str)] = &[
    (ObjectType::AnalogInput, "analog-input"),
    (ObjectType::AnalogOutput, "analog-output"),
    (ObjectType::AnalogValue, "analog-value"),
    (ObjectType::BinaryInput, "binary-input"),
    (ObjectType::BinaryOutput, "binary-output"),
    (ObjectType::BinaryValue, "binary-value"),
    (ObjectType::MultiStateInput, "multi-state-input"),
    (ObjectType::MultiStateOutput, "multi-state-output"),
    (ObjectType::MultiStateValue, "multi-state-value"),
    (ObjectType::Accumulator, "accumulator"),
    (ObjectType::PulseConverter, "pulse-converter"),
    (ObjectType::Loop, "loop"),
    (ObjectType::IntegerValue, "integer-value"),
    (ObjectType::PositiveIntegerValue, "positive-integer-value"),
    (ObjectType::LargeAnalogValue, "large-analog-value"),
    (ObjectType::CharacterStringValue, "characterstring-value"),
    (ObjectType::Calendar, "calendar"),
    (ObjectType::Schedule, "schedule"),
    (ObjectType::TrendLog, "trend-log"),
    (ObjectType::NotificationClass, "notification-class"),
    (ObjectType::Device, "device"),
];

impl ObjectType {
    /// Standard name, e.g. "analog-input"
    pub fn name(&self) -> String {
        match self {
            ObjectType::Proprietary(n) => format!("proprietary-{n}"),
            known => NAMED_TYPES
                .iter()
                .find(|(t, _)| t == known)
                .map(|(_, name)| (*name).to_string())
                .unwrap_or_default(),
        }
    }

    /// Whether objects of this type expose `present-value`
    pub fn has_present_value(&self) -> bool {
        !matches!(
            self,
            ObjectType::Device
                | ObjectType::Calendar
                | ObjectType::TrendLog
                | ObjectType::NotificationClass
                | ObjectType::Proprietary(_)
        )
    }

    /// Whether objects of this type carry engineering `units`
    pub fn has_units(&self) -> bool {
        matches!(
            self,
            ObjectType::AnalogInput
                | ObjectType::AnalogOutput
                | ObjectType::AnalogValue
                | ObjectType::Accumulator
                | ObjectType::PulseConverter
                | ObjectType::Loop
                | ObjectType::LargeAnalogValue
        )
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

impl FromStr for ObjectType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace(['_', ' '], "-");
        if let Some((t, _)) = NAMED_TYPES.iter().find(|(_, name)| *name == normalized) {
            return Ok(*t);
        }
        normalized
            .strip_prefix("proprietary-")
            .and_then(|n| n.parse().ok())
            .map(ObjectType::Proprietary)
            .ok_or_else(|| format!("unknown object type '{s}'"))
    }
}

impl TryFrom<String> for ObjectType {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ObjectType> for String {
    fn from(value: ObjectType) -> Self {
        value.name()
    }
}

/// An object's identity within its device: (type, instance)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectId {
    pub object_type: ObjectType,
    pub instance: u32,
}

impl ObjectId {
    pub fn new(object_type: ObjectType, instance: u32) -> Self {
        Self {
            object_type,
            instance,
        }
    }

    /// The device object of a device
    pub fn device(device_id: u32) -> Self {
        Self::new(ObjectType::Device, device_id)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.object_type, self.instance)
    }
}

/// A decoded property value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum PropertyValue {
    Null,
    Boolean(bool),
    Unsigned(u64),
    Signed(i64),
    Real(f64),
    Enumerated(u32),
    Text(String),
    BitString(Vec<bool>),
}

impl PropertyValue {
    /// Plain JSON rendition used in published payloads
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            PropertyValue::Null => serde_json::Value::Null,
            PropertyValue::Boolean(v) => serde_json::Value::from(*v),
            PropertyValue::Unsigned(v) => serde_json::Value::from(*v),
            PropertyValue::Signed(v) => serde_json::Value::from(*v),
            PropertyValue::Real(v) => serde_json::Value::from(*v),
            PropertyValue::Enumerated(v) => serde_json::Value::from(*v),
            PropertyValue::Text(v) => serde_json::Value::from(v.as_str()),
            PropertyValue::BitString(bits) => serde_json::Value::from(bits.clone()),
        }
    }

    /// Value equality for change detection; reals compare bitwise so NaN equals NaN
    pub fn same_as(&self, other: &PropertyValue) -> bool {
        match (self, other) {
            (PropertyValue::Real(a), PropertyValue::Real(b)) => a.to_bits() == b.to_bits(),
            (a, b) => a == b,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            PropertyValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Text(s) => f.write_str(s),
            other => write!(f, "{}", other.to_json()),
        }
    }
}

/// A discovery response asserting a device's identity and address
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceAnnouncement {
    pub device_id: u32,
    /// Transport address, e.g. "192.168.1.20:47808"
    pub address: String,
    /// Remote network number for routed devices; `None` on the local segment
    pub network: Option<u16>,
    pub max_apdu: u16,
    pub vendor_id: u16,
    pub segmentation: String,
}

/// Where to send a request for one device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceTarget {
    pub device_id: u32,
    pub address: String,
    pub network: Option<u16>,
}

/// Inclusive device instance range of a discovery request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRange {
    pub low: u32,
    pub high: u32,
}

impl DeviceRange {
    pub fn new(low: u32, high: u32) -> Self {
        Self { low, high }
    }

    /// Every valid device instance
    pub fn full() -> Self {
        Self::new(0, MAX_INSTANCE)
    }

    pub fn contains(&self, device_id: u32) -> bool {
        (self.low..=self.high).contains(&device_id)
    }
}

impl Default for DeviceRange {
    fn default() -> Self {
        Self::full()
    }
}

/// Well-known property identifiers
pub mod property {
    pub const PRESENT_VALUE: &str = "present-value";
    pub const STATUS_FLAGS: &str = "status-flags";
    pub const UNITS: &str = "units";
    pub const OBJECT_NAME: &str = "object-name";
    pub const OBJECT_LIST: &str = "object-list";
    pub const VENDOR_NAME: &str = "vendor-name";
    pub const MODEL_NAME: &str = "model-name";
    pub const FIRMWARE_REVISION: &str = "firmware-revision";
    pub const APPLICATION_SOFTWARE_VERSION: &str = "application-software-version";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_type_names() {
        assert_eq!(ObjectType::AnalogInput.to_string(), "analog-input");
        assert_eq!("multi-state-value".parse::<ObjectType>(), Ok(ObjectType::MultiStateValue));
        assert_eq!("Analog_Output".parse::<ObjectType>(), Ok(ObjectType::AnalogOutput));
        assert_eq!("proprietary-513".parse::<ObjectType>(), Ok(ObjectType::Proprietary(513)));
        assert!("thermostat".parse::<ObjectType>().is_err());
    }

    #[test]
    fn test_object_id_serializes_with_type_name() {
        let id = ObjectId::new(ObjectType::BinaryValue, 3);
        let json = serde_json::to_value(id).unwrap();
        assert_eq!(json, serde_json::json!({"object_type": "binary-value", "instance": 3}));
        assert_eq!(serde_json::from_value::<ObjectId>(json).unwrap(), id);
        assert_eq!(id.to_string(), "binary-value:3");
    }

    #[test]
    fn test_present_value_and_units_support() {
        assert!(ObjectType::AnalogInput.has_present_value());
        assert!(ObjectType::AnalogInput.has_units());
        assert!(ObjectType::BinaryOutput.has_present_value());
        assert!(!ObjectType::BinaryOutput.has_units());
        assert!(!ObjectType::Device.has_present_value());
        assert!(!ObjectType::TrendLog.has_present_value());
    }

    #[test]
    fn test_value_comparison_and_json() {
        assert!(PropertyValue::Real(f64::NAN).same_as(&PropertyValue::Real(f64::NAN)));
        assert!(!PropertyValue::Real(21.5).same_as(&PropertyValue::Real(21.6)));
        assert!(!PropertyValue::Unsigned(1).same_as(&PropertyValue::Enumerated(1)));
        assert_eq!(PropertyValue::Real(21.5).to_json(), serde_json::json!(21.5));
        assert_eq!(
            PropertyValue::BitString(vec![false, true]).to_json(),
            serde_json::json!([false, true])
        );
    }

    #[test]
    fn test_device_range() {
        let range = DeviceRange::new(1, 100);
        assert!(range.contains(1));
        assert!(range.contains(100));
        assert!(!range.contains(101));
        assert!(DeviceRange::full().contains(MAX_INSTANCE));
    }
}
