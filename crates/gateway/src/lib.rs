//! BACnet to MQTT gateway
//!
//! This crate provides the gateway's orchestration core:
//! - Device registry and value cache
//! - Discovery sweeps, object enumeration, and cyclic polling
//! - Topic mapping and buffered MQTT publishing
//! - Service wiring via `gateway_runtime::service`

// Re-export the runtime
pub use gateway_runtime;

// Single-flight activity tracking
pub mod activity;

// Field side: discovery, enumeration, polling
pub mod bacnet;

// Layered configuration
pub mod config;

pub mod error;

// Device lifecycle events
pub mod events;

// Assembly and control surface
pub mod gateway;

// Broker side: topics and publishing
pub mod mqtt;

// Device registry and value cache
pub mod registry;

pub use config::GatewayConfig;
pub use error::{GatewayError, Result};
pub use gateway::{Gateway, GatewayStatus};
