//! Gateway Runtime
//!
//! Long-running service plumbing shared by the gateway's timer-driven
//! activities: lifecycle hooks, periodic ticks with skip-on-miss semantics,
//! and a broadcast event bus with glob subscriptions.

pub mod service;

pub use service::{
    Event, EventPublisher, Service, ServiceContext, ServiceError, ServiceHandle, ServiceManager,
    ServiceResult, ServiceSpec, ServiceState,
};
