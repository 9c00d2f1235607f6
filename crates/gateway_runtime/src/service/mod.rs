//! Service Lifecycle Management
//!
//! A service is a long-running gateway activity (discovery, polling,
//! publishing, relay registration). The manager drives each service on its
//! own task and calls its hooks:
//! - `on_start`: once, before anything else
//! - `on_tick`: every `tick_interval`, skipping ticks missed while busy
//! - `on_event`: for every bus event matching a subscription pattern
//! - `on_stop`: once, on shutdown, bounded by `shutdown_timeout`

mod event;
mod handle;
mod manager;

pub use event::*;
pub use handle::*;
pub use manager::*;

use std::time::Duration;

use async_trait::async_trait;

// ─────────────────────────────────────────────────────────────────────────────
// Service Error
// ─────────────────────────────────────────────────────────────────────────────

/// Errors raised by the service runtime or returned from service hooks
#[derive(Debug, Clone, thiserror::Error)]
pub enum ServiceError {
    #[error("Service initialization failed: {0}")]
    InitializationFailed(String),

    #[error("Service already running: {0}")]
    AlreadyRunning(String),

    #[error("Service not running: {0}")]
    NotRunning(String),

    #[error("Event handling failed: {0}")]
    EventError(String),

    #[error("Shutdown timeout")]
    ShutdownTimeout,

    #[error("Channel closed")]
    ChannelClosed,
}

/// Result type for service operations
pub type ServiceResult<T> = Result<T, ServiceError>;

// ─────────────────────────────────────────────────────────────────────────────
// Service Specification
// ─────────────────────────────────────────────────────────────────────────────

/// Static description of a service
#[derive(Debug, Clone)]
pub struct ServiceSpec {
    /// Unique service identifier (e.g. "bacnet/discovery")
    pub id: String,

    /// Human-readable name
    pub name: String,

    /// Period of `on_tick` calls; `None` disables ticking
    pub tick_interval: Option<Duration>,

    /// Event type patterns this service receives (glob syntax, e.g. "device/*")
    pub subscriptions: Vec<String>,

    /// Upper bound for `on_stop`
    pub shutdown_timeout: Duration,

    pub description: Option<String>,
}

impl ServiceSpec {
    /// Create a new service spec with required fields
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            tick_interval: None,
            subscriptions: Vec::new(),
            shutdown_timeout: Duration::from_secs(30),
            description: None,
        }
    }

    /// Set tick interval
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = Some(interval);
        self
    }

    /// Add a single subscription pattern
    pub fn subscribe(mut self, pattern: impl Into<String>) -> Self {
        self.subscriptions.push(pattern.into());
        self
    }

    /// Set shutdown timeout
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Set description
    pub fn with_description(mut self, desc: impl Into<String>) -> Self {
        self.description = Some(desc.into());
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Service Context
// ─────────────────────────────────────────────────────────────────────────────

/// Context passed to service lifecycle methods
pub struct ServiceContext {
    pub service_id: String,
}

impl ServiceContext {
    pub fn new(service_id: String) -> Self {
        Self { service_id }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Service Trait
// ─────────────────────────────────────────────────────────────────────────────

/// A long-running component managed by the [`ServiceManager`]
///
/// Hooks run on the service's own task, one at a time. A hook that needs to
/// do slow I/O should spawn it and return, so that shutdown and further
/// events stay responsive.
#[async_trait]
pub trait Service: Send + Sync + 'static {
    /// Returns the service specification
    fn spec(&self) -> ServiceSpec;

    /// Called when the service starts. An error aborts the start.
    async fn on_start(&mut self, ctx: &ServiceContext) -> ServiceResult<()>;

    /// Called when the service stops. The service is stopped even if this fails.
    async fn on_stop(&mut self, ctx: &ServiceContext) -> ServiceResult<()>;

    /// Called when an event matching a subscription arrives
    async fn on_event(&mut self, _ctx: &ServiceContext, _event: Event) -> ServiceResult<()> {
        Ok(())
    }

    /// Called every `tick_interval`
    async fn on_tick(&mut self, _ctx: &ServiceContext) -> ServiceResult<()> {
        Ok(())
    }
}
