//! Error taxonomy
//!
//! Collaborator errors (`FieldError`, `BusError`) are mapped onto the
//! gateway's own `GatewayError` at the component boundary.

/// Failure reported by the field-protocol collaborator
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FieldError {
    #[error("no response within timeout")]
    Timeout,

    #[error("device unreachable: {0}")]
    Unreachable(String),

    #[error("request rejected: {0}")]
    Rejected(String),

    /// The object does not implement the requested property
    #[error("unknown property")]
    UnknownProperty,

    #[error("malformed response: {0}")]
    Protocol(String),
}

/// Failure reported by the message-bus collaborator
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BusError {
    #[error("bus disconnected")]
    Disconnected,

    #[error("publish failed: {0}")]
    Publish(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Errors surfaced by gateway operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    /// No response within the bound; always transient
    #[error("Timeout")]
    Timeout,

    #[error("Unreachable: {0}")]
    Unreachable(String),

    #[error("Rejected: {0}")]
    Rejected(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Message bus down")]
    TransportDown,

    /// A manual trigger arrived while the named activity was already running
    #[error("{0} already running")]
    Busy(&'static str),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Service error: {0}")]
    Service(String),
}

impl GatewayError {
    pub fn device_not_found(device_id: u32) -> Self {
        GatewayError::NotFound(format!("device {device_id}"))
    }

    /// Whether a retry at the next cycle may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            GatewayError::Timeout | GatewayError::Unreachable(_) | GatewayError::TransportDown
        )
    }
}

impl From<FieldError> for GatewayError {
    fn from(err: FieldError) -> Self {
        match err {
            FieldError::Timeout => GatewayError::Timeout,
            FieldError::Unreachable(reason) => GatewayError::Unreachable(reason),
            FieldError::Rejected(reason) => GatewayError::Rejected(reason),
            FieldError::UnknownProperty => GatewayError::Rejected("unknown property".to_string()),
            FieldError::Protocol(reason) => GatewayError::Protocol(reason),
        }
    }
}

impl From<BusError> for GatewayError {
    fn from(err: BusError) -> Self {
        match err {
            BusError::Disconnected => GatewayError::TransportDown,
            BusError::Publish(reason) => GatewayError::Unreachable(reason),
        }
    }
}

impl From<gateway_runtime::ServiceError> for GatewayError {
    fn from(err: gateway_runtime::ServiceError) -> Self {
        GatewayError::Service(err.to_string())
    }
}

impl From<figment::Error> for GatewayError {
    fn from(err: figment::Error) -> Self {
        GatewayError::Config(err.to_string())
    }
}
