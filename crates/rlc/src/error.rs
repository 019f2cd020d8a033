use thiserror::Error;

/// Result type for RLC operations
pub type RlcResult<T> = Result<T, RlcError>;

/// Errors that can occur in RLC operations
#[derive(Error, Debug)]
pub enum RlcError {
    #[error("Connection capacity exceeded: maximum of {max} concurrent connections")]
    CapacityExceeded { max: usize },

    #[error("Connection not found: {id}")]
    ConnectionNotFound { id: String },

    #[error("Connection already registered: {id}")]
    ConnectionExists { id: String },

    #[error("Pool not found: {id}")]
    PoolNotFound { id: String },

    #[error("Component type not registered: {component_type}")]
    ComponentTypeNotFound { component_type: String },

    #[error("Component not found: {id}")]
    ComponentNotFound { id: String },

    #[error("Parent component not found: {id}")]
    ParentNotFound { id: String },

    #[error("Method '{method}' not found on component type '{component_type}'")]
    MethodNotFound {
        component_type: String,
        method: String,
    },

    #[error("Method '{method}' failed: {message}")]
    MethodFailed { method: String, message: String },

    #[error("Linking '{component_id}' under '{parent_id}' would make it its own ancestor")]
    CircularHierarchy {
        component_id: String,
        parent_id: String,
    },

    #[error("Component set is not a valid forest, cycle among: {ids:?}")]
    DependencyCycle { ids: Vec<String> },

    #[error("Snapshot expired: age {age_ms}ms exceeds maximum {max_age_ms}ms")]
    SnapshotExpired { age_ms: i64, max_age_ms: i64 },

    #[error("Snapshot checksum mismatch: expected {expected}, computed {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("Failed to send to connection {connection_id}: {reason}")]
    TransportSendFailure {
        connection_id: String,
        reason: String,
    },

    #[error("Request timed out waiting for response: {correlation_id}")]
    RequestTimeout { correlation_id: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Protocol error: {message}")]
    Protocol { message: String },

    #[error("Invalid configuration: {message}")]
    Config { message: String },

    #[cfg(feature = "persistence")]
    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RlcError {
    /// Machine-readable error code sent to clients in `error` messages
    pub fn code(&self) -> &'static str {
        match self {
            RlcError::CapacityExceeded { .. } => "CAPACITY_EXCEEDED",
            RlcError::ConnectionNotFound { .. } => "CONNECTION_NOT_FOUND",
            RlcError::ConnectionExists { .. } => "CONNECTION_EXISTS",
            RlcError::PoolNotFound { .. } => "POOL_NOT_FOUND",
            RlcError::ComponentTypeNotFound { .. } => "COMPONENT_TYPE_NOT_FOUND",
            RlcError::ComponentNotFound { .. } => "COMPONENT_NOT_FOUND",
            RlcError::ParentNotFound { .. } => "PARENT_NOT_FOUND",
            RlcError::MethodNotFound { .. } => "METHOD_NOT_FOUND",
            RlcError::MethodFailed { .. } => "METHOD_FAILED",
            RlcError::CircularHierarchy { .. } => "CIRCULAR_HIERARCHY",
            RlcError::DependencyCycle { .. } => "DEPENDENCY_CYCLE",
            RlcError::SnapshotExpired { .. } => "SNAPSHOT_EXPIRED",
            RlcError::ChecksumMismatch { .. } => "CHECKSUM_MISMATCH",
            RlcError::TransportSendFailure { .. } => "TRANSPORT_SEND_FAILURE",
            RlcError::RequestTimeout { .. } => "REQUEST_TIMEOUT",
            RlcError::Serialization(_) => "SERIALIZATION_ERROR",
            RlcError::Io(_) => "IO_ERROR",
            RlcError::WebSocket(_) => "WEBSOCKET_ERROR",
            RlcError::Protocol { .. } => "PROTOCOL_ERROR",
            RlcError::Config { .. } => "CONFIG_ERROR",
            #[cfg(feature = "persistence")]
            RlcError::Persistence(_) => "PERSISTENCE_ERROR",
            RlcError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}
