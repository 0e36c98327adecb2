//! Error types for SHMSOCK
//!
//! Every fallible operation in the crate returns [`ShmsockResult`]. The variants
//! map one-to-one onto the failure classes a socket user has to tell apart:
//! misuse of the API, rendezvous failures, resource exhaustion, interrupted
//! waits and broken peers.

use thiserror::Error;

/// Main error type for SHMSOCK operations
#[derive(Debug, Error)]
pub enum ShmsockError {
    /// Malformed service name or address
    #[error("Invalid address: {0}")]
    AddressInvalid(String),

    /// `bind` called on an endpoint that is already bound
    #[error("Endpoint already bound: {0}")]
    AlreadyBound(String),

    /// Operation not valid in the endpoint's current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// No listener is published under the requested name
    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    /// Another endpoint already claimed the service name
    #[error("Service in use: {0}")]
    ServiceInUse(String),

    /// Page allocation, grant or port allocation failed
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Mapping the peer's memory or binding its doorbell failed
    #[error("Peer unreachable: {0}")]
    PeerUnreachable(String),

    /// A blocking call was interrupted through its cancellation token
    #[error("Operation cancelled")]
    Cancelled,

    /// A blocking call ran past its deadline
    #[error("Operation timed out")]
    Timeout,

    /// The peer shut the connection down
    #[error("Connection closed by peer")]
    ConnectionClosed,

    /// Shared control fields are inconsistent; the connection is unusable
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// Non-blocking call could not make any progress
    #[error("Operation would block")]
    WouldBlock,

    /// Configuration could not be loaded or is invalid
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience type alias for SHMSOCK results
pub type ShmsockResult<T> = Result<T, ShmsockError>;

impl ShmsockError {
    /// Create a configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        ShmsockError::Config(msg.into())
    }

    /// Create a protocol violation error
    pub fn violation<S: Into<String>>(msg: S) -> Self {
        ShmsockError::ProtocolViolation(msg.into())
    }

    /// Create an invalid state error
    pub fn invalid_state<S: Into<String>>(msg: S) -> Self {
        ShmsockError::InvalidState(msg.into())
    }

    /// Whether the connection must be abandoned after this error
    pub fn is_fatal(&self) -> bool {
        matches!(self, ShmsockError::ProtocolViolation(_))
    }
}

impl From<toml::de::Error> for ShmsockError {
    fn from(err: toml::de::Error) -> Self {
        ShmsockError::Config(format!("Failed to parse TOML: {}", err))
    }
}

impl From<serde_yaml::Error> for ShmsockError {
    fn from(err: serde_yaml::Error) -> Self {
        ShmsockError::Config(format!("Failed to parse YAML: {}", err))
    }
}
