//! Error types for stream-queue.

use thiserror::Error;

/// Broker error type.
#[derive(Error, Debug)]
pub enum BrokerError {
    /// Redis connection or command error
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// The connect sequence threw or ran out of attempts
    #[error("Connection '{name}' unavailable after {attempts} attempt(s): {reason}")]
    ConnectionUnavailable {
        name: String,
        attempts: u32,
        reason: String,
    },

    /// A freshly established handle still reports not connected
    #[error("Connection '{0}' is not connected")]
    NotConnected(String),

    /// The manager was explicitly closed
    #[error("Connection '{0}' has been closed")]
    Closed(String),

    /// The key does not exist (e.g. XINFO GROUPS on a missing stream)
    #[error("No such key: {0}")]
    NoSuchKey(String),

    /// XGROUP CREATE on a group that is already there (BUSYGROUP)
    #[error("Consumer group '{group}' already exists on stream '{stream}'")]
    GroupExists { stream: String, group: String },

    /// Unexpected reply shape from the broker
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Field-list encoding or decoding failed
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Connection string could not be parsed
    #[error("Invalid connection string: {0}")]
    InvalidConnectionString(String),

    /// A connection with this name is already registered
    #[error("Connection '{0}' is already registered")]
    DuplicateConnection(String),

    /// No connection with this name is registered
    #[error("Connection '{0}' is not registered")]
    UnknownConnection(String),

    /// Consume/commit issued before `subscribe`
    #[error("Consumer is not subscribed to a stream")]
    NotSubscribed,

    /// Pub/sub handle requested on a connection configured without it
    #[error("Pub/sub is disabled for connection '{0}'")]
    PubSubDisabled(String),

    /// The caller's cancellation signal fired before a result arrived
    #[error("Operation cancelled")]
    Cancelled,

    /// IO error (config files)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error (config files)
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl BrokerError {
    /// Whether this error means the transport itself is gone.
    ///
    /// Sessions use this to flip their connected flag so the manager
    /// re-runs the connect sequence on the next handle request.
    pub fn is_connection_loss(&self) -> bool {
        match self {
            BrokerError::Redis(e) => {
                e.is_connection_dropped()
                    || e.is_io_error()
                    || e.is_connection_refusal()
                    || e.is_unrecoverable_error()
            }
            BrokerError::NotConnected(_) | BrokerError::ConnectionUnavailable { .. } => true,
            _ => false,
        }
    }

    /// Whether a read or commit must surface this error instead of
    /// reporting "nothing read" / "nothing acknowledged".
    pub fn is_fatal(&self) -> bool {
        self.is_connection_loss()
            || matches!(
                self,
                BrokerError::Closed(_)
                    | BrokerError::Cancelled
                    | BrokerError::Config(_)
                    | BrokerError::NotSubscribed
                    | BrokerError::Io(_)
            )
    }
}

/// Result type for broker operations.
pub type BrokerResult<T> = Result<T, BrokerError>;

/// Field-list codec error type.
#[derive(Error, Debug)]
pub enum CodecError {
    /// The value does not serialize to a record with named members
    #[error("Expected a record with named fields, got {0}")]
    NotARecord(&'static str),

    /// A field value could not be converted to the target type
    #[error("Field value {value:?} is not a valid {expected}")]
    InvalidValue { value: String, expected: &'static str },

    /// Nested JSON value failed to (de)serialize
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Error raised by a Deserialize implementation
    #[error("{0}")]
    Message(String),
}

impl serde::de::Error for CodecError {
    fn custom<T: std::fmt::Display>(msg: T) -> Self {
        CodecError::Message(msg.to_string())
    }
}

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;
