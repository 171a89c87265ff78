//! Error types for the session SDK

/// Result type alias using the crate Error
pub type Result<T> = std::result::Result<T, Error>;

/// Numeric error codes carried by signaling error acknowledgements.
///
/// Codes at or above [`error_codes::CONNECTION_LEVEL`] denote connection-level
/// failures rather than per-operation ones.
pub mod error_codes {
    /// Generic request failure
    pub const REQUEST_FAILED: i32 = 1;
    /// The referenced transport does not exist on the server
    pub const TRANSPORT_NOT_FOUND: i32 = 20;
    /// The referenced producer does not exist on the server
    pub const PRODUCER_NOT_FOUND: i32 = 21;
    /// The referenced consumer does not exist on the server
    pub const CONSUMER_NOT_FOUND: i32 = 22;
    /// Codes at or above this threshold are connection-level (fatal)
    pub const CONNECTION_LEVEL: i32 = 100;
    /// The client is not authorized to stay connected
    pub const NOT_AUTHORIZED: i32 = 100;
    /// The room was closed on the server
    pub const ROOM_CLOSED: i32 = 101;
}

/// Errors that can occur in session SDK operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Signaling connection error
    #[error("Signaling error: {0}")]
    Signaling(String),

    /// Server rejected a signaling request
    #[error("Server error {code}: {message}")]
    Server { code: i32, message: String },

    /// Operation timeout
    #[error("Operation timeout: {0}")]
    OperationTimeout(String),

    /// Device has not loaded router capabilities yet
    #[error("Device not ready")]
    DeviceNotReady,

    /// Device failed to load router capabilities
    #[error("Device init failed for router {router_id}: {reason}")]
    DeviceInitFailed { router_id: String, reason: String },

    /// The connector has been closed
    #[error("Transport closed")]
    TransportClosed,

    /// The requested transport id doesn't match any known transport
    #[error("Wrong transport: {0}")]
    WrongTransport(String),

    /// The remote side never acknowledged transport creation
    #[error("Transport create timed out")]
    TransportCreateTimeout,

    /// Local transport construction failed
    #[error("Transport create failed: {0}")]
    TransportCreateFailed(String),

    /// An ICE restart round trip failed
    #[error("ICE restart failed: {0}")]
    IceRestartFailed(String),

    /// The endpoint is not ready to produce media yet
    #[error("Not ready for streaming")]
    NotReadyForStreaming,

    /// The endpoint cannot produce this media kind
    #[error("Cannot stream media kind: {0}")]
    CannotStreamKind(String),

    /// The producer backing a stream handle is closed
    #[error("Stream closed")]
    StreamClosed,

    /// Media engine error
    #[error("Media engine error: {0}")]
    Engine(String),

    /// WebSocket error
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// HTTP error during session provisioning
    #[error("HTTP error: {0}")]
    Http(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Any other error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Signaling(_)
            | Error::OperationTimeout(_)
            | Error::TransportCreateTimeout
            | Error::WebSocket(_)
            | Error::Http(_)
            | Error::Io(_) => true,
            Error::Server { code, .. } => *code < error_codes::CONNECTION_LEVEL,
            _ => false,
        }
    }

    /// Check if this error is a configuration error
    pub fn is_config_error(&self) -> bool {
        matches!(self, Error::InvalidConfig(_))
    }

    /// Check if this is a connection-level server error
    pub fn is_connection_level(&self) -> bool {
        matches!(self, Error::Server { code, .. } if *code >= error_codes::CONNECTION_LEVEL)
    }

    /// Numeric server error code, if this is a server error
    pub fn server_code(&self) -> Option<i32> {
        match self {
            Error::Server { code, .. } => Some(*code),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
