//! Error types for the WHIP client

/// Result type alias using the crate Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while publishing over WHIP
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Network-level failure reaching the endpoint; worth retrying
    #[error("Network error: {0}")]
    Network(String),

    /// The endpoint rejected a request
    #[error("Server rejected request with {status}: {message}")]
    Server { status: u16, message: String },

    /// The WHIP resource is gone (404/410); a new session must be created
    #[error("Session closed by the server")]
    SessionClosed,

    /// The endpoint does not implement PATCH (405/501)
    #[error("Endpoint does not support PATCH")]
    PatchUnsupported,

    /// SDP handling failed
    #[error("SDP error: {0}")]
    Sdp(String),

    /// The underlying WebRTC stack failed
    #[error("WebRTC error: {0}")]
    Engine(String),

    /// The client is closed
    #[error("Client closed")]
    Closed,

    /// Any other error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Transport-level failures and server errors are worth another
    /// attempt; anything the server deliberately rejected is not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Network(_) => true,
            Error::Server { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Errors that require tearing the session down and starting over
    pub fn needs_full_restart(&self) -> bool {
        matches!(self, Error::SessionClosed | Error::PatchUnsupported)
    }
}

impl From<webrtc::Error> for Error {
    fn from(e: webrtc::Error) -> Self {
        Error::Engine(e.to_string())
    }
}
