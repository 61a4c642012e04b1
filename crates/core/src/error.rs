//! Error types shared across the viewer client

/// Result type alias using the client Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in session negotiation and media handling
///
/// Queue overflow is intentionally absent: dropping the oldest item under
/// load is expected steady-state behavior and is tracked as a counter on
/// the queue, not raised as an error.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Connectivity configuration service unreachable or returned garbage
    #[error("Connectivity config unavailable: {0}")]
    ConfigUnavailable(String),

    /// Signaling exchange missed a per-state deadline
    #[error("Signaling timeout: {0}")]
    SignalingTimeout(String),

    /// Remote peer declined the session
    #[error("Negotiation rejected: {0}")]
    NegotiationRejected(String),

    /// Established transport reported a disconnect
    #[error("Transport disconnected: {0}")]
    TransportDisconnected(String),

    /// Inbound message failed boundary validation
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// Signaling channel adapter error
    #[error("Signaling error: {0}")]
    SignalingError(String),

    /// Session lookup or lifecycle error
    #[error("Session error: {0}")]
    SessionError(String),

    /// Peer connection engine error
    #[error("Peer connection error: {0}")]
    PeerConnectionError(String),

    /// Media track or decoder error
    #[error("Media error: {0}")]
    MediaError(String),

    /// Display surface error
    #[error("Render error: {0}")]
    RenderError(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Any other error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Check if this error is retryable
    ///
    /// Retryable errors are handled locally by backoff loops; everything
    /// else propagates to the session-level failure surface.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ConfigUnavailable(_)
                | Error::SignalingTimeout(_)
                | Error::TransportDisconnected(_)
                | Error::SignalingError(_)
                | Error::IoError(_)
        )
    }

    /// Check if this error terminates the session it occurred on
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Error::NegotiationRejected(_) | Error::InvalidConfig(_)
        )
    }

    /// Check if this error is safe to log and discard at the boundary
    pub fn is_discardable(&self) -> bool {
        matches!(self, Error::MalformedMessage(_))
    }
}
