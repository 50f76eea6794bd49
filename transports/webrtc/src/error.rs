//! Error types for the FFmpeg → WebRTC bridge

/// Result type alias using the bridge Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while bridging a media source into a WebRTC session
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// No live session with the given id
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// The session was torn down while the caller was waiting on it
    #[error("Session closed: {0}")]
    SessionClosed(String),

    /// The transcoder could not be started or exited unexpectedly
    #[error("Transcoder failure: {0}")]
    SubprocessFailure(String),

    /// A malformed or undersized frame could not be forwarded to its track
    #[error("Frame alignment failure: {0}")]
    FrameAlignment(String),

    /// The transport connection did not reach `connected` in time
    #[error("Connect timeout: {0}")]
    ConnectTimeout(String),

    /// Resolution or sample format never appeared in the transcoder output
    #[error("Transcoder output parse stalled: {0}")]
    ParseStall(String),

    /// Invalid data format
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// SDP negotiation error
    #[error("SDP negotiation error: {0}")]
    SdpError(String),

    /// ICE candidate error
    #[error("ICE candidate error: {0}")]
    IceCandidateError(String),

    /// Media track error
    #[error("Media track error: {0}")]
    MediaTrackError(String),

    /// Media encoding error
    #[error("Encoding error: {0}")]
    EncodingError(String),

    /// WebRTC library error
    #[error("WebRTC error: {0}")]
    WebRtcError(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Any other error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Check if this error ends the whole session rather than a single call
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Error::SubprocessFailure(_)
                | Error::FrameAlignment(_)
                | Error::ConnectTimeout(_)
                | Error::ParseStall(_)
                | Error::SessionClosed(_)
        )
    }

    /// Check if this error is about session lookup or lifetime
    pub fn is_session_error(&self) -> bool {
        matches!(self, Error::SessionNotFound(_) | Error::SessionClosed(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::SerializationError(e.to_string())
    }
}
