//! Error taxonomy for the streaming engine.

/// A malformed PCM payload. Always recoverable: the offending message is dropped.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FormatError {
    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("PCM16 payload has an odd byte length ({0})")]
    OddLength(usize),
}

/// Errors raised by the capture, playback and transport layers.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// The input device could not be opened. Fatal to the session.
    #[error("audio capture unavailable: {0}")]
    CaptureUnavailable(String),
    /// The output device could not be opened. Fatal to the session.
    #[error("audio output unavailable: {0}")]
    OutputUnavailable(String),
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("shared secret rejected by the remote peer")]
    AuthRejected,
    /// An inbound message could not be parsed. The session continues.
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("malformed audio payload: {0}")]
    Format(#[from] FormatError),
    #[error("transport is not open")]
    NotOpen,
    #[error("transport error: {0}")]
    Transport(String),
    /// The configured sample rate or frame size cannot drive a session.
    #[error("invalid audio format: {0}")]
    InvalidFormat(String),
}

impl StreamError {
    /// Returns true when the error ends the current session (or engage attempt).
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            StreamError::Protocol(_) | StreamError::Format(_) | StreamError::NotOpen
        )
    }
}
