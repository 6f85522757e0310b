use std::io;

use thiserror::Error;

/// Errors raised by the framing codec in [`crate::frame`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Protocol(String),
    #[error("stream ended mid-frame")]
    IncompleteFrame,
    /// Any other I/O failure surfaced while reading a frame (timeouts
    /// included). Kept distinct from `Protocol` so callers can treat a read
    /// timeout as non-fatal per spec, instead of tearing down the session.
    #[error("transport error: {1}")]
    Io(io::ErrorKind, String),
}

impl FrameError {
    pub fn protocol(reason: impl Into<String>) -> Self {
        Self::Protocol(reason.into())
    }

    pub fn io(err: &io::Error) -> Self {
        Self::Io(err.kind(), err.to_string())
    }

    /// True for timeouts and other would-block conditions a caller's read
    /// loop should simply retry rather than treat as a protocol failure.
    pub fn is_retryable_timeout(&self) -> bool {
        matches!(self, FrameError::Io(kind, _) if matches!(kind, io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut))
    }
}

impl From<FrameError> for io::Error {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::IncompleteFrame => io::Error::new(io::ErrorKind::UnexpectedEof, err),
            FrameError::Io(kind, _) => io::Error::new(kind, err),
            FrameError::Protocol(_) => io::Error::new(io::ErrorKind::InvalidData, err),
        }
    }
}
