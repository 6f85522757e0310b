use std::io;

use thiserror::Error;
use tunnel_protocol::FrameError;

/// The error kinds of the tunnel dataplane, unified at crate boundaries.
/// Propagation policy (who tears down what) lives with the call sites in
/// [`crate::client_session`] and [`crate::server_session`], not here.
#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("stream ended mid-frame")]
    IncompleteFrame,
    #[error("authentication failed")]
    Auth,
    #[error("no public port available")]
    PortAlloc,
    #[error("local dial failed: {0}")]
    LocalDial(#[source] io::Error),
    #[error("control link error: {0}")]
    Transport(#[source] io::Error),
    #[error("peer socket error: {0}")]
    PeerIo(#[source] io::Error),
    #[error("virtual connection queue overflowed")]
    QueueOverflow,
    #[error("cancelled")]
    Cancelled,
}

impl From<FrameError> for TunnelError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::IncompleteFrame => TunnelError::IncompleteFrame,
            FrameError::Protocol(reason) => TunnelError::Protocol(reason),
            FrameError::Io(kind, reason) => TunnelError::Transport(io::Error::new(kind, reason)),
        }
    }
}

impl TunnelError {
    /// Errors confined to a single virtual connection: the VC is torn down,
    /// CLOSE is emitted, the session survives.
    pub fn is_vc_scoped(&self) -> bool {
        matches!(self, TunnelError::PeerIo(_) | TunnelError::QueueOverflow | TunnelError::LocalDial(_))
    }
}
