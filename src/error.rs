use std::io;
use std::time::Duration;

/// Why a session considers its client gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// No stdin, stdin-eof, or heartbeat chunk arrived within the timeout.
    HeartbeatExpired(Duration),
    /// The transport reported end-of-stream or a read error mid-session.
    PeerClosed,
}

#[derive(Debug)]
pub enum SessionError {
    Io(io::Error),
    Protocol(String),
    Oversize { tag: u8, len: usize, max: usize },
    Disconnected(DisconnectReason),
    ShuttingDown,
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::Io(err) => write!(f, "session io error: {err}"),
            SessionError::Protocol(message) => write!(f, "protocol error: {message}"),
            SessionError::Oversize { tag, len, max } => write!(
                f,
                "chunk of type {} carries {len} bytes, exceeding the {max} byte limit",
                crate::protocol::tag_name(*tag)
            ),
            SessionError::Disconnected(DisconnectReason::HeartbeatExpired(timeout)) => write!(
                f,
                "client disconnected: no activity for {} ms",
                timeout.as_millis()
            ),
            SessionError::Disconnected(DisconnectReason::PeerClosed) => {
                write!(f, "client disconnected: connection closed")
            }
            SessionError::ShuttingDown => write!(f, "server is shutting down"),
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SessionError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for SessionError {
    fn from(err: io::Error) -> Self {
        SessionError::Io(err)
    }
}
