use std::io;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors reported by the loop, timers, and sockets.
///
/// This is a closed set of codes: operations either succeed, return one of
/// these, or deliver one through the owning object's error callback. The
/// underlying OS detail is logged at the failure site rather than carried
/// in the value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Operation is not legal in the object's current state.
    #[error("invalid state")]
    InvalidState,
    /// A parameter was rejected (bad address, empty buffer, out of range).
    #[error("invalid parameter")]
    InvalidParam,
    /// The requested backend or feature is unavailable on this platform.
    #[error("not supported")]
    NotSupported,
    /// Non-blocking operation would block; retry after the next readiness.
    #[error("operation would block")]
    Again,
    /// The operation's deadline elapsed.
    #[error("timed out")]
    Timeout,
    /// The peer refused the connection.
    #[error("connection refused")]
    Refused,
    /// No route to the peer.
    #[error("host unreachable")]
    Unreachable,
    /// The connection or loop is closed.
    #[error("closed")]
    Closed,
    /// The poll backend failed.
    #[error("poll error")]
    PollError,
    /// TLS handshake or record processing failed.
    #[error("ssl error")]
    SslError,
    /// Peer violated the expected wire protocol.
    #[error("protocol error")]
    ProtoError,
    /// Socket-level failure not covered by a more specific code.
    #[error("socket error")]
    SockError,
    /// Unclassified failure.
    #[error("failed")]
    Failed,
}

impl Error {
    /// Map a raw errno value to an error code.
    pub(crate) fn from_errno(errno: i32) -> Error {
        match errno {
            libc::EAGAIN | libc::EINPROGRESS => Error::Again,
            libc::ECONNREFUSED => Error::Refused,
            libc::EHOSTUNREACH | libc::ENETUNREACH => Error::Unreachable,
            libc::ETIMEDOUT => Error::Timeout,
            libc::ECONNRESET | libc::EPIPE | libc::ENOTCONN => Error::Closed,
            libc::EINVAL => Error::InvalidParam,
            _ => Error::SockError,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::WouldBlock => Error::Again,
            io::ErrorKind::TimedOut => Error::Timeout,
            io::ErrorKind::ConnectionRefused => Error::Refused,
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected => Error::Closed,
            io::ErrorKind::InvalidInput | io::ErrorKind::AddrNotAvailable => Error::InvalidParam,
            _ => match e.raw_os_error() {
                Some(errno) => Error::from_errno(errno),
                None => Error::Failed,
            },
        }
    }
}
