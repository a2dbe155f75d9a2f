//! # Error Types
//!
//! Purpose: Give every fallible operation in this crate one `Result<T>` to
//! return, wrapping exactly one of the kinds below. Nothing here is retried
//! internally: a transport-class failure (`Transport`, `Timeout`,
//! `ConnectionClosed`) always means the socket that produced it has already
//! been closed and evicted.

use std::io;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Every way a KT/TT operation can fail.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Low-level socket I/O failure unrelated to timeout or orderly close.
    #[error("transport error: {0}")]
    Transport(#[source] io::Error),

    /// The socket's configured receive timeout elapsed.
    #[error("operation timed out")]
    Timeout,

    /// The peer closed the connection, or a read returned zero bytes.
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// Unexpected magic byte, status byte, truncated varint/blob item, or any
    /// other parse invariant violation.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The server itself reported failure (KT `0xBF` magic, or a TT status
    /// byte outside `{0, 1}`).
    #[error("server returned an error{}", format_server_message(.message))]
    ServerInternal {
        /// Raw message bytes the server attached to the error, if any.
        message: Option<Vec<u8>>,
    },

    /// A caller-side precondition failed before any bytes were written, e.g.
    /// incompatible `ext` lock flags or a varint input `>= 2^56`.
    #[error("bad argument: {0}")]
    BadArgument(String),

    /// TT `ext` reported script execution failure.
    #[error("script error: {0}")]
    Script(String),
}

fn format_server_message(message: &Option<Vec<u8>>) -> String {
    match message {
        Some(bytes) => format!(": {}", String::from_utf8_lossy(bytes)),
        None => String::new(),
    }
}

impl Error {
    /// Classifies a raw I/O error the way [`crate::sock::FramedSocket`] observes it:
    /// a timeout/would-block kind becomes [`Error::Timeout`], an orderly EOF
    /// becomes [`Error::ConnectionClosed`], everything else is [`Error::Transport`].
    pub(crate) fn from_io(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => Error::Timeout,
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => Error::ConnectionClosed,
            _ => Error::Transport(err),
        }
    }

    /// True for the transport-class kinds that always mean the
    /// originating socket has been closed and must not be reused.
    pub(crate) fn closes_socket(&self) -> bool {
        matches!(
            self,
            Error::Transport(_) | Error::Timeout | Error::ConnectionClosed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_timeout() {
        let err = io::Error::new(io::ErrorKind::TimedOut, "timed out");
        assert!(matches!(Error::from_io(err), Error::Timeout));
    }

    #[test]
    fn classifies_closed() {
        let err = io::Error::new(io::ErrorKind::UnexpectedEof, "eof");
        assert!(matches!(Error::from_io(err), Error::ConnectionClosed));
    }

    #[test]
    fn classifies_transport() {
        let err = io::Error::new(io::ErrorKind::PermissionDenied, "denied");
        assert!(matches!(Error::from_io(err), Error::Transport(_)));
    }

    #[test]
    fn transport_class_closes_socket() {
        assert!(Error::Timeout.closes_socket());
        assert!(Error::ConnectionClosed.closes_socket());
        assert!(!Error::BadArgument("x".into()).closes_socket());
    }
}
