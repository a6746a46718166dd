use std::io;
use thiserror::Error;

/// Terminal errors for a peer connection.
///
/// `Protocol` and `Malformed` cover the fatal violations that close the
/// socket (the EPROTO class: bad framing, bad checksum, messages that break
/// the handshake or download protocol). The remaining variants are the
/// terminal socket conditions. Transient conditions (`WouldBlock`, socket
/// timeouts with an unexpired deadline) are retried inside the read loop and
/// never surface here.
#[derive(Debug, Error)]
pub enum PeerError {
    /// The remote node violated the protocol; the connection is dropped.
    #[error("protocol violation: {0}")]
    Protocol(&'static str),

    /// A message payload could not be parsed.
    #[error("malformed message: {0}")]
    Malformed(io::Error),

    /// A connect, message or scheduled-disconnect deadline expired.
    #[error("connection timed out")]
    TimedOut,

    /// The remote end closed the connection.
    #[error("connection reset by peer")]
    ConnectionReset,

    /// A send was attempted without an open socket.
    #[error("socket not connected")]
    NotConnected,

    /// Any other socket-level failure.
    #[error("socket error: {0}")]
    Socket(io::Error),
}

impl PeerError {
    /// True for the EPROTO class of errors.
    pub fn is_protocol(&self) -> bool {
        matches!(self, PeerError::Protocol(_) | PeerError::Malformed(_))
    }

    /// Maps a socket-level io error to its terminal classification.
    pub(crate) fn from_socket(err: io::Error) -> PeerError {
        match err.kind() {
            io::ErrorKind::TimedOut => PeerError::TimedOut,
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => PeerError::ConnectionReset,
            io::ErrorKind::NotConnected => PeerError::NotConnected,
            _ => PeerError::Socket(err),
        }
    }
}
