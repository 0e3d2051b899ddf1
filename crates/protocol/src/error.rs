//! Error types for the protocol crate.

use std::io;

use thiserror::Error;

/// Protocol error type covering all HTTP wire-level failure modes.
#[derive(Debug, Error)]
pub enum ProtocolError {
    // Request parsing errors
    /// The request line or a header line could not be parsed.
    #[error("malformed request: {0}")]
    MalformedRequest(String),

    /// The request head exceeded the maximum allowed size.
    #[error("request head too large: {size} bytes exceeds maximum of {max} bytes")]
    HeaderTooLarge {
        /// Bytes buffered so far.
        size: usize,
        /// Maximum allowed head size.
        max: usize,
    },

    /// The request uses an HTTP version this server does not speak.
    #[error("unsupported HTTP version: {0}")]
    UnsupportedVersion(String),

    // Connection errors
    /// Connection was closed by the peer.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// Any other I/O failure.
    #[error("I/O error: {0}")]
    Io(io::Error),
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Returns true if the error means the client went away.
///
/// Reset, aborted, broken pipe and early EOF are routine for browsers that
/// cancel downloads or seek inside media, so callers treat them as a normal
/// end of the exchange.
pub fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
    )
}

impl From<io::Error> for ProtocolError {
    fn from(err: io::Error) -> Self {
        if is_disconnect(&err) {
            ProtocolError::ConnectionClosed(err.to_string())
        } else {
            ProtocolError::Io(err)
        }
    }
}
