//! Error types for the RPC runtime.
//!
//! Codec errors terminate the connection that produced them; handler errors
//! become fail-response frames and never tear the connection down.

use std::fmt;

/// Where in the frame pipeline an I/O failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoStage {
    ReadHeader,
    ReadPayload,
    Write,
}

impl fmt::Display for IoStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IoStage::ReadHeader => "read-header",
            IoStage::ReadPayload => "read-payload",
            IoStage::Write => "write",
        };
        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("message too short: {0} bytes")]
    TooShort(usize),
    #[error("payload shorter than advertised: expected {expected}, got {actual}")]
    PayloadTooShort { expected: usize, actual: usize },
    #[error("message too large: {size} bytes exceeds limit {limit}")]
    MessageTooLarge { size: usize, limit: usize },
    #[error("unsupported header length: {0}")]
    HeaderLengthUnsupported(usize),
    #[error("{stage} failed: {source}")]
    Io {
        stage: IoStage,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("connection closed")]
    ConnectionClosed,
    #[error("write timeout")]
    WriteTimeout,
    #[error("write failed: {0}")]
    WriteFailed(String),
    #[error("max connections reached")]
    MaxConnections,
    #[error("connection not found: {0}")]
    ConnectionNotFound(String),
    #[error("request timed out")]
    Timeout,
    #[error("invalid message type: {0}")]
    InvalidMessageType(u8),
    #[error("connection not authenticated")]
    NotAuthenticated,
    #[error("authentication failed: {0}")]
    AuthFailed(String),
    /// Error text reported by the remote peer in a fail response.
    #[error("{0}")]
    Remote(String),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("{0}")]
    Internal(String),
}

impl RpcError {
    /// Classify a write-side I/O error per the transport contract.
    pub(crate) fn from_write_error(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::TimedOut | ErrorKind::WouldBlock => RpcError::WriteTimeout,
            ErrorKind::BrokenPipe
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
            | ErrorKind::UnexpectedEof => RpcError::ConnectionClosed,
            _ => RpcError::WriteFailed(err.to_string()),
        }
    }
}
