//! Error types
//!
//! `Error` is the crate-level error returned by network-facing operations.
//! Table operations return the narrower [`RegistryError`].

use std::fmt;
use std::io;

pub use crate::registry::RegistryError;

/// Crate-level result alias
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error
#[derive(Debug)]
pub enum Error {
    /// Transport I/O failure
    Io(io::Error),
    /// Malformed wire data
    Codec(CodecError),
    /// Handshake failure (version mismatch, unexpected message)
    Handshake(HandshakeError),
    /// Table operation failure
    Registry(RegistryError),
    /// Peer closed the connection
    ConnectionClosed,
    /// Operation did not complete in time
    Timeout,
    /// Client operation attempted without a connection
    NotConnected,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Codec(e) => write!(f, "Codec error: {}", e),
            Error::Handshake(e) => write!(f, "Handshake error: {}", e),
            Error::Registry(e) => write!(f, "Table error: {}", e),
            Error::ConnectionClosed => write!(f, "Connection closed"),
            Error::Timeout => write!(f, "Operation timed out"),
            Error::NotConnected => write!(f, "Not connected"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Codec(e) => Some(e),
            Error::Handshake(e) => Some(e),
            Error::Registry(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<CodecError> for Error {
    fn from(e: CodecError) -> Self {
        Error::Codec(e)
    }
}

impl From<HandshakeError> for Error {
    fn from(e: HandshakeError) -> Self {
        Error::Handshake(e)
    }
}

impl From<RegistryError> for Error {
    fn from(e: RegistryError) -> Self {
        Error::Registry(e)
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Error::Timeout
    }
}

/// Wire decoding errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Input ended before the frame or field was complete
    Truncated,
    /// Frame tag is not a known message type
    UnknownTag(u8),
    /// Value type tag is not a known value type
    UnknownValueType(u8),
    /// Varint is longer than 10 bytes or overflows 64 bits
    MalformedVarint,
    /// Boolean byte other than 0 or 1
    InvalidBool(u8),
    /// String field is not valid UTF-8
    InvalidUtf8,
    /// Payload has bytes left over after the message was decoded
    TrailingBytes(usize),
    /// Declared frame length exceeds the limit
    FrameTooLarge { len: usize, max: usize },
}

impl CodecError {
    /// Whether the stream framing is lost and the connection must close
    pub fn is_fatal(&self) -> bool {
        matches!(self, CodecError::FrameTooLarge { .. })
    }
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::Truncated => write!(f, "truncated input"),
            CodecError::UnknownTag(tag) => write!(f, "unknown message tag 0x{:02x}", tag),
            CodecError::UnknownValueType(tag) => write!(f, "unknown value type 0x{:02x}", tag),
            CodecError::MalformedVarint => write!(f, "malformed varint"),
            CodecError::InvalidBool(b) => write!(f, "invalid boolean byte 0x{:02x}", b),
            CodecError::InvalidUtf8 => write!(f, "invalid UTF-8 string"),
            CodecError::TrailingBytes(n) => write!(f, "{} trailing bytes after message", n),
            CodecError::FrameTooLarge { len, max } => {
                write!(f, "frame length {} exceeds maximum {}", len, max)
            }
        }
    }
}

impl std::error::Error for CodecError {}

/// Handshake errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    /// Peer speaks an incompatible protocol version
    ProtocolVersionMismatch { local: u16, remote: u16 },
    /// Server refused the connection
    Rejected { server_version: u16, reason: String },
    /// A message arrived that is not valid during the handshake
    UnexpectedMessage(&'static str),
}

impl fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandshakeError::ProtocolVersionMismatch { local, remote } => write!(
                f,
                "protocol version mismatch: local 0x{:04x}, remote 0x{:04x}",
                local, remote
            ),
            HandshakeError::Rejected {
                server_version,
                reason,
            } => write!(
                f,
                "rejected by server (version 0x{:04x}): {}",
                server_version, reason
            ),
            HandshakeError::UnexpectedMessage(kind) => {
                write!(f, "unexpected {} message during handshake", kind)
            }
        }
    }
}

impl std::error::Error for HandshakeError {}
