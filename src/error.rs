//! Unified error types for rtmp-client
//!
//! The taxonomy follows how far a failure reaches:
//! - transport, protocol, codec and handshake errors are fatal to the session
//!   when they escape the reader or writer loop
//! - [`InvocationError`] is local to the one pending invocation
//! - [`MisuseError`] is reported to the immediate caller only
//! - [`Error::Disconnected`] carries the session's cached [`Disconnect`] cause,
//!   shared by every operation that fails after teardown

use std::fmt;
use std::io;
use std::sync::Arc;

use crate::amf::AmfValue;

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for all client operations
///
/// `Error` is cheap to clone so that a single disconnect fault can be handed
/// to every suspended caller.
#[derive(Debug, Clone)]
pub enum Error {
    /// I/O error during network operations
    Io(Arc<io::Error>),
    /// TLS setup or certificate failure
    Tls(String),
    /// RTMP protocol violation
    Protocol(ProtocolError),
    /// AMF encoding/decoding error
    Amf(AmfError),
    /// Handshake failure
    Handshake(HandshakeError),
    /// The remote side answered an invocation with `_error`
    Invocation(InvocationError),
    /// The session is closed; carries the recorded cause
    Disconnected(Arc<Disconnect>),
    /// Local API misuse (disposed stream, chunk stream id collision)
    Misuse(MisuseError),
    /// Operation timed out
    Timeout,
    /// Connection was closed
    ConnectionClosed,
    /// Invalid configuration
    Config(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Tls(msg) => write!(f, "TLS error: {}", msg),
            Error::Protocol(e) => write!(f, "Protocol error: {}", e),
            Error::Amf(e) => write!(f, "AMF error: {}", e),
            Error::Handshake(e) => write!(f, "Handshake error: {}", e),
            Error::Invocation(e) => write!(f, "Invocation failed: {}", e),
            Error::Disconnected(d) => write!(f, "Disconnected: {}", d),
            Error::Misuse(e) => write!(f, "Invalid operation: {}", e),
            Error::Timeout => write!(f, "Operation timed out"),
            Error::ConnectionClosed => write!(f, "Connection closed"),
            Error::Config(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e.as_ref()),
            Error::Disconnected(d) => d
                .cause
                .as_ref()
                .map(|e| e as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(Arc::new(err))
    }
}

impl From<ProtocolError> for Error {
    fn from(err: ProtocolError) -> Self {
        Error::Protocol(err)
    }
}

impl From<AmfError> for Error {
    fn from(err: AmfError) -> Self {
        Error::Amf(err)
    }
}

impl From<HandshakeError> for Error {
    fn from(err: HandshakeError) -> Self {
        Error::Handshake(err)
    }
}

impl From<InvocationError> for Error {
    fn from(err: InvocationError) -> Self {
        Error::Invocation(err)
    }
}

impl From<MisuseError> for Error {
    fn from(err: MisuseError) -> Self {
        Error::Misuse(err)
    }
}

/// Why a session ended
///
/// Recorded exactly once per session; the first close request wins.
#[derive(Debug)]
pub struct Disconnect {
    /// Human readable reason
    pub reason: String,
    /// Underlying error, if the close was caused by one
    pub cause: Option<Error>,
}

impl Disconnect {
    pub fn new(reason: impl Into<String>, cause: Option<Error>) -> Self {
        Self {
            reason: reason.into(),
            cause,
        }
    }
}

impl fmt::Display for Disconnect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.cause {
            Some(cause) => write!(f, "{} ({})", self.reason, cause),
            None => write!(f, "{}", self.reason),
        }
    }
}

/// Protocol-level errors
#[derive(Debug, Clone)]
pub enum ProtocolError {
    InvalidChunkHeader,
    MessageTooLarge { size: u32, max: u32 },
    InvalidChunkStreamId(u32),
    /// A compressed chunk header arrived for a chunk stream with no prior header
    UnknownChunkStream(u32),
    UnexpectedMessage(String),
    InvalidCommand(String),
    InvalidSharedObject(String),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::InvalidChunkHeader => write!(f, "Invalid chunk header"),
            ProtocolError::MessageTooLarge { size, max } => {
                write!(f, "Message too large: {} bytes (max {})", size, max)
            }
            ProtocolError::InvalidChunkStreamId(id) => write!(f, "Invalid chunk stream ID: {}", id),
            ProtocolError::UnknownChunkStream(id) => {
                write!(f, "Compressed header on chunk stream {} without a prior header", id)
            }
            ProtocolError::UnexpectedMessage(msg) => write!(f, "Unexpected message: {}", msg),
            ProtocolError::InvalidCommand(cmd) => write!(f, "Invalid command: {}", cmd),
            ProtocolError::InvalidSharedObject(msg) => {
                write!(f, "Invalid shared object message: {}", msg)
            }
        }
    }
}

impl std::error::Error for ProtocolError {}

/// AMF encoding/decoding errors
#[derive(Debug, Clone, PartialEq)]
pub enum AmfError {
    UnknownMarker(u8),
    UnexpectedEof,
    InvalidUtf8,
    InvalidReference(u32),
    NestingTooDeep,
    InvalidObjectEnd,
    /// Externalizable AMF3 classes cannot be decoded without their class code
    Unsupported(String),
}

impl fmt::Display for AmfError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AmfError::UnknownMarker(m) => write!(f, "Unknown AMF marker: 0x{:02x}", m),
            AmfError::UnexpectedEof => write!(f, "Unexpected end of AMF data"),
            AmfError::InvalidUtf8 => write!(f, "Invalid UTF-8 in AMF string"),
            AmfError::InvalidReference(idx) => write!(f, "Invalid AMF reference: {}", idx),
            AmfError::NestingTooDeep => write!(f, "AMF nesting too deep"),
            AmfError::InvalidObjectEnd => write!(f, "Invalid object end marker"),
            AmfError::Unsupported(what) => write!(f, "Unsupported AMF value: {}", what),
        }
    }
}

impl std::error::Error for AmfError {}

/// Handshake-specific errors
#[derive(Debug, Clone)]
pub enum HandshakeError {
    InvalidVersion(u8),
    InvalidState,
}

impl fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandshakeError::InvalidVersion(v) => write!(f, "Invalid RTMP version: {}", v),
            HandshakeError::InvalidState => write!(f, "Invalid handshake state"),
        }
    }
}

impl std::error::Error for HandshakeError {}

/// Fault returned by the remote side for one invocation
#[derive(Debug, Clone, Default)]
pub struct InvocationError {
    pub fault_code: Option<String>,
    pub fault_string: Option<String>,
    pub root_cause: Option<String>,
    /// The raw fault payload as received
    pub extended_data: AmfValue,
}

impl InvocationError {
    /// Fault carrying only a message
    pub fn message(text: impl Into<String>) -> Self {
        Self {
            fault_string: Some(text.into()),
            ..Default::default()
        }
    }
}

impl fmt::Display for InvocationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.fault_code, &self.fault_string) {
            (Some(code), Some(text)) => write!(f, "{}: {}", code, text),
            (Some(code), None) => write!(f, "{}", code),
            (None, Some(text)) => write!(f, "{}", text),
            (None, None) => write!(f, "remote invocation failed"),
        }
    }
}

impl std::error::Error for InvocationError {}

/// Local misuse, reported to the caller and never fatal to the session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MisuseError {
    /// The NetStream was deleted
    StreamDisposed,
    /// A chunk stream is already registered under this server id
    ChunkStreamCollision(u32),
}

impl fmt::Display for MisuseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MisuseError::StreamDisposed => write!(f, "NetStream has been deleted"),
            MisuseError::ChunkStreamCollision(id) => {
                write!(f, "Chunk stream {} is already registered", id)
            }
        }
    }
}

impl std::error::Error for MisuseError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as StdError;

    #[test]
    fn test_error_display() {
        let io_err = io::Error::new(io::ErrorKind::ConnectionReset, "connection reset");
        let err: Error = io_err.into();
        assert!(err.to_string().contains("I/O error"));

        let err = Error::Protocol(ProtocolError::UnknownChunkStream(7));
        assert!(err.to_string().contains("Protocol error"));
        assert!(err.to_string().contains("7"));

        let err = Error::Amf(AmfError::UnknownMarker(0xFF));
        assert!(err.to_string().contains("0xff"));

        let err = Error::Misuse(MisuseError::ChunkStreamCollision(24));
        assert!(err.to_string().contains("24"));

        let err = Error::Invocation(InvocationError {
            fault_code: Some("Server.Error".into()),
            fault_string: Some("boom".into()),
            ..Default::default()
        });
        assert!(err.to_string().contains("Server.Error: boom"));
    }

    #[test]
    fn test_disconnect_source_chain() {
        let cause: Error = io::Error::new(io::ErrorKind::BrokenPipe, "pipe").into();
        let err = Error::Disconnected(Arc::new(Disconnect::new("transport failed", Some(cause))));
        assert!(err.to_string().contains("transport failed"));
        let source = StdError::source(&err).expect("cause should be exposed");
        assert!(source.to_string().contains("pipe"));

        let err = Error::Disconnected(Arc::new(Disconnect::new("close-requested-by-user", None)));
        assert!(StdError::source(&err).is_none());
    }

    #[test]
    fn test_clone_shares_disconnect() {
        let disconnect = Arc::new(Disconnect::new("gone", None));
        let a = Error::Disconnected(disconnect.clone());
        let b = a.clone();
        match (a, b) {
            (Error::Disconnected(x), Error::Disconnected(y)) => assert!(Arc::ptr_eq(&x, &y)),
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_invocation_error_display_fallbacks() {
        assert_eq!(InvocationError::default().to_string(), "remote invocation failed");
        assert_eq!(InvocationError::message("nope").to_string(), "nope");
    }
}
