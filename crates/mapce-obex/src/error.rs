//! Error types for the OBEX layer.

use thiserror::Error;

/// OBEX layer errors
#[derive(Debug, Error)]
pub enum ObexError {
    /// Packet shorter than its own length field or the fixed prefix
    #[error("packet too short: expected at least {expected}, got {actual}")]
    TooShort {
        /// Expected minimum size
        expected: usize,
        /// Actual size received
        actual: usize,
    },

    /// A header ran past the end of the packet
    #[error("truncated header 0x{0:02X}")]
    TruncatedHeader(u8),

    /// Header length field smaller than its own encoding
    #[error("invalid header length for 0x{0:02X}")]
    InvalidHeaderLength(u8),

    /// Unicode header payload was not valid UTF-16
    #[error("malformed unicode header 0x{0:02X}")]
    MalformedUnicode(u8),

    /// Body/End-of-Body supplied directly to an API that manages chunking
    #[error("body headers are managed by the engine")]
    BodyNotAllowed,

    /// A send or receive object is already active on this session
    #[error("operation already in progress")]
    OperationInProgress,

    /// No operation is active for the requested action
    #[error("no active operation")]
    NoActiveOperation,

    /// Session is not connected
    #[error("session not connected")]
    NotConnected,

    /// Headers too large for the negotiated packet length
    #[error("headers exceed negotiated packet length ({0} bytes)")]
    HeadersTooLarge(usize),

    /// Transport rejected or dropped an outgoing packet
    #[error("transport send failed: {0}")]
    Transport(String),
}

/// Result type for OBEX operations
pub type Result<T> = std::result::Result<T, ObexError>;
