//! Error types for the chatwire core protocol.

use crate::session::ConnectionState;
use thiserror::Error;

/// Core protocol errors
#[derive(Debug, Error)]
pub enum Error {
    /// Binary codec error
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Connection state error
    #[error("state error: {0}")]
    State(#[from] StateError),

    /// Cryptographic error
    #[error("crypto error: {0}")]
    Crypto(#[from] chatwire_crypto::CryptoError),
}

/// Malformed wire data.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// Input ended before a complete value could be read
    #[error("unexpected end of input at offset {offset}: needed {needed} more bytes")]
    UnexpectedEof {
        /// Offset of the failed read
        offset: usize,
        /// Bytes the read required
        needed: usize,
    },

    /// `STREAM_END` found where a node descriptor was expected
    #[error("unexpected stream end")]
    UnexpectedStreamEnd,

    /// A node's list size was zero
    #[error("node list size must be non-zero")]
    EmptyNode,

    /// A node tag decoded or constructed as the empty string
    #[error("node tag must not be empty")]
    EmptyTag,

    /// Tag byte not valid where it appeared
    #[error("unexpected tag 0x{tag:02X} at offset {offset}")]
    UnexpectedTag {
        /// Offending byte
        tag: u8,
        /// Offset of the byte
        offset: usize,
    },

    /// Single-byte token index with no table entry
    #[error("invalid token index: {0}")]
    InvalidToken(u8),

    /// Double-byte token with no table entry
    #[error("invalid double-byte token: page {page}, index {index}")]
    InvalidDoubleToken {
        /// Dictionary page
        page: u8,
        /// Index within the page
        index: u8,
    },

    /// Invalid nibble or hex digit in a packed string
    #[error("invalid packed value: 0x{0:X}")]
    InvalidPacked(u8),

    /// String bytes are not valid UTF-8
    #[error("string is not valid UTF-8")]
    InvalidUtf8,

    /// Attribute key repeated within one node
    #[error("duplicate attribute: {0}")]
    DuplicateAttribute(String),

    /// Bytes left over after the root node
    #[error("{0} trailing bytes after root node")]
    TrailingBytes(usize),

    /// Nesting exceeded the decoder limit
    #[error("nesting deeper than {0} levels")]
    TooDeep(usize),

    /// Value too large for its length prefix
    #[error("value too large to encode: {0}")]
    TooLarge(usize),
}

/// Connection state machine errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    /// Transition not permitted from the current state
    #[error("invalid transition: {from:?} -> {to:?}")]
    InvalidTransition {
        /// State before the attempted transition
        from: ConnectionState,
        /// Requested state
        to: ConnectionState,
    },
}

/// Result type for codec operations
pub type CodecResult<T> = std::result::Result<T, CodecError>;
