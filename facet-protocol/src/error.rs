//! Protocol error types.

use thiserror::Error;

/// Errors raised while framing or parsing wire data.
///
/// Every variant is fatal for the connection that produced it: once framing
/// is in doubt there is no way to find the next header boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("invalid magic: {0:#010x}")]
    InvalidMagic(u32),

    #[error("unsupported protocol version {0:#06x}")]
    UnsupportedVersion(u16),

    #[error("invalid sequence number: {0}")]
    InvalidSeq(u32),

    #[error("truncated payload")]
    UnexpectedEof,

    #[error("malformed varint")]
    BadVarint,

    #[error("unknown argument tag: {0}")]
    UnknownArgTag(u64),

    #[error("invalid UTF-8 in string argument")]
    InvalidUtf8,

    #[error("snappy: {0}")]
    Compression(String),
}
