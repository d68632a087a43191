//! # facet-protocol
//!
//! Wire protocol implementation for facetdb's binary RPC.
//!
//! This crate provides:
//! - The 16-byte little-endian frame header (magic, version, command,
//!   payload size, sequence number)
//! - A tagged, self-describing argument codec over varints
//! - Request/reply payload composition, including the reply error envelope
//! - Snappy block compression for negotiated connections

pub mod args;
pub mod codec;
pub mod compress;
pub mod error;
pub mod frame;
pub mod wire;

pub use args::{Arg, RemoteStatus};
pub use error::ProtocolError;
pub use frame::{FrameHeader, HDR_LEN, MAGIC};

/// Protocol version announced by this client.
pub const PROTOCOL_VERSION: u16 = 0x103;

/// Oldest server protocol version this client can talk to.
pub const MIN_COMPAT_VERSION: u16 = 0x101;

/// First protocol version that understands snappy-compressed payloads.
pub const MIN_SNAPPY_VERSION: u16 = 0x103;

/// Default port for facetdb servers.
pub const DEFAULT_PORT: u16 = 6534;

/// Command codes the transport itself issues. All other codes pass through
/// the transport opaquely.
pub mod cmd {
    pub const PING: u16 = 0;
    pub const LOGIN: u16 = 1;
    pub const FETCH_RESULTS: u16 = 50;
    pub const CLOSE_RESULTS: u16 = 51;
}

/// Remote error codes with transport-level meaning. Any other non-zero code
/// surfaces as a remote error local to the call.
pub mod errcode {
    pub const OK: u64 = 0;
    pub const TIMEOUT: u64 = 19;
    pub const CANCELED: u64 = 20;
}

/// Result-format flags forwarded on FETCH_RESULTS.
pub mod results {
    pub const FORMAT_CJSON: i32 = 0x2;
    pub const FORMAT_JSON: i32 = 0x3;
    pub const WITH_ITEM_ID: i32 = 0x20;
}
