//! # facet-client
//!
//! Client transport for facetdb.
//!
//! A [`Connection`] multiplexes many concurrent logical requests over a
//! single TCP connection, correlating replies to requests through sequence
//! numbers. It offers synchronous calls ([`Connection::call`]) and
//! completion-based asynchronous calls ([`Connection::call_async`]),
//! enforces per-request deadlines, and optionally compresses payloads once
//! the server announces a compatible protocol version.

pub mod buffer;
pub mod connection;
pub mod context;
pub mod error;
pub mod options;

mod slot;

pub use buffer::ReplyBuffer;
pub use connection::Connection;
pub use context::{CancelHandle, Context};
pub use error::Error;
pub use options::ConnectOptions;
pub use slot::Completion;
