//! Client error types.

use facet_protocol::{errcode, ProtocolError, RemoteStatus};
use std::sync::Arc;
use thiserror::Error;

/// Client errors.
///
/// `Io` and `Protocol` are fatal for the connection that raised them and
/// become its sticky error; `Remote`, `DeadlineExceeded` and `Canceled` are
/// local to a single call. The type is `Clone` so the sticky error can fan
/// out to every outstanding request.
#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[source] Arc<std::io::Error>),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("server error {code}: {message}")]
    Remote { code: u64, message: String },

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("canceled")]
    Canceled,

    #[error("login failed: {0}")]
    LoginFailed(#[source] Box<Error>),

    #[error("connection closed")]
    ConnectionClosed,
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(Arc::new(e))
    }
}

impl Error {
    /// Translates a reply's error envelope. Remote timeout and cancellation
    /// codes surface as their local counterparts.
    pub(crate) fn from_remote(status: RemoteStatus) -> Self {
        match status.code {
            errcode::TIMEOUT => Error::DeadlineExceeded,
            errcode::CANCELED => Error::Canceled,
            code => Error::Remote {
                code,
                message: status.message,
            },
        }
    }
}
