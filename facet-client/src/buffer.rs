//! Pooled reply buffers.
//!
//! Reply payloads and their parsed argument lists are recycled through a
//! process-wide pool to damp allocator pressure on hot read loops. Payload
//! storage is kept whenever its capacity covers the next reply; argument
//! lists are truncated, not dropped.

use crate::connection::Connection;
use crate::context::Context;
use crate::error::Error;
use facet_protocol::args::parse_reply_into;
use facet_protocol::{cmd, compress, results, Arg};
use parking_lot::Mutex;
use std::sync::Arc;

const POOL_MAX: usize = 128;

struct BufCore {
    payload: Vec<u8>,
    args: Vec<Arg>,
}

static POOL: Mutex<Vec<BufCore>> = Mutex::new(Vec::new());

fn pool_get() -> BufCore {
    POOL.lock().pop().unwrap_or(BufCore {
        payload: Vec::new(),
        args: Vec::new(),
    })
}

fn pool_put(mut core: BufCore) {
    core.args.clear();
    let mut pool = POOL.lock();
    if pool.len() < POOL_MAX {
        pool.push(core);
    }
}

/// A reply delivered to a caller.
///
/// The buffer owns its payload and parsed arguments until it is dropped,
/// at which point the storage returns to the pool. A buffer bound to a
/// server-side cursor (a paged result) also releases that cursor on drop by
/// issuing CLOSE_RESULTS in the background.
pub struct ReplyBuffer {
    payload: Vec<u8>,
    args: Vec<Arg>,
    req_id: i64,
    conn: Arc<Connection>,
}

impl ReplyBuffer {
    pub(crate) fn acquire(size: usize, conn: Arc<Connection>) -> Self {
        let mut core = pool_get();
        core.payload.resize(size, 0);
        Self {
            payload: core.payload,
            args: core.args,
            req_id: -1,
            conn,
        }
    }

    /// Parsed reply arguments, in wire order.
    pub fn args(&self) -> &[Arg] {
        &self.args
    }

    /// The result payload most replies carry as their first argument.
    pub fn result_bytes(&self) -> Option<&[u8]> {
        self.args.first().and_then(Arg::as_bytes)
    }

    /// Server-side request id of a paged result, or -1 when there is no
    /// cursor to release.
    pub fn request_id(&self) -> i64 {
        self.req_id
    }

    /// Binds this buffer to a server-side cursor. Consumers of paged scans
    /// call this with the request id from the reply's arguments.
    pub fn set_request_id(&mut self, req_id: i64) {
        self.req_id = req_id;
    }

    pub(crate) fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.payload
    }

    pub(crate) fn decompress(&mut self) -> Result<(), Error> {
        self.payload = compress::decompress(&self.payload)?;
        Ok(())
    }

    /// Parses the payload's error envelope and argument list. A non-zero
    /// remote code becomes the call's error.
    pub(crate) fn parse_args(&mut self) -> Result<(), Error> {
        let status = parse_reply_into(&self.payload, &mut self.args)?;
        if !status.is_ok() {
            return Err(Error::from_remote(status));
        }
        Ok(())
    }

    /// Fetches the next page of a paged result on the same connection,
    /// swapping the fresh payload into this buffer so iteration state is
    /// preserved. When the server reports the cursor exhausted, the buffer
    /// unbinds from it.
    pub async fn fetch(
        &mut self,
        ctx: &Context,
        offset: i32,
        limit: i32,
        as_json: bool,
    ) -> Result<(), Error> {
        let flags = if as_json {
            results::FORMAT_JSON
        } else {
            results::FORMAT_CJSON | results::WITH_ITEM_ID
        };
        let net_timeout = self.conn.options().request_timeout;
        let call_args = [
            Arg::Int32(self.req_id as i32),
            Arg::Int32(flags),
            Arg::Int32(offset),
            Arg::Int32(limit),
        ];

        let conn = self.conn.clone();
        let mut fresh = match conn
            .call(ctx, cmd::FETCH_RESULTS, net_timeout, &call_args)
            .await
        {
            Ok(fresh) => fresh,
            Err(err) => {
                self.close_cursor().await;
                return Err(err);
            }
        };

        std::mem::swap(&mut self.payload, &mut fresh.payload);
        if let Err(err) = self.parse_args() {
            self.close_cursor().await;
            return Err(err);
        }

        if self.args.get(1).and_then(Arg::as_i64) == Some(-1) {
            self.req_id = -1;
        }
        Ok(())
    }

    /// Releases the server-side cursor, if any, waiting for the reply.
    async fn close_cursor(&mut self) {
        if self.req_id < 0 {
            return;
        }
        let req_id = self.req_id;
        self.req_id = -1;
        let net_timeout = self.conn.options().request_timeout;
        if let Err(err) = self
            .conn
            .call_no_result(
                &Context::background(),
                cmd::CLOSE_RESULTS,
                net_timeout,
                &[Arg::Int32(req_id as i32)],
            )
            .await
        {
            tracing::warn!(req_id, "results close failed: {err}");
        }
    }

    /// Releases the server-side cursor without blocking; used on drop.
    fn spawn_close(&mut self) {
        if self.req_id < 0 {
            return;
        }
        let req_id = self.req_id;
        self.req_id = -1;
        let conn = self.conn.clone();
        let net_timeout = conn.options().request_timeout;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(err) = conn
                        .call_no_result(
                            &Context::background(),
                            cmd::CLOSE_RESULTS,
                            net_timeout,
                            &[Arg::Int32(req_id as i32)],
                        )
                        .await
                    {
                        tracing::warn!(req_id, "results close failed: {err}");
                    }
                });
            }
            Err(_) => {
                tracing::warn!(req_id, "paged result dropped outside a runtime; server cursor leaks");
            }
        }
    }
}

impl Drop for ReplyBuffer {
    fn drop(&mut self) {
        self.spawn_close();
        pool_put(BufCore {
            payload: std::mem::take(&mut self.payload),
            args: std::mem::take(&mut self.args),
        });
    }
}

impl std::fmt::Debug for ReplyBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplyBuffer")
            .field("payload_len", &self.payload.len())
            .field("args", &self.args.len())
            .field("req_id", &self.req_id)
            .finish()
    }
}
