//! Connection management.
//!
//! A [`Connection`] runs three long-lived tasks over one TCP socket: a read
//! loop demultiplexing replies by sequence number, a write loop draining a
//! double-buffered outbound queue, and a coarse 1-second ticker that
//! cancels expired asynchronous requests. Any number of caller tasks issue
//! requests concurrently; backpressure comes from the bounded pool of
//! sequence numbers.

use crate::buffer::ReplyBuffer;
use crate::context::Context;
use crate::error::Error;
use crate::options::ConnectOptions;
use crate::slot::{
    next_seq, seq_is_valid, slot_index, Completion, ReplyEnvelope, RequestSlot, MAX_SEQ,
    QUEUE_SIZE,
};
use bytes::BytesMut;
use facet_protocol::{cmd, codec, Arg, FrameHeader, ProtocolError, HDR_LEN, MIN_SNAPPY_VERSION};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::MissedTickBehavior;

/// Initial capacity of the outbound write buffers and the socket read
/// buffer.
const BUFS_CAP: usize = 16 * 1024;

/// Period of the coarse deadline clock.
const TICK: Duration = Duration::from_secs(1);
const TICK_SECS: u32 = TICK.as_secs() as u32;

/// A connection to a facetdb server.
pub struct Connection {
    opts: ConnectOptions,

    /// Fixed ring of request slots; a sequence number owns the slot at
    /// `seq % QUEUE_SIZE`.
    requests: Vec<RequestSlot>,

    /// Pool of free sequence numbers. Acquiring blocks when all slots are
    /// outstanding.
    seq_tx: mpsc::Sender<u32>,
    seq_rx: tokio::sync::Mutex<mpsc::Receiver<u32>>,

    /// Outbound queue. Producers append under the lock; the write loop
    /// swaps the queue against its own spare buffer and writes outside it.
    wr_buf: Mutex<BytesMut>,
    wr_kick: Notify,

    /// First terminal error; sticky once set.
    err: RwLock<Option<Error>>,
    err_tx: watch::Sender<bool>,
    err_rx: watch::Receiver<bool>,

    /// User-initiated teardown.
    term_tx: watch::Sender<bool>,
    term_rx: watch::Receiver<bool>,

    /// Coarse monotonic clock in seconds, advanced by the ticker. Starts
    /// at 1 so a zero deadline always means "none".
    now: AtomicU32,

    /// Wall-clock seconds of the last successfully read frame.
    last_read_stamp: AtomicI64,

    /// Set once the server announces a snappy-capable protocol version and
    /// the client opted in.
    snappy: AtomicBool,

    /// Server start timestamp shared with the connection's owner, and
    /// whether this login observed it changing.
    server_epoch: Arc<AtomicI64>,
    server_changed: AtomicBool,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").finish_non_exhaustive()
    }
}

impl Connection {
    /// Dials the server and performs the LOGIN handshake. On success the
    /// read loop, write loop and deadline ticker are running.
    pub async fn connect(opts: ConnectOptions) -> Result<Arc<Self>, Error> {
        Self::connect_with_epoch(opts, Arc::new(AtomicI64::new(0))).await
    }

    /// Like [`Connection::connect`], with an owner-shared cell holding the
    /// last observed server start timestamp. A pool passes the same cell to
    /// every connection it opens so a server restart is detected across
    /// reconnects (see [`Connection::server_changed`]).
    pub async fn connect_with_epoch(
        opts: ConnectOptions,
        server_epoch: Arc<AtomicI64>,
    ) -> Result<Arc<Self>, Error> {
        let (seq_tx, seq_rx) = mpsc::channel(QUEUE_SIZE);
        for seq in 0..QUEUE_SIZE as u32 {
            // Capacity equals the number of seeds; this cannot fail.
            let _ = seq_tx.try_send(seq);
        }
        let (err_tx, err_rx) = watch::channel(false);
        let (term_tx, term_rx) = watch::channel(false);

        let conn = Arc::new(Self {
            opts,
            requests: (0..QUEUE_SIZE).map(|_| RequestSlot::new()).collect(),
            seq_tx,
            seq_rx: tokio::sync::Mutex::new(seq_rx),
            wr_buf: Mutex::new(BytesMut::with_capacity(BUFS_CAP)),
            wr_kick: Notify::new(),
            err: RwLock::new(None),
            err_tx,
            err_rx,
            term_tx,
            term_rx,
            now: AtomicU32::new(1),
            last_read_stamp: AtomicI64::new(0),
            snappy: AtomicBool::new(false),
            server_epoch,
            server_changed: AtomicBool::new(false),
        });

        tokio::spawn(conn.clone().deadline_ticker());

        let ctx = Context::background().with_net_timeout(conn.opts.login_timeout);
        match conn.dial_and_login(&conn, &ctx).await {
            Ok(()) => Ok(conn),
            Err(err) => {
                conn.fan_error(err.clone());
                Err(err)
            }
        }
    }

    async fn dial_and_login(&self, this: &Arc<Self>, ctx: &Context) -> Result<(), Error> {
        let stream = self.dial(ctx).await?;
        stream.set_nodelay(true).ok();

        let (rd, wr) = stream.into_split();
        tokio::spawn(
            this.clone()
                .read_loop(BufReader::with_capacity(BUFS_CAP, rd)),
        );
        tokio::spawn(this.clone().write_loop(wr));

        self.login(ctx)
            .await
            .map_err(|err| Error::LoginFailed(Box::new(err)))
    }

    async fn dial(&self, ctx: &Context) -> Result<TcpStream, Error> {
        let connect = TcpStream::connect(self.opts.addr.as_str());
        match ctx.deadline() {
            Some(at) => match tokio::time::timeout_at(at, connect).await {
                Ok(res) => Ok(res?),
                Err(_) => Err(Error::DeadlineExceeded),
            },
            None => Ok(connect.await?),
        }
    }

    async fn login(&self, ctx: &Context) -> Result<(), Error> {
        tracing::debug!(addr = %self.opts.addr, "logging in");
        let args = [
            Arg::String(self.opts.username.clone()),
            Arg::String(self.opts.password.clone()),
            Arg::String(self.opts.database.clone()),
            Arg::Bool(self.opts.create_db_if_missing),
            Arg::Bool(false),
            Arg::Int32(-1),
            Arg::String(self.opts.client_version.clone()),
            Arg::String(self.opts.app_name.clone()),
        ];
        let buf = self.call(ctx, cmd::LOGIN, Duration::ZERO, &args).await?;

        if let Some(start_ts) = buf.args().get(1).and_then(Arg::as_i64) {
            let old = self.server_epoch.swap(start_ts, Ordering::SeqCst);
            if old != 0 && old != start_ts {
                tracing::debug!(old, new = start_ts, "server start timestamp changed");
                self.server_changed.store(true, Ordering::SeqCst);
            }
        }
        Ok(())
    }

    // =========================================================================
    // Public call surface
    // =========================================================================

    /// Issues a request and waits for its reply.
    ///
    /// `net_timeout` bounds the round-trip; zero inherits the context's
    /// deadline unchanged. The effective remaining time is also forwarded
    /// to the server as the request's execution timeout.
    pub async fn call(
        &self,
        ctx: &Context,
        command: u16,
        net_timeout: Duration,
        args: &[Arg],
    ) -> Result<ReplyBuffer, Error> {
        let ctx = ctx.with_net_timeout(net_timeout);
        let (seq, remaining) = self.acquire(&ctx).await?;
        let slot = &self.requests[slot_index(seq)];

        slot.seq.store(seq, Ordering::Release);
        if let Err(err) = self.send_request(command, seq, remaining, args) {
            slot.seq.store(MAX_SEQ, Ordering::Release);
            self.recycle(seq);
            return Err(err);
        }

        let result;
        {
            let mut reply = slot.reply_rx.lock().await;
            result = loop {
                tokio::select! {
                    env = reply.recv() => match env {
                        Some(env) => {
                            if env.seq == seq {
                                break Ok(env.buf);
                            }
                            // Late reply for a previous occupant of this
                            // slot; drop it and keep waiting.
                        }
                        None => break Err(Error::ConnectionClosed),
                    },
                    _ = closed(self.err_rx.clone()) => {
                        break Err(self.current_error().unwrap_or(Error::ConnectionClosed));
                    }
                    _ = ctx.done() => {
                        break Err(ctx.err().unwrap_or(Error::Canceled));
                    }
                }
            };

            slot.seq.store(MAX_SEQ, Ordering::Release);
            if let Ok(env) = reply.try_recv() {
                drop(env);
            }
        }
        self.recycle(seq);

        let mut buf = result?;
        buf.parse_args()?;
        Ok(buf)
    }

    /// Issues a request whose reply carries no payload of interest.
    pub async fn call_no_result(
        &self,
        ctx: &Context,
        command: u16,
        net_timeout: Duration,
        args: &[Arg],
    ) -> Result<(), Error> {
        self.call(ctx, command, net_timeout, args).await.map(drop)
    }

    /// Issues a request and delivers its outcome through `completion`,
    /// which is invoked exactly once: by the read loop on a reply, by the
    /// deadline ticker on expiry, or by the error fan-out on a terminal
    /// connection error. Suspends only while acquiring a free slot.
    pub async fn call_async(
        &self,
        ctx: &Context,
        command: u16,
        net_timeout: Duration,
        completion: Completion,
        args: &[Arg],
    ) {
        if let Some(err) = self.current_error() {
            completion(Err(err));
            return;
        }

        let ctx = ctx.with_net_timeout(net_timeout);
        let (seq, remaining) = match self.acquire(&ctx).await {
            Ok(acquired) => acquired,
            Err(err) => {
                completion(Err(err));
                return;
            }
        };

        let slot = &self.requests[slot_index(seq)];
        let deadline = match remaining {
            Some(left) => self.now.load(Ordering::SeqCst) + left.as_secs() as u32,
            None => 0,
        };
        slot.arm_async(seq, deadline, completion);

        if let Err(err) = self.send_request(command, seq, remaining, args) {
            if let Some((completion, seq)) = slot.claim_any() {
                self.recycle(seq);
                completion(Err(err));
            }
            return;
        }

        // A terminal error may have fanned out between the entry check and
        // arming the slot; claim the completion back so it cannot leak.
        if self.has_error() {
            if let Some((completion, seq)) = slot.claim_any() {
                self.recycle(seq);
                completion(Err(self.current_error().unwrap_or(Error::ConnectionClosed)));
            }
        }
    }

    /// Pings the server.
    pub async fn ping(&self, ctx: &Context) -> Result<(), Error> {
        self.call_no_result(ctx, cmd::PING, self.opts.request_timeout, &[])
            .await
    }

    /// Wall-clock time of the last successfully read frame.
    pub fn last_read_time(&self) -> SystemTime {
        let stamp = self.last_read_stamp.load(Ordering::Relaxed);
        UNIX_EPOCH + Duration::from_secs(stamp.max(0) as u64)
    }

    pub fn has_error(&self) -> bool {
        self.err.read().is_some()
    }

    pub fn current_error(&self) -> Option<Error> {
        self.err.read().clone()
    }

    /// Whether this connection's login observed a different server start
    /// timestamp than the owner's previous session, meaning derived state
    /// (such as prepared queries) must be invalidated.
    pub fn server_changed(&self) -> bool {
        self.server_changed.load(Ordering::SeqCst)
    }

    pub fn options(&self) -> &ConnectOptions {
        &self.opts
    }

    /// Tears the connection down: stops all three loops and fails every
    /// outstanding request.
    pub fn finalize(&self) {
        let _ = self.term_tx.send(true);
        self.fan_error(Error::ConnectionClosed);
    }

    // =========================================================================
    // Slot lifecycle
    // =========================================================================

    /// Dequeues a free sequence number, honoring context cancellation and
    /// deadline. Returns the seq and the time left before the deadline,
    /// if there is one.
    async fn acquire(&self, ctx: &Context) -> Result<(u32, Option<Duration>), Error> {
        if let Some(err) = ctx.err() {
            return Err(err);
        }

        let mut seqs = tokio::select! {
            guard = self.seq_rx.lock() => guard,
            _ = ctx.done() => return Err(ctx.err().unwrap_or(Error::Canceled)),
        };
        let seq = tokio::select! {
            seq = seqs.recv() => match seq {
                Some(seq) => seq,
                None => return Err(Error::ConnectionClosed),
            },
            _ = ctx.done() => return Err(ctx.err().unwrap_or(Error::Canceled)),
        };
        drop(seqs);

        // The seq was never stamped: put it back unchanged.
        if let Some(err) = ctx.err() {
            let _ = self.seq_tx.try_send(seq);
            return Err(err);
        }
        let remaining = match ctx.deadline() {
            Some(at) => {
                let now = tokio::time::Instant::now();
                if at <= now {
                    let _ = self.seq_tx.try_send(seq);
                    return Err(Error::DeadlineExceeded);
                }
                Some(at - now)
            }
            None => None,
        };
        Ok((seq, remaining))
    }

    /// Returns a used seq's successor to the free pool.
    fn recycle(&self, seq: u32) {
        // The pool's multiset of in-flight plus queued seqs is constant, so
        // the bounded channel always has room here.
        let _ = self.seq_tx.try_send(next_seq(seq));
    }

    fn send_request(
        &self,
        command: u16,
        seq: u32,
        remaining: Option<Duration>,
        args: &[Arg],
    ) -> Result<(), Error> {
        let exec_timeout_ms = remaining.map(|left| left.as_millis() as i64).unwrap_or(0);
        let frame = codec::encode_request(
            command,
            seq,
            args,
            exec_timeout_ms,
            self.snappy.load(Ordering::Relaxed),
        )?;
        self.write(&frame);
        Ok(())
    }

    fn write(&self, bytes: &[u8]) {
        self.wr_buf.lock().extend_from_slice(bytes);
        self.wr_kick.notify_one();
    }

    // =========================================================================
    // Background loops
    // =========================================================================

    async fn read_loop(self: Arc<Self>, mut rd: BufReader<OwnedReadHalf>) {
        let mut hdr = [0u8; HDR_LEN];
        loop {
            tokio::select! {
                res = read_reply(&self, &mut rd, &mut hdr) => {
                    if let Err(err) = res {
                        self.fan_error(err);
                        return;
                    }
                    self.last_read_stamp.store(unix_now(), Ordering::Relaxed);
                }
                _ = closed(self.err_rx.clone()) => return,
                _ = closed(self.term_rx.clone()) => return,
            }
        }
    }

    async fn write_loop(self: Arc<Self>, mut wr: OwnedWriteHalf) {
        let mut out = BytesMut::with_capacity(BUFS_CAP);
        loop {
            tokio::select! {
                _ = self.wr_kick.notified() => {}
                _ = closed(self.err_rx.clone()) => return,
                _ = closed(self.term_rx.clone()) => return,
            }
            {
                let mut pending = self.wr_buf.lock();
                if pending.is_empty() {
                    if self.has_error() {
                        return;
                    }
                    continue;
                }
                std::mem::swap(&mut *pending, &mut out);
            }
            if let Err(err) = wr.write_all(&out).await {
                self.fan_error(err.into());
                return;
            }
            out.clear();
        }
    }

    async fn deadline_ticker(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await; // the first tick is immediate
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = closed(self.err_rx.clone()) => return,
                _ = closed(self.term_rx.clone()) => return,
            }
            let now = self.now.fetch_add(TICK_SECS, Ordering::SeqCst) + TICK_SECS;
            for slot in &self.requests {
                if !seq_is_valid(slot.seq.load(Ordering::Acquire)) {
                    continue;
                }
                let deadline = slot.deadline.load(Ordering::Acquire);
                if deadline == 0 || now < deadline || !slot.is_async.load(Ordering::Acquire) {
                    continue;
                }
                if let Some((completion, seq)) = slot.claim_expired(deadline) {
                    self.recycle(seq);
                    tracing::debug!(seq, deadline, "canceling request on deadline");
                    completion(Err(Error::DeadlineExceeded));
                }
            }
        }
    }

    // =========================================================================
    // Failure handling
    // =========================================================================

    /// Records the first terminal error, wakes every waiter and fails all
    /// outstanding asynchronous requests. Idempotent.
    fn fan_error(&self, err: Error) {
        {
            let mut sticky = self.err.write();
            if sticky.is_some() {
                return;
            }
            *sticky = Some(err.clone());
        }
        tracing::debug!("connection failed: {err}");
        let _ = self.err_tx.send(true);

        for slot in &self.requests {
            if !slot.is_async.load(Ordering::Acquire) {
                continue;
            }
            if let Some((completion, seq)) = slot.claim_any() {
                self.recycle(seq);
                completion(Err(err.clone()));
            }
        }
    }
}

/// Reads and dispatches one reply frame.
async fn read_reply(
    conn: &Arc<Connection>,
    rd: &mut BufReader<OwnedReadHalf>,
    hdr: &mut [u8; HDR_LEN],
) -> Result<(), Error> {
    rd.read_exact(hdr).await?;
    let head = FrameHeader::decode(hdr)?;

    if conn.opts.enable_compression && head.version >= MIN_SNAPPY_VERSION {
        conn.snappy.store(true, Ordering::Relaxed);
    }
    if !seq_is_valid(head.seq) {
        return Err(ProtocolError::InvalidSeq(head.seq).into());
    }

    let slot = &conn.requests[slot_index(head.seq)];
    let size = head.size as usize;
    if slot.seq.load(Ordering::Acquire) != head.seq {
        // Nobody is waiting on this seq anymore. Consume the payload so the
        // stream stays framed.
        discard(rd, size).await?;
        return Ok(());
    }

    let mut buf = ReplyBuffer::acquire(size, conn.clone());
    rd.read_exact(buf.payload_mut()).await?;
    if head.compressed {
        buf.decompress()?;
    }

    if slot.is_async.load(Ordering::Acquire) {
        if let Some(completion) = slot.claim_reply(head.seq) {
            conn.recycle(head.seq);
            match buf.parse_args() {
                Ok(()) => completion(Ok(buf)),
                Err(err) => completion(Err(err)),
            }
        }
        // Claim lost against the ticker or the fan-out: drop the reply.
    } else {
        let _ = slot.reply_tx.send(ReplyEnvelope {
            seq: head.seq,
            buf,
        });
    }
    Ok(())
}

async fn discard(rd: &mut BufReader<OwnedReadHalf>, mut remaining: usize) -> Result<(), Error> {
    let mut scratch = [0u8; 4096];
    while remaining > 0 {
        let want = remaining.min(scratch.len());
        let got = rd.read(&mut scratch[..want]).await?;
        if got == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed mid-frame",
            )
            .into());
        }
        remaining -= got;
    }
    Ok(())
}

/// Resolves once the signal is raised.
async fn closed(mut rx: watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}
