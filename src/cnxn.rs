//! The connection capability this crate consumes but never implements.
//!
//! `Cnxn` is the external collaborator described in the spec: the wire protocol parser and
//! request handler live behind it. The factory only ever reads the handful of attributes listed
//! here and calls `do_io`/`close`.

use std::collections::BTreeMap;
use std::net::SocketAddr;

use mio::{Registry, Token};

/// A value in a [`Cnxn::connection_info`] snapshot. Stands in for "map<string, any>".
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionInfoValue {
    /// A string field (e.g. a formatted remote address).
    Str(String),
    /// An integer field (e.g. a byte counter).
    I64(i64),
    /// A boolean field (e.g. whether the connection is selectable).
    Bool(bool),
}

/// What a [`Cnxn`] needs to drive I/O for one ready event: its registered token, and (for
/// non-inline workers) a reusable scratch buffer owned by the calling worker thread.
///
/// `stopping` lets `do_io` short-circuit without the connection needing its own back-channel to
/// the factory's lifecycle state.
#[derive(Debug)]
pub struct IoContext<'a> {
    token: Token,
    direct_buffer: Option<&'a mut [u8]>,
    stopping: bool,
}

impl<'a> IoContext<'a> {
    /// Builds a context for one `do_io` call.
    pub fn new(token: Token, direct_buffer: Option<&'a mut [u8]>, stopping: bool) -> Self {
        Self {
            token,
            direct_buffer,
            stopping,
        }
    }

    /// The token this connection is registered under with its owning selector.
    pub fn token(&self) -> Token {
        self.token
    }

    /// The calling worker's reusable direct buffer, if `directBufferBytes` is nonzero.
    pub fn direct_buffer(&mut self) -> Option<&mut [u8]> {
        self.direct_buffer.as_deref_mut()
    }

    /// Whether the factory has begun shutting down. A `Cnxn` is not required to act on this; the
    /// worker closes the connection itself once `do_io` returns when this is set.
    pub fn is_stopping(&self) -> bool {
        self.stopping
    }
}

/// The external connection capability accepted sockets are wrapped in.
///
/// Implementations own the underlying `mio::net::TcpStream` and whatever wire-protocol state
/// machine sits on top of it. The factory never reaches into either; it only calls the methods
/// below, all of which must be safe to call from whichever worker thread currently holds
/// affinity for this connection (see the per-connection serialization guarantee in the crate's
/// concurrency model).
pub trait Cnxn: Send + Sync + std::fmt::Debug {
    /// Services one readiness event. Implementations read/write the underlying socket and
    /// advance their protocol state machine. Errors are expected to be surfaced by leaving the
    /// connection's token invalid (e.g. by deregistering) or by `close`ing the connection; this
    /// trait does not thread an `io::Result` through `do_io` because the protocol behind it may
    /// recover from partial reads without closing.
    fn do_io(&self, ctx: IoContext<'_>);

    /// Closes the connection. Must be idempotent: a second call is a no-op.
    fn close(&self);

    /// Whether [`Cnxn::close`] has already run, whether the factory called it or the connection
    /// closed itself mid-`do_io` (e.g. on a peer FIN). The worker checks this right after
    /// `do_io` returns so a self-closed connection is de-registered instead of being handed back
    /// to its selector thread as if it were still live.
    fn is_closed(&self) -> bool;

    /// The peer's address, captured at accept time.
    fn remote_addr(&self) -> SocketAddr;

    /// `0` until the session handshake (handled upstream) assigns one.
    fn session_id(&self) -> u64;

    /// The session timeout in milliseconds, or `None` before a session is established (in which
    /// case the factory uses `sessionlessCnxnTimeout`).
    fn session_timeout(&self) -> Option<u64>;

    /// The interest-ops mask this connection currently wants registered (e.g. READABLE, or
    /// READABLE | WRITABLE while a response is queued).
    fn interest_ops(&self) -> mio::Interest;

    /// Whether this connection is eligible to be handed a readiness event right now. Cleared
    /// while a worker is mid-`do_io` for it, set again once that call returns.
    fn is_selectable(&self) -> bool;

    /// Marks the connection selectable (called by the selector thread after registering it, and
    /// by the worker after `do_io` completes).
    fn enable_selectable(&self);

    /// Clears the selectable flag (called by the selector thread just before scheduling work for
    /// this connection, so the same ready event can't be dispatched twice).
    fn disable_selectable(&self);

    /// Resets any cumulative per-connection counters (packets sent/received, etc).
    fn reset_stats(&self);

    /// A snapshot of introspection fields. `brief` requests a smaller subset suitable for a
    /// one-line dump.
    fn connection_info(&self, brief: bool) -> BTreeMap<String, ConnectionInfoValue>;

    /// Registers this connection's socket with `registry` under `token`, using
    /// [`Cnxn::interest_ops`] as the initial interest. Implementations own the socket behind a
    /// lock (mirroring a `Mutex<TcpStream>`-wrapped session) so this can take `&self`: only the
    /// owning selector thread ever calls it, per the single-writer selector discipline, so the
    /// lock is never contended.
    fn register(&self, registry: &Registry, token: Token) -> std::io::Result<()>;

    /// Re-registers this connection's socket after it was [`Cnxn::deregister`]ed to mask it from
    /// further readiness events. Uses the current [`Cnxn::interest_ops`].
    fn register_again(&self, registry: &Registry, token: Token) -> std::io::Result<()>;

    /// Deregisters this connection's socket from `registry`, masking it from all future
    /// readiness events until [`Cnxn::register_again`] is called.
    fn deregister(&self, registry: &Registry) -> std::io::Result<()>;
}

/// Unit of work handed to the worker pool. `IOWorkRequest` (in [`crate::work`]) is the only
/// implementation this crate ships; it exists as a trait so the pool's drain/stop logic doesn't
/// need to know about connections, tokens, or selectors directly.
pub trait WorkRequest: Send {
    /// Runs to completion on some worker thread. Panics are caught by the pool, logged, and
    /// treated as if `do_work` had returned normally after calling `cleanup`.
    fn do_work(&self);

    /// Invoked if the pool is stopping and this request is drained without ever running, or
    /// after a panicking `do_work`.
    fn cleanup(&self);
}
