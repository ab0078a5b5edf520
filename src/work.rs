//! Bounded worker pool and the `IOWorkRequest` adapter that connects a ready selection token to
//! it.
//!
//! Workers are assigned by hashing the connection's identity modulo `W`, giving deterministic
//! per-connection affinity: every ready event for a given connection lands on the same worker,
//! so no two workers ever run `do_io` for it concurrently.

use std::cell::RefCell;
use std::hash::{Hash, Hasher};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use mio::Token;

use crate::cnxn::{Cnxn, IoContext, WorkRequest};
use crate::registry::ConnectionRegistry;
use crate::selector::SelectorHandle;

thread_local! {
    static DIRECT_BUFFER: RefCell<Option<Vec<u8>>> = RefCell::new(None);
}

/// Adapts a ready `(Token, Cnxn)` pair into a [`WorkRequest`] the pool can run.
///
/// Mirrors `do_work`'s five-step contract from the component design: run `do_io`, then either
/// bail out (key invalid, factory stopping) or touch expiry, mark the connection selectable
/// again, and hand it back to its owning selector thread's `update_ops_queue`.
pub struct IOWorkRequest {
    token: Token,
    cnxn: Arc<dyn Cnxn>,
    selector: SelectorHandle,
    registry: Arc<ConnectionRegistry>,
    stopping: Arc<AtomicBool>,
    direct_buffer_bytes: usize,
}

impl IOWorkRequest {
    /// Builds a work request for one readiness event on `cnxn`/`token`, to be run by whichever
    /// worker this connection hashes to.
    pub fn new(
        token: Token,
        cnxn: Arc<dyn Cnxn>,
        selector: SelectorHandle,
        registry: Arc<ConnectionRegistry>,
        stopping: Arc<AtomicBool>,
        direct_buffer_bytes: usize,
    ) -> Self {
        Self {
            token,
            cnxn,
            selector,
            registry,
            stopping,
            direct_buffer_bytes,
        }
    }
}

impl WorkRequest for IOWorkRequest {
    fn do_work(&self) {
        with_direct_buffer(self.direct_buffer_bytes, |buf| {
            let stopping = self.stopping.load(Ordering::Acquire);
            let ctx = IoContext::new(self.token, buf, stopping);
            self.cnxn.do_io(ctx);
        });

        if self.stopping.load(Ordering::Acquire) {
            self.registry.remove(&self.cnxn);
            self.cnxn.close();
            return;
        }

        // `do_io` may have closed the connection itself (e.g. on a peer FIN). The Rust analog of
        // §4.4 step 4 ("if key invalid after do_io"): de-register rather than re-enabling and
        // re-registering an already-dead socket, which would otherwise busy-loop on the
        // still-readable EOF and never get reaped (`touch` below would keep renewing its expiry).
        if self.cnxn.is_closed() {
            self.registry.remove(&self.cnxn);
            return;
        }

        self.registry.touch(&self.cnxn);
        self.cnxn.enable_selectable();

        if self.selector.offer_update(self.token).is_err() {
            // Selector thread is gone; the factory is shutting down underneath us.
            self.registry.remove(&self.cnxn);
            self.cnxn.close();
        }
    }

    fn cleanup(&self) {
        self.registry.remove(&self.cnxn);
        self.cnxn.close();
    }
}

fn with_direct_buffer<R>(capacity: usize, f: impl FnOnce(Option<&mut [u8]>) -> R) -> R {
    if capacity == 0 {
        return f(None);
    }
    DIRECT_BUFFER.with(|cell| {
        let mut buf = cell.borrow_mut();
        let buf = buf.get_or_insert_with(|| vec![0u8; capacity]);
        f(Some(buf.as_mut_slice()))
    })
}

/// A fixed-size set of worker threads consuming [`WorkRequest`]s, or a synchronous stand-in that
/// runs requests inline on the calling thread when `num_workers == 0`.
pub struct WorkerPool {
    senders: Vec<Sender<Box<dyn WorkRequest>>>,
    handles: Vec<JoinHandle<()>>,
    stopping: Arc<AtomicBool>,
    inline: bool,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.handles.len())
            .field("inline", &self.inline)
            .finish()
    }
}

impl WorkerPool {
    /// Spawns `num_workers` worker threads. If `num_workers == 0`, `schedule` runs requests
    /// inline and no threads are spawned.
    pub fn new(num_workers: usize) -> Self {
        let stopping = Arc::new(AtomicBool::new(false));

        if num_workers == 0 {
            return Self {
                senders: Vec::new(),
                handles: Vec::new(),
                stopping,
                inline: true,
            };
        }

        let mut senders = Vec::with_capacity(num_workers);
        let mut handles = Vec::with_capacity(num_workers);

        for id in 0..num_workers {
            // Unbounded: a masked connection has at most one in-flight request, so queue depth
            // is bounded by this worker's share of the connection count, not a fixed constant.
            // A bounded channel would make `schedule` (called from a selector thread) block once
            // full, stalling every other connection on that selector.
            let (tx, rx): (Sender<Box<dyn WorkRequest>>, Receiver<Box<dyn WorkRequest>>) =
                unbounded();
            let worker_stopping = stopping.clone();
            let handle = std::thread::Builder::new()
                .name(format!("cnxn-worker-{id}"))
                .spawn(move || worker_loop(rx, worker_stopping))
                .expect("failed to spawn worker thread");
            senders.push(tx);
            handles.push(handle);
        }

        Self {
            senders,
            handles,
            stopping,
            inline: false,
        }
    }

    /// Number of worker threads (`0` in inline mode).
    pub fn len(&self) -> usize {
        self.senders.len()
    }

    /// Whether the pool is empty (inline mode).
    pub fn is_empty(&self) -> bool {
        self.senders.is_empty()
    }

    /// Schedules `req`, hashing `affinity_key` modulo the worker count to pick which worker runs
    /// it. In inline mode, runs it immediately on the calling thread.
    pub fn schedule(&self, affinity_key: u64, req: Box<dyn WorkRequest>) {
        if self.inline {
            run_one(req.as_ref());
            return;
        }

        let idx = (affinity_key as usize) % self.senders.len();
        if self.senders[idx].send(req).is_err() {
            // Worker thread gone (pool stopping); caller is responsible for the connection.
        }
    }

    /// Signals every worker to stop accepting new work, then waits up to `grace` for in-flight
    /// work to drain before abandoning stragglers. Any request still queued once `stopping` is
    /// observed is drained with [`WorkRequest::cleanup`] rather than [`WorkRequest::do_work`],
    /// matching the spec's "drained without execution" contract; a request already mid-`do_work`
    /// when `stop` is called is allowed to finish normally.
    pub fn stop(mut self, grace: Duration) {
        self.stopping.store(true, Ordering::Release);
        let senders = std::mem::take(&mut self.senders);
        drop(senders); // closes each channel; workers exit once their queue is drained

        let deadline = Instant::now() + grace;
        for handle in self.handles.drain(..) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                // best-effort: detach rather than block shutdown indefinitely
                drop(handle);
                continue;
            }
            let _ = handle.join();
        }
    }
}

fn worker_loop(rx: Receiver<Box<dyn WorkRequest>>, stopping: Arc<AtomicBool>) {
    loop {
        match rx.recv_timeout(Duration::from_millis(250)) {
            Ok(req) => {
                if stopping.load(Ordering::Acquire) {
                    req.cleanup();
                } else {
                    run_one(req.as_ref());
                }
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

fn run_one(req: &dyn WorkRequest) {
    let result = catch_unwind(AssertUnwindSafe(|| req.do_work()));
    if let Err(panic) = result {
        tracing::error!(?panic, "worker request panicked; cleaning up");
        req.cleanup();
    }
}

/// Hashes a connection's identity (its pointer address, via `Arc::as_ptr`) into a `u64` suitable
/// for [`WorkerPool::schedule`]'s affinity argument.
pub fn affinity_key_for(cnxn: &Arc<dyn Cnxn>) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    (Arc::as_ptr(cnxn) as *const () as usize).hash(&mut hasher);
    hasher.finish()
}
