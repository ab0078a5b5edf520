//! A selector thread: owns one `mio::Poll`, the connections registered on it, and the two
//! intake queues (`accepted_queue`, `update_ops_queue`) other threads use to request work from
//! it without ever touching its `Poll` themselves.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{unbounded, Receiver, SendError, Sender};
use mio::net::TcpStream;
use mio::{Events, Poll, Token, Waker};
use rand::seq::SliceRandom;
use slab::Slab;
use tracing::{debug, warn};

use crate::cnxn::Cnxn;
use crate::registry::ConnectionRegistry;
use crate::work::{affinity_key_for, IOWorkRequest, WorkerPool};

const WAKE_TOKEN: Token = Token(usize::MAX);

/// Builds the opaque `Cnxn` that a freshly accepted socket is wrapped in. This is the seam
/// through which the wire-protocol implementation (out of scope for this crate) plugs in.
pub trait CnxnFactory: Send + Sync {
    /// Wraps `stream`, accepted from `peer`, into a connection capability. The returned
    /// connection has not yet been registered with any selector; [`SelectorThread`] does that
    /// immediately after this returns, via [`Cnxn::register`].
    fn new_cnxn(&self, stream: TcpStream, peer: SocketAddr) -> std::io::Result<Arc<dyn Cnxn>>;
}

/// A cheaply-cloneable set of channels used to hand work to a specific selector thread from any
/// other thread (the accept thread, or a worker finishing `do_io`).
#[derive(Clone)]
pub struct SelectorHandle {
    accepted_tx: Sender<TcpStream>,
    update_tx: Sender<Token>,
    waker: Arc<Waker>,
}

impl std::fmt::Debug for SelectorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelectorHandle").finish_non_exhaustive()
    }
}

impl SelectorHandle {
    /// Offers a newly accepted socket to this selector's `accepted_queue`, then wakes it.
    /// Ordering: the send happens-before the wake, so the selector is guaranteed to observe the
    /// item on its next drain.
    pub fn offer_accepted(&self, stream: TcpStream) -> Result<(), SendError<TcpStream>> {
        self.accepted_tx.send(stream)?;
        let _ = self.waker.wake();
        Ok(())
    }

    /// Offers a token whose interest ops should be restored to this selector's
    /// `update_ops_queue`, then wakes it.
    pub fn offer_update(&self, token: Token) -> Result<(), SendError<Token>> {
        self.update_tx.send(token)?;
        let _ = self.waker.wake();
        Ok(())
    }
}

/// One selector thread's share of the factory: its `Poll`, its slab of registered connections,
/// and its two intake queues.
pub struct SelectorThread {
    poll: Poll,
    connections: Slab<Arc<dyn Cnxn>>,
    accepted_rx: Receiver<TcpStream>,
    update_rx: Receiver<Token>,
    self_handle: SelectorHandle,
    registry: Arc<ConnectionRegistry>,
    worker_pool: Arc<WorkerPool>,
    cnxn_factory: Arc<dyn CnxnFactory>,
    stopping: Arc<AtomicBool>,
    direct_buffer_bytes: usize,
    events_capacity: usize,
}

impl std::fmt::Debug for SelectorThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelectorThread")
            .field("connections", &self.connections.len())
            .field("direct_buffer_bytes", &self.direct_buffer_bytes)
            .finish_non_exhaustive()
    }
}

impl SelectorThread {
    /// Builds a selector thread and the handle other threads use to talk to it. Does not start
    /// the thread; pass the result to [`spawn_selector`].
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        worker_pool: Arc<WorkerPool>,
        cnxn_factory: Arc<dyn CnxnFactory>,
        stopping: Arc<AtomicBool>,
        direct_buffer_bytes: usize,
    ) -> std::io::Result<(Self, SelectorHandle)> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);
        let (accepted_tx, accepted_rx) = unbounded();
        let (update_tx, update_rx) = unbounded();

        let self_handle = SelectorHandle {
            accepted_tx,
            update_tx,
            waker,
        };

        let thread = Self {
            poll,
            connections: Slab::new(),
            accepted_rx,
            update_rx,
            self_handle: self_handle.clone(),
            registry,
            worker_pool,
            cnxn_factory,
            stopping,
            direct_buffer_bytes,
            events_capacity: 1024,
        };

        Ok((thread, self_handle))
    }

    /// Runs this selector's main loop on the calling thread until `stopping` is observed.
    pub fn run(mut self) {
        let mut events = Events::with_capacity(self.events_capacity);
        let mut rng = rand::thread_rng();

        loop {
            if self.stopping.load(Ordering::Acquire) {
                self.shutdown();
                return;
            }

            match self.poll.poll(&mut events, None) {
                Ok(()) => {}
                Err(e) => {
                    warn!(error = %e, "selector poll failed; continuing");
                    continue;
                }
            }

            let mut ready: Vec<Token> = events
                .iter()
                .map(|e| e.token())
                .filter(|&t| t != WAKE_TOKEN)
                .collect();
            ready.shuffle(&mut rng);

            for token in ready {
                self.dispatch_ready(token);
            }

            self.drain_accepted();
            self.drain_updates();
        }
    }

    fn dispatch_ready(&mut self, token: Token) {
        let key = token.0;
        let Some(cnxn) = self.connections.get(key) else {
            return;
        };

        let interest = cnxn.interest_ops();
        if !(interest.is_readable() || interest.is_writable()) {
            return;
        }

        // Level-triggered masking: deregister so this token won't fire again until the worker
        // finishes `do_io` and the selector restores it from `update_ops_queue`.
        if let Err(e) = cnxn.deregister(self.poll.registry()) {
            debug!(error = %e, ?token, "failed to deregister ready connection; closing");
            self.close_and_remove(token);
            return;
        }

        cnxn.disable_selectable();
        self.registry.touch(cnxn);

        let req = IOWorkRequest::new(
            token,
            cnxn.clone(),
            self.self_handle.clone(),
            self.registry.clone(),
            self.stopping.clone(),
            self.direct_buffer_bytes,
        );
        let affinity = affinity_key_for(cnxn);
        self.worker_pool.schedule(affinity, Box::new(req));
    }

    fn drain_accepted(&mut self) {
        while let Ok(stream) = self.accepted_rx.try_recv() {
            let peer = match stream.peer_addr() {
                Ok(addr) => addr,
                Err(e) => {
                    debug!(error = %e, "dropping accepted socket with no peer address");
                    continue;
                }
            };

            let cnxn = match self.cnxn_factory.new_cnxn(stream, peer) {
                Ok(cnxn) => cnxn,
                Err(e) => {
                    warn!(error = %e, %peer, "connection factory rejected accepted socket");
                    // The accept thread reserved this peer's cap slot before handing the socket
                    // off; since it never reaches `registry.insert`, release it here instead.
                    self.registry.release_reservation(peer.ip());
                    continue;
                }
            };

            let entry = self.connections.vacant_entry();
            let token = Token(entry.key());

            if let Err(e) = cnxn.register(self.poll.registry(), token) {
                warn!(error = %e, %peer, "failed to register accepted connection");
                self.registry.release_reservation(peer.ip());
                continue;
            }

            cnxn.enable_selectable();
            self.registry.insert(cnxn.clone());
            entry.insert(cnxn);
        }
    }

    fn drain_updates(&mut self) {
        while let Ok(token) = self.update_rx.try_recv() {
            let key = token.0;
            let Some(cnxn) = self.connections.get(key) else {
                continue;
            };

            if !cnxn.is_selectable() {
                // Closed or reassigned since this update was queued; nothing to restore.
                continue;
            }

            if let Err(e) = cnxn.register_again(self.poll.registry(), token) {
                debug!(error = %e, ?token, "failed to restore interest ops; closing");
                self.close_and_remove(token);
            }
        }
    }

    fn close_and_remove(&mut self, token: Token) {
        if let Some(cnxn) = self.connections.try_remove(token.0) {
            self.registry.remove(&cnxn);
            cnxn.close();
        }
    }

    fn shutdown(&mut self) {
        for (_, cnxn) in self.connections.iter() {
            if cnxn.is_selectable() {
                self.registry.remove(cnxn);
                cnxn.close();
            }
        }
        while let Ok(stream) = self.accepted_rx.try_recv() {
            fast_close(stream);
        }
        self.connections.clear();
    }
}

fn fast_close(stream: TcpStream) {
    let std_stream: std::net::TcpStream = stream.into();
    let _ = std_stream.set_linger(Some(std::time::Duration::ZERO));
    drop(std_stream);
}

/// Spawns `thread` as a named OS thread, returning its join handle.
pub fn spawn_selector(name: String, thread: SelectorThread) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name(name)
        .spawn(move || thread.run())
        .expect("failed to spawn selector thread")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ConnectionRegistry;
    use crate::testutil::MockCnxn;
    use std::time::Duration;

    struct EchoFactory;
    impl CnxnFactory for EchoFactory {
        fn new_cnxn(&self, stream: TcpStream, peer: SocketAddr) -> std::io::Result<Arc<dyn Cnxn>> {
            Ok(Arc::new(MockCnxn::from_stream(stream, peer)))
        }
    }

    #[test]
    fn accepted_socket_is_registered_and_indexed() {
        let listener = mio::net::TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();

        let registry = Arc::new(ConnectionRegistry::new(0, 10_000));
        let pool = Arc::new(WorkerPool::new(0));
        let stopping = Arc::new(AtomicBool::new(false));
        let (thread, handle) = SelectorThread::new(
            registry.clone(),
            pool,
            Arc::new(EchoFactory),
            stopping.clone(),
            0,
        )
        .unwrap();

        let join = spawn_selector("test-selector".into(), thread);

        let _client = std::net::TcpStream::connect(addr).unwrap();
        let (accepted, _) = listener.accept().unwrap();
        handle.offer_accepted(accepted).unwrap();

        // give the selector thread a moment to drain its accepted queue
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(registry.connections().len(), 1);

        stopping.store(true, Ordering::Release);
        handle.offer_update(Token(0)).ok();
        join.join().unwrap();
    }
}
