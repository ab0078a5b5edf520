//! The factory/facade: wires the accept thread, selector threads, worker pool, and expirer
//! thread into one lifecycle, and is the only type most callers construct directly.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::info;

use crate::accept::{spawn_accept, AcceptThread};
use crate::cnxn::{Cnxn, ConnectionInfoValue};
use crate::config::Tunables;
use crate::error::{ConfigError, ConfigResult};
use crate::expirer::{spawn_expirer, ExpirerThread, StopSignal};
use crate::registry::ConnectionRegistry;
use crate::selector::{spawn_selector, CnxnFactory, SelectorHandle, SelectorThread};
use crate::work::WorkerPool;

/// Lifecycle state of a [`Factory`]. Transitions only happen under `state`'s mutex; none of them
/// are on a hot path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FactoryState {
    /// `configure` has not yet been called.
    Unconfigured,
    /// `configure` succeeded; threads are built but not started.
    Configured,
    /// `start` succeeded; all threads are running.
    Running,
    /// `stop` has been called; threads are winding down.
    Stopping,
    /// `join` has returned; all threads have exited.
    Stopped,
}

struct Threads {
    accept: std::thread::JoinHandle<()>,
    accept_waker: Arc<mio::Waker>,
    accept_local_addr: SocketAddr,
    selectors: Vec<std::thread::JoinHandle<()>>,
    expirer: std::thread::JoinHandle<()>,
    expirer_stop: Arc<StopSignal>,
}

/// The client-facing connection factory. Owns the shared tunables, the connection registry, the
/// worker pool, and the accept/selector/expirer threads once [`Factory::configure`] has run.
pub struct Factory {
    tunables: Tunables,
    cnxn_factory: Arc<dyn CnxnFactory>,
    registry: Arc<ConnectionRegistry>,
    worker_pool: Mutex<Option<Arc<WorkerPool>>>,
    selector_handles: Mutex<Vec<SelectorHandle>>,
    selector_threads: Mutex<Vec<SelectorThread>>,
    addr: Mutex<Option<SocketAddr>>,
    stopping: Arc<AtomicBool>,
    reconfiguring: Arc<AtomicBool>,
    state: Mutex<FactoryState>,
    threads: Mutex<Option<Threads>>,
}

impl std::fmt::Debug for Factory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Factory")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Factory {
    /// Builds an unconfigured factory around `cnxn_factory`, the wire-protocol seam.
    pub fn new(cnxn_factory: Arc<dyn CnxnFactory>) -> Self {
        Self {
            tunables: Tunables::default(),
            cnxn_factory,
            // Replaced in `configure()`; the placeholder timeout only needs to satisfy
            // `ExpiryWheel`'s nonzero-tick invariant before then.
            registry: Arc::new(ConnectionRegistry::new(
                0,
                crate::config::DEFAULT_SESSIONLESS_CNXN_TIMEOUT_MS,
            )),
            worker_pool: Mutex::new(None),
            selector_handles: Mutex::new(Vec::new()),
            selector_threads: Mutex::new(Vec::new()),
            addr: Mutex::new(None),
            stopping: Arc::new(AtomicBool::new(false)),
            reconfiguring: Arc::new(AtomicBool::new(false)),
            state: Mutex::new(FactoryState::Unconfigured),
            threads: Mutex::new(None),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> FactoryState {
        *self.state.lock().expect("factory state mutex poisoned")
    }

    /// Resolves tunables via `lookup`, binds nothing yet, and builds the selector threads (not
    /// started) plus the registry sized for the resolved `maxClientCnxns`/`sessionlessCnxnTimeout`.
    /// `secure = true` is rejected with [`ConfigError::TlsUnsupported`].
    pub fn configure(
        self,
        lookup: impl Fn(&str) -> Option<String>,
        addr: SocketAddr,
        secure: bool,
    ) -> ConfigResult<Self> {
        if secure {
            return Err(ConfigError::TlsUnsupported);
        }

        let tunables = Tunables::from_lookup(lookup)?;
        let registry = Arc::new(ConnectionRegistry::new(
            tunables.max_client_cnxns,
            tunables.sessionless_cnxn_timeout_ms,
        ));

        let mut selector_threads = Vec::with_capacity(tunables.num_selector_threads);
        let mut selector_handles = Vec::with_capacity(tunables.num_selector_threads);
        let worker_pool = Arc::new(WorkerPool::new(tunables.num_worker_threads));

        for _ in 0..tunables.num_selector_threads {
            let (thread, handle) = SelectorThread::new(
                registry.clone(),
                worker_pool.clone(),
                self.cnxn_factory.clone(),
                self.stopping.clone(),
                tunables.direct_buffer_bytes,
            )
            .map_err(|source| ConfigError::Bind { addr, source })?;
            selector_threads.push(thread);
            selector_handles.push(handle);
        }

        let mut factory = Self {
            tunables,
            registry,
            ..self
        };
        *factory.worker_pool.lock().expect("worker pool mutex poisoned") = Some(worker_pool);
        *factory.selector_handles.lock().expect("selector handles mutex poisoned") =
            selector_handles;
        *factory.selector_threads.lock().expect("selector threads mutex poisoned") =
            selector_threads;
        *factory.addr.lock().expect("addr mutex poisoned") = Some(addr);
        *factory.state.lock().expect("factory state mutex poisoned") = FactoryState::Configured;

        Ok(factory)
    }

    /// Starts the accept thread, every selector thread, and the expirer thread. Only valid from
    /// [`FactoryState::Configured`].
    pub fn start(&self) -> std::io::Result<()> {
        let addr = self
            .addr
            .lock()
            .expect("addr mutex poisoned")
            .expect("start() called before configure()");

        let selector_threads = std::mem::take(
            &mut *self
                .selector_threads
                .lock()
                .expect("selector threads mutex poisoned"),
        );
        let selector_handles = self
            .selector_handles
            .lock()
            .expect("selector handles mutex poisoned")
            .clone();

        let accept = AcceptThread::bind(
            addr,
            selector_handles,
            self.registry.clone(),
            self.stopping.clone(),
            self.reconfiguring.clone(),
        )?;
        let accept_waker = accept.waker();
        let accept_local_addr = accept.local_addr()?;
        let accept_handle = spawn_accept(accept);

        let mut selector_handles_running = Vec::with_capacity(selector_threads.len());
        for (i, thread) in selector_threads.into_iter().enumerate() {
            selector_handles_running.push(spawn_selector(format!("cnxn-selector-{i}"), thread));
        }

        let expirer_stop = StopSignal::new();
        let expirer = ExpirerThread::new(self.registry.clone(), expirer_stop.clone());
        let expirer_handle = spawn_expirer(expirer);

        *self.threads.lock().expect("threads mutex poisoned") = Some(Threads {
            accept: accept_handle,
            accept_waker,
            accept_local_addr,
            selectors: selector_handles_running,
            expirer: expirer_handle,
            expirer_stop,
        });
        *self.state.lock().expect("factory state mutex poisoned") = FactoryState::Running;

        info!(%addr, "connection factory started");
        Ok(())
    }

    /// Signals every thread to stop: closes the listen socket's accept loop, wakes selector
    /// threads, notifies the expirer, and begins draining the worker pool. Does not block for
    /// threads to exit; call [`Factory::join`] for that.
    pub fn stop(&self) {
        *self.state.lock().expect("factory state mutex poisoned") = FactoryState::Stopping;
        self.stopping.store(true, Ordering::Release);

        for handle in self
            .selector_handles
            .lock()
            .expect("selector handles mutex poisoned")
            .iter()
        {
            // A stray token is enough to force a wakeup; the selector checks `stopping` itself
            // once it returns from `poll`.
            let _ = handle.offer_update(mio::Token(usize::MAX - 2));
        }

        if let Some(threads) = self.threads.lock().expect("threads mutex poisoned").as_ref() {
            threads.expirer_stop.notify();
            let _ = threads.accept_waker.wake();
        }
    }

    /// Joins the accept thread, every selector thread, and the worker pool (with
    /// `shutdownTimeout`).
    pub fn join(&self) {
        let threads = self.threads.lock().expect("threads mutex poisoned").take();
        if let Some(threads) = threads {
            let _ = threads.accept.join();
            for handle in threads.selectors {
                let _ = handle.join();
            }
            let _ = threads.expirer.join();
        }

        if let Some(pool) = self
            .worker_pool
            .lock()
            .expect("worker pool mutex poisoned")
            .take()
        {
            if let Ok(pool) = Arc::try_unwrap(pool) {
                pool.stop(Duration::from_millis(self.tunables.shutdown_timeout_ms));
            }
        }

        *self.state.lock().expect("factory state mutex poisoned") = FactoryState::Stopped;
    }

    /// Re-binds the listening socket to `new_addr` without disturbing existing connections or
    /// the selector/expirer threads. Only valid from [`FactoryState::Running`].
    ///
    /// Opens a new listen socket first, then marks the current accept thread "reconfiguring"
    /// (so its exit does not cascade into a factory-wide `stop()`), wakes and joins it, and
    /// starts a fresh accept thread bound to `new_addr` reusing the existing selector handles.
    pub fn reconfigure(&self, new_addr: SocketAddr) -> std::io::Result<()> {
        let mut threads_guard = self.threads.lock().expect("threads mutex poisoned");
        let threads = threads_guard
            .as_mut()
            .expect("reconfigure() called before start()");

        // The old thread must fully exit and the flag must be reset to `false` before the new
        // thread (which shares this same `reconfiguring` Arc) is spawned, or it would observe
        // `true` on its very first loop iteration and exit immediately. `threads.accept` has no
        // vacant state to move out of, so park a trivial joined-immediately thread in its place
        // until the real replacement is built below.
        self.reconfiguring.store(true, Ordering::Release);
        let _ = threads.accept_waker.wake();
        let old_accept = std::mem::replace(&mut threads.accept, std::thread::spawn(|| {}));
        let _ = old_accept.join();
        self.reconfiguring.store(false, Ordering::Release);

        let selector_handles = self
            .selector_handles
            .lock()
            .expect("selector handles mutex poisoned")
            .clone();
        let new_accept = AcceptThread::bind(
            new_addr,
            selector_handles,
            self.registry.clone(),
            self.stopping.clone(),
            self.reconfiguring.clone(),
        )?;
        threads.accept_waker = new_accept.waker();
        threads.accept_local_addr = new_accept.local_addr()?;
        threads.accept = spawn_accept(new_accept);

        *self.addr.lock().expect("addr mutex poisoned") = Some(new_addr);
        info!(%new_addr, "connection factory reconfigured");
        Ok(())
    }

    /// The socket address currently accepting connections, once [`Factory::start`] has run.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.threads
            .lock()
            .expect("threads mutex poisoned")
            .as_ref()
            .map(|t| t.accept_local_addr)
    }

    /// `stop()` followed by `join()` followed by closing every still-live connection.
    pub fn shutdown(&self) {
        self.stop();
        self.join();
        for cnxn in self.registry.connections() {
            self.registry.remove(&cnxn);
            cnxn.close();
        }
    }

    /// Removes `session_id` (and every other index entry) for its bound connection, then closes
    /// it, if one was bound.
    pub fn close_session(&self, session_id: u64) {
        if let Some(cnxn) = self.registry.find_session(session_id) {
            self.registry.remove(&cnxn);
            cnxn.close();
        }
    }

    /// Publishes a session id → connection binding. Last writer wins.
    pub fn add_session(&self, session_id: u64, cnxn: Arc<dyn Cnxn>) {
        self.registry.add_session(session_id, cnxn);
    }

    /// De-registers `cnxn` from every index. Does not close it; callers that want both should
    /// call `cnxn.close()` themselves (mirroring [`Cnxn::close`]'s own cleanup responsibility).
    pub fn remove_cnxn(&self, cnxn: &Arc<dyn Cnxn>) {
        self.registry.remove(cnxn);
    }

    /// Renews `cnxn`'s expiry deadline.
    pub fn touch_cnxn(&self, cnxn: &Arc<dyn Cnxn>) {
        self.registry.touch(cnxn);
    }

    /// Resets per-connection stats across every live connection.
    pub fn reset_all_connection_stats(&self) {
        self.registry.reset_all_connection_stats();
    }

    /// Snapshot of every live connection.
    pub fn get_connections(&self) -> Vec<Arc<dyn Cnxn>> {
        self.registry.connections()
    }

    /// `connection_info(brief)` for every live connection, keyed by remote address.
    pub fn get_all_connection_info(
        &self,
        brief: bool,
    ) -> BTreeMap<String, BTreeMap<String, ConnectionInfoValue>> {
        self.registry.dump_connections(brief)
    }

    /// The resolved tunables this factory was configured with.
    pub fn tunables(&self) -> Tunables {
        self.tunables
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MockCnxn;
    use mio::net::TcpStream as MioTcpStream;
    use std::net::SocketAddr;
    use std::time::Duration;

    struct EchoFactory;
    impl CnxnFactory for EchoFactory {
        fn new_cnxn(
            &self,
            stream: MioTcpStream,
            peer: SocketAddr,
        ) -> std::io::Result<Arc<dyn Cnxn>> {
            Ok(Arc::new(MockCnxn::from_stream(stream, peer)))
        }
    }

    fn test_lookup(key: &str) -> Option<String> {
        match key {
            "numSelectorThreads" => Some("1".to_string()),
            "numWorkerThreads" => Some("0".to_string()),
            "sessionlessCnxnTimeout" => Some("200".to_string()),
            _ => None,
        }
    }

    #[test]
    fn configure_then_start_then_shutdown_round_trips_cleanly() {
        let factory = Factory::new(Arc::new(EchoFactory));
        let factory = factory
            .configure(test_lookup, "127.0.0.1:0".parse().unwrap(), false)
            .unwrap();
        assert_eq!(factory.state(), FactoryState::Configured);

        factory.start().unwrap();
        assert_eq!(factory.state(), FactoryState::Running);

        std::thread::sleep(Duration::from_millis(50));
        factory.shutdown();
        assert_eq!(factory.state(), FactoryState::Stopped);
    }

    #[test]
    fn reconfigure_moves_the_listener_without_dropping_existing_connections() {
        let factory = Factory::new(Arc::new(EchoFactory));
        let factory = factory
            .configure(test_lookup, "127.0.0.1:0".parse().unwrap(), false)
            .unwrap();
        factory.start().unwrap();

        let old_addr = factory.local_addr().unwrap();
        let _existing = std::net::TcpStream::connect(old_addr).unwrap();
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(factory.registry.connections().len(), 1);

        factory
            .reconfigure("127.0.0.1:0".parse().unwrap())
            .unwrap();
        let new_addr = factory.local_addr().unwrap();
        assert_ne!(old_addr, new_addr);

        // the pre-existing connection is untouched by the swap
        assert_eq!(factory.registry.connections().len(), 1);

        // the old address no longer accepts; the new one does
        assert!(std::net::TcpStream::connect(old_addr).is_err());
        let _fresh = std::net::TcpStream::connect(new_addr).unwrap();
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(factory.registry.connections().len(), 2);

        factory.shutdown();
    }

    #[test]
    fn secure_listener_is_rejected_at_configure_time() {
        let factory = Factory::new(Arc::new(EchoFactory));
        let err = factory
            .configure(test_lookup, "127.0.0.1:0".parse().unwrap(), true)
            .unwrap_err();
        assert!(matches!(err, ConfigError::TlsUnsupported));
    }
}
