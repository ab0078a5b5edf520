//! Connection expirer thread: reaps sessionless (or session-expired) connections whose deadline
//! has passed, waking early on a stop signal instead of spinning.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use tracing::debug;

use crate::cnxn::Cnxn;
use crate::registry::ConnectionRegistry;

/// A condvar-backed stop signal the expirer wakes on immediately, rather than waiting out a full
/// `wait_time()` park. Shared with whatever calls [`ExpirerThread::stop`].
#[derive(Debug, Default)]
pub struct StopSignal {
    stopped: Mutex<bool>,
    condvar: Condvar,
}

impl StopSignal {
    /// Builds an unset signal.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Sets the signal and wakes any thread parked in [`Self::wait_timeout`].
    pub fn notify(&self) {
        *self.stopped.lock().expect("stop signal mutex poisoned") = true;
        self.condvar.notify_all();
    }

    fn is_set(&self) -> bool {
        *self.stopped.lock().expect("stop signal mutex poisoned")
    }

    /// Waits up to `timeout` for the signal to be set, returning early if it already is.
    fn wait_timeout(&self, timeout: std::time::Duration) {
        let guard = self.stopped.lock().expect("stop signal mutex poisoned");
        let _ = self
            .condvar
            .wait_timeout_while(guard, timeout, |stopped| !*stopped);
    }
}

/// Periodically drains the registry's expiry wheel, closing every connection whose deadline has
/// passed.
pub struct ExpirerThread {
    registry: Arc<ConnectionRegistry>,
    stop_signal: Arc<StopSignal>,
}

impl std::fmt::Debug for ExpirerThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExpirerThread").finish_non_exhaustive()
    }
}

impl ExpirerThread {
    /// Builds an expirer over `registry`, stoppable via `stop_signal`.
    pub fn new(registry: Arc<ConnectionRegistry>, stop_signal: Arc<StopSignal>) -> Self {
        Self {
            registry,
            stop_signal,
        }
    }

    /// Runs the expirer loop on the calling thread until `stop_signal` is set.
    pub fn run(self) {
        loop {
            if self.stop_signal.is_set() {
                return;
            }

            let wait = self.registry.wait_time();
            if !wait.is_zero() {
                self.stop_signal.wait_timeout(wait);
                continue;
            }

            for cnxn in self.registry.poll_expired() {
                debug!(addr = %cnxn.remote_addr(), "reaping expired connection");
                self.registry.remove(&cnxn);
                cnxn.close();
            }
        }
    }
}

/// Spawns `thread` as a named OS thread, returning its join handle.
pub fn spawn_expirer(thread: ExpirerThread) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("cnxn-expirer".to_string())
        .spawn(move || thread.run())
        .expect("failed to spawn expirer thread")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MockCnxn;
    use std::net::SocketAddr;
    use std::time::Duration;

    fn loopback_pair() -> (mio::net::TcpStream, SocketAddr) {
        let listener = mio::net::TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        let _client = std::net::TcpStream::connect(addr).unwrap();
        let (stream, peer) = listener.accept().unwrap();
        (stream, peer)
    }

    #[test]
    fn expired_connection_is_closed_and_removed() {
        let registry = Arc::new(ConnectionRegistry::new(0, 20));
        let (stream, peer) = loopback_pair();
        let mock = Arc::new(MockCnxn::from_stream(stream, peer));
        let cnxn: Arc<dyn crate::cnxn::Cnxn> = mock.clone();
        registry.insert(cnxn);

        let stop_signal = StopSignal::new();
        let expirer = ExpirerThread::new(registry.clone(), stop_signal.clone());
        let join = spawn_expirer(expirer);

        std::thread::sleep(Duration::from_millis(200));
        stop_signal.notify();
        join.join().unwrap();

        assert_eq!(registry.connections().len(), 0);
        assert!(mock.is_closed());
    }

    #[test]
    fn touching_a_connection_keeps_it_alive_past_its_original_deadline() {
        let registry = Arc::new(ConnectionRegistry::new(0, 80));
        let (stream, peer) = loopback_pair();
        let mock = Arc::new(MockCnxn::from_stream(stream, peer));
        let cnxn: Arc<dyn crate::cnxn::Cnxn> = mock.clone();
        registry.insert(cnxn.clone());

        let stop_signal = StopSignal::new();
        let expirer = ExpirerThread::new(registry.clone(), stop_signal.clone());
        let join = spawn_expirer(expirer);

        // Renew well within each 80ms window, well past what a single sessionless timeout would
        // allow, simulating the periodic byte traffic that keeps a real connection alive.
        for _ in 0..5 {
            std::thread::sleep(Duration::from_millis(40));
            registry.touch(&cnxn);
        }
        assert_eq!(registry.connections().len(), 1);
        assert!(!mock.is_closed());

        // stop touching; the next deadline should now be reaped
        std::thread::sleep(Duration::from_millis(200));
        stop_signal.notify();
        join.join().unwrap();

        assert_eq!(registry.connections().len(), 0);
        assert!(mock.is_closed());
    }
}
