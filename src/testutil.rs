//! Test-only `Cnxn` stand-in used by unit and integration tests across this crate. Not part of
//! the public API.

#![cfg(test)]

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use mio::net::TcpStream;
use mio::{Interest, Registry, Token};

use crate::cnxn::{Cnxn, ConnectionInfoValue, IoContext};

/// A bare-bones echo-style `Cnxn`: reads whatever is available and discards it, never writes.
/// Session id and timeout are settable for tests that exercise session/expiry behavior.
#[derive(Debug)]
pub struct MockCnxn {
    stream: Mutex<TcpStream>,
    peer: SocketAddr,
    session_id: AtomicU64,
    session_timeout_ms: AtomicU64,
    selectable: AtomicBool,
    closed: AtomicBool,
}

impl MockCnxn {
    /// Wraps an already-accepted stream.
    pub fn from_stream(stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            stream: Mutex::new(stream),
            peer,
            session_id: AtomicU64::new(0),
            session_timeout_ms: AtomicU64::new(0),
            selectable: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Assigns a session id and timeout, as the upstream handshake would.
    pub fn set_session(&self, id: u64, timeout_ms: u64) {
        self.session_id.store(id, Ordering::Release);
        self.session_timeout_ms.store(timeout_ms, Ordering::Release);
    }

    /// Closes the stream's read half so the next `do_io` observes an EOF, as a real peer FIN
    /// would. Does not itself mark the mock closed; `do_io`'s own read-loop does that, mirroring
    /// how a real `Cnxn` notices EOF.
    pub fn simulate_peer_fin(&self) {
        let stream = self.stream.lock().expect("mock stream mutex poisoned");
        let _ = stream.shutdown(std::net::Shutdown::Write);
    }
}

impl Cnxn for MockCnxn {
    fn do_io(&self, _ctx: IoContext<'_>) {
        let result = {
            let stream = self.stream.lock().expect("mock stream mutex poisoned");
            let mut scratch = [0u8; 4096];
            use std::io::Read;
            (&*stream).read(&mut scratch)
        };
        match result {
            // Peer FIN: close ourselves, exactly as a real `Cnxn` implementation would.
            Ok(0) => self.close(),
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(_) => self.close(),
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.selectable.store(false, Ordering::Release);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn remote_addr(&self) -> SocketAddr {
        self.peer
    }

    fn session_id(&self) -> u64 {
        self.session_id.load(Ordering::Acquire)
    }

    fn session_timeout(&self) -> Option<u64> {
        match self.session_timeout_ms.load(Ordering::Acquire) {
            0 => None,
            ms => Some(ms),
        }
    }

    fn interest_ops(&self) -> Interest {
        Interest::READABLE
    }

    fn is_selectable(&self) -> bool {
        self.selectable.load(Ordering::Acquire)
    }

    fn enable_selectable(&self) {
        self.selectable.store(true, Ordering::Release);
    }

    fn disable_selectable(&self) {
        self.selectable.store(false, Ordering::Release);
    }

    fn reset_stats(&self) {}

    fn connection_info(&self, _brief: bool) -> BTreeMap<String, ConnectionInfoValue> {
        let mut map = BTreeMap::new();
        map.insert(
            "remoteAddr".to_string(),
            ConnectionInfoValue::Str(self.peer.to_string()),
        );
        map
    }

    fn register(&self, registry: &Registry, token: Token) -> std::io::Result<()> {
        let mut stream = self.stream.lock().expect("mock stream mutex poisoned");
        registry.register(&mut *stream, token, self.interest_ops())
    }

    fn register_again(&self, registry: &Registry, token: Token) -> std::io::Result<()> {
        let mut stream = self.stream.lock().expect("mock stream mutex poisoned");
        registry.register(&mut *stream, token, self.interest_ops())
    }

    fn deregister(&self, registry: &Registry) -> std::io::Result<()> {
        let mut stream = self.stream.lock().expect("mock stream mutex poisoned");
        registry.deregister(&mut *stream)
    }
}
