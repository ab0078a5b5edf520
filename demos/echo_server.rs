//! Minimal echo server built on `cnxn-factory`: every byte read from a peer is written straight
//! back. Demonstrates wiring a concrete `Cnxn`/`CnxnFactory` pair into `Factory`.

use std::collections::BTreeMap;
use std::io::{ErrorKind, Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use cnxn_factory::{CnxnFactory, ConnectionInfoValue, Factory, IoContext};
use mio::net::TcpStream;
use mio::{Interest, Registry, Token};

#[derive(Debug)]
struct EchoCnxn {
    stream: Mutex<TcpStream>,
    peer: SocketAddr,
    session_id: AtomicU64,
    selectable: AtomicBool,
    closed: AtomicBool,
}

impl cnxn_factory::Cnxn for EchoCnxn {
    fn do_io(&self, mut ctx: IoContext<'_>) {
        let mut stream = self.stream.lock().expect("echo stream mutex poisoned");
        let buf = ctx.direct_buffer();
        let mut scratch = [0u8; 4096];
        let read_buf: &mut [u8] = buf.unwrap_or(&mut scratch);

        match stream.read(read_buf) {
            Ok(0) => self.close(),
            Ok(n) => {
                if stream.write_all(&read_buf[..n]).is_err() {
                    self.close();
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {}
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
        None
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
        map.insert(
            "closed".to_string(),
            ConnectionInfoValue::Bool(self.closed.load(Ordering::Acquire)),
        );
        map
    }

    fn register(&self, registry: &Registry, token: Token) -> std::io::Result<()> {
        let mut stream = self.stream.lock().expect("echo stream mutex poisoned");
        registry.register(&mut *stream, token, self.interest_ops())
    }

    fn register_again(&self, registry: &Registry, token: Token) -> std::io::Result<()> {
        let mut stream = self.stream.lock().expect("echo stream mutex poisoned");
        registry.register(&mut *stream, token, self.interest_ops())
    }

    fn deregister(&self, registry: &Registry) -> std::io::Result<()> {
        let mut stream = self.stream.lock().expect("echo stream mutex poisoned");
        registry.deregister(&mut *stream)
    }
}

struct EchoFactory;

impl CnxnFactory for EchoFactory {
    fn new_cnxn(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
    ) -> std::io::Result<Arc<dyn cnxn_factory::Cnxn>> {
        Ok(Arc::new(EchoCnxn {
            stream: Mutex::new(stream),
            peer,
            session_id: AtomicU64::new(0),
            selectable: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }))
    }
}

fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt::init();

    let factory = Factory::new(Arc::new(EchoFactory));
    let factory = factory
        .configure(|_| None, "127.0.0.1:7070".parse().unwrap(), false)
        .expect("failed to configure connection factory");

    factory.start()?;
    tracing::info!("echo server listening on 127.0.0.1:7070");

    ctrlc_shutdown(&factory);
    factory.join();
    Ok(())
}

/// Blocks until Ctrl-C, then calls `shutdown()`. A tiny stand-in for a real signal handler since
/// pulling in a signal-handling crate is out of scope for a demo binary.
fn ctrlc_shutdown(factory: &Factory) {
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    std::thread::spawn(move || {
        let mut line = String::new();
        let _ = std::io::stdin().read_line(&mut line);
        r.store(false, Ordering::Release);
    });

    while running.load(Ordering::Acquire) {
        std::thread::sleep(std::time::Duration::from_millis(200));
    }
    factory.stop();
}
