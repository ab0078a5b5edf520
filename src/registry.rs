//! The factory's four indexes over live connections: by identity, by peer address, and by
//! session id, plus the expiry wheel. Backed by `dashmap` so introspection (`get_connections`,
//! `dump_connections`, ...) never blocks the accept/selector/worker hot paths.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::{DashMap, DashSet};

use crate::cnxn::{Cnxn, ConnectionInfoValue};
use crate::expiry::ExpiryWheel;

/// A connection handle, as stored in every index. Equality and hashing are by pointer identity
/// (`Arc::ptr_eq`-compatible), since two `Cnxn` impls are never meaningfully "equal" otherwise.
pub type CnxnHandle = Arc<dyn Cnxn>;

#[derive(Clone)]
struct HandleKey(CnxnHandle);

impl PartialEq for HandleKey {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for HandleKey {}

impl std::hash::Hash for HandleKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        (Arc::as_ptr(&self.0) as *const () as usize).hash(state);
    }
}

impl std::fmt::Debug for HandleKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "HandleKey({:p})", Arc::as_ptr(&self.0))
    }
}

/// The live-connection indexes the factory owns: `connections`, `ip_map`, `session_map`, and the
/// `expiry_wheel`, plus the per-peer cap they jointly enforce.
#[derive(Debug)]
pub struct ConnectionRegistry {
    connections: DashSet<HandleKey>,
    ip_map: DashMap<IpAddr, DashSet<HandleKey>>,
    /// Slots claimed by [`Self::try_reserve`] for a peer between accept time and the moment the
    /// connection actually lands in `ip_map` (via [`Self::insert`]) or is abandoned (via
    /// [`Self::release_reservation`]). Exists because `ip_map` itself is populated by whichever
    /// selector thread eventually drains the accepted connection, asynchronously and on a
    /// different thread than the one enforcing the cap.
    ip_reservations: DashMap<IpAddr, AtomicUsize>,
    session_map: DashMap<u64, CnxnHandle>,
    /// The expiry wheel, keyed by connection identity rather than `CnxnHandle` directly so the
    /// wheel module stays ignorant of `Cnxn`. Kept private: `HandleKey` doesn't escape this
    /// module, so callers go through [`Self::wait_time`]/[`Self::poll_expired`] instead.
    expiry_wheel: ExpiryWheel<HandleKey>,
    max_client_cnxns: usize,
    sessionless_cnxn_timeout_ms: u64,
}

/// Per-peer cap was exceeded; the caller must fast-close the socket without inserting it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapExceeded;

impl ConnectionRegistry {
    /// Creates an empty registry. `max_client_cnxns == 0` means unlimited.
    pub fn new(max_client_cnxns: usize, sessionless_cnxn_timeout_ms: u64) -> Self {
        Self {
            connections: DashSet::new(),
            ip_map: DashMap::new(),
            ip_reservations: DashMap::new(),
            session_map: DashMap::new(),
            expiry_wheel: ExpiryWheel::new(sessionless_cnxn_timeout_ms),
            max_client_cnxns,
            sessionless_cnxn_timeout_ms,
        }
    }

    /// Current count of connections registered from `addr`. Does not allocate an `ip_map` entry
    /// as a side effect (unlike insertion, which does).
    pub fn peer_count(&self, addr: IpAddr) -> usize {
        self.ip_map.get(&addr).map(|set| set.len()).unwrap_or(0)
    }

    /// Returns `Ok(())` if accepting one more connection from `addr` would stay within
    /// `max_client_cnxns`, or `Err(CapExceeded)` otherwise. A cap of `0` always succeeds. This is
    /// a read-only snapshot against `ip_map` alone; it does not account for reservations still in
    /// flight, so the accept thread enforces the cap with [`Self::try_reserve`] instead.
    pub fn check_cap(&self, addr: IpAddr) -> Result<(), CapExceeded> {
        check_cap_against(self.peer_count(addr), self.max_client_cnxns)
    }

    /// Atomically claims one of `addr`'s per-peer cap slots, counting both already-registered
    /// connections (`ip_map`) and slots other in-flight accepts have already claimed but not yet
    /// landed in `ip_map`. Must be called synchronously from the accept thread before the socket
    /// is handed off to a selector; the eventual [`Self::insert`] (success) or
    /// [`Self::release_reservation`] (the connection never makes it that far) is what lets the
    /// claimed slot go away. Without this, a selector draining its accepted-queue asynchronously
    /// could let `ip_map` stay under the cap long enough for the accept thread to admit more
    /// connections than `max_client_cnxns` allows from the same peer (invariant 5).
    pub fn try_reserve(&self, addr: IpAddr) -> Result<(), CapExceeded> {
        if self.max_client_cnxns == 0 {
            return Ok(());
        }

        let slot = self
            .ip_reservations
            .entry(addr)
            .or_insert_with(|| AtomicUsize::new(0));
        let reserved = slot.load(Ordering::Acquire);
        if self.peer_count(addr) + reserved >= self.max_client_cnxns {
            return Err(CapExceeded);
        }
        slot.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Releases a slot claimed by [`Self::try_reserve`] without it ever landing in `ip_map`:
    /// either the accept handed it to a selector whose `cnxn_factory`/`register` call failed, or
    /// the socket was fast-closed before being offered to a selector at all.
    pub fn release_reservation(&self, addr: IpAddr) {
        if let Some(slot) = self.ip_reservations.get(&addr) {
            let _ = slot.fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_sub(1));
        }
    }

    /// Registers a freshly accepted connection: inserts into `connections` and `ip_map`, touches
    /// its expiry using the sessionless timeout, and releases the [`Self::try_reserve`] slot the
    /// accept thread claimed for it (the `ip_map` entry now accounts for it instead).
    pub fn insert(&self, cnxn: CnxnHandle) {
        let key = HandleKey(cnxn.clone());
        let addr = cnxn.remote_addr().ip();
        self.connections.insert(key.clone());
        self.ip_map.entry(addr).or_default().insert(key.clone());
        self.release_reservation(addr);
        self.touch(&cnxn);
    }

    /// Publishes a session id → connection binding. Last writer wins; no collision check (see
    /// the spec's Open Questions).
    pub fn add_session(&self, session_id: u64, cnxn: CnxnHandle) {
        self.session_map.insert(session_id, cnxn);
    }

    /// Looks up a connection by session id.
    pub fn find_session(&self, session_id: u64) -> Option<CnxnHandle> {
        self.session_map.get(&session_id).map(|e| e.clone())
    }

    /// Removes `session_id` from the index, returning the connection it was bound to, if any.
    /// Does not close it; callers (`close_session`) do that.
    pub fn remove_session(&self, session_id: u64) -> Option<CnxnHandle> {
        self.session_map.remove(&session_id).map(|(_, v)| v)
    }

    /// De-registers `cnxn` from every index: `connections`, the expiry wheel, `session_map` (if
    /// its session id is nonzero), and `ip_map[addr]`. `ip_map` entries are never removed even
    /// once empty (documented leak, see spec Open Questions).
    pub fn remove(&self, cnxn: &CnxnHandle) {
        let key = HandleKey(cnxn.clone());
        self.connections.remove(&key);
        self.expiry_wheel.remove(&key);

        let session_id = cnxn.session_id();
        if session_id != 0 {
            self.session_map.remove(&session_id);
        }

        if let Some(set) = self.ip_map.get(&cnxn.remote_addr().ip()) {
            set.remove(&key);
        }
    }

    /// Renews `cnxn`'s expiry deadline using its current session timeout, or the configured
    /// sessionless timeout if it hasn't established a session yet.
    pub fn touch(&self, cnxn: &CnxnHandle) {
        let timeout_ms = cnxn
            .session_timeout()
            .unwrap_or(self.sessionless_cnxn_timeout_ms);
        self.expiry_wheel.update(&HandleKey(cnxn.clone()), timeout_ms);
    }

    /// Snapshot of every live connection.
    pub fn connections(&self) -> Vec<CnxnHandle> {
        self.connections.iter().map(|k| k.0.clone()).collect()
    }

    /// Resets per-connection stats on every live connection.
    pub fn reset_all_connection_stats(&self) {
        for entry in self.connections.iter() {
            entry.0.reset_stats();
        }
    }

    /// `connection_info(brief)` for every live connection, keyed by a stable textual identity
    /// (the formatted remote address) so the dump is deterministic enough to diff in tests.
    pub fn dump_connections(&self, brief: bool) -> BTreeMap<String, BTreeMap<String, ConnectionInfoValue>> {
        self.connections
            .iter()
            .map(|k| (k.0.remote_addr().to_string(), k.0.connection_info(brief)))
            .collect()
    }

    /// How long until the expiry wheel's earliest deadline. See [`ExpiryWheel::wait_time`].
    pub fn wait_time(&self) -> std::time::Duration {
        self.expiry_wheel.wait_time()
    }

    /// Detaches and returns every connection whose expiry deadline has passed. Callers (the
    /// expirer thread) are expected to `close()` each one; this does not itself remove them from
    /// `connections`/`ip_map`/`session_map` (a closing connection still owns that via
    /// [`Self::remove`]).
    pub fn poll_expired(&self) -> Vec<CnxnHandle> {
        self.expiry_wheel.poll().into_iter().map(|k| k.0).collect()
    }
}

fn check_cap_against(current: usize, max: usize) -> Result<(), CapExceeded> {
    if max == 0 || current < max {
        Ok(())
    } else {
        Err(CapExceeded)
    }
}
