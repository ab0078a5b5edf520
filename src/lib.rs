#![deny(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unused_imports
)]
#![doc(test(attr(deny(warnings))))]

//! `cnxn-factory` accepts client TCP sockets, multiplexes their I/O across a small set of
//! `mio` selector threads, and dispatches per-connection work onto a bounded worker pool.
//!
//! The wire protocol itself is out of scope: callers supply a [`selector::CnxnFactory`] that
//! wraps each accepted socket into a [`cnxn::Cnxn`], and this crate handles everything from there:
//! registration, readiness dispatch, per-peer caps, idle-connection expiry, and graceful
//! shutdown.
//!
//! ## Examples
//!
//! A runnable echo server built on this crate can be found under `demos/` in the source
//! repository.

pub mod accept;
pub mod cnxn;
pub mod config;
pub mod error;
pub mod expirer;
pub mod expiry;
pub mod factory;
pub mod ratelimit;
pub mod registry;
pub mod selector;
pub mod work;

#[cfg(test)]
mod testutil;

pub use cnxn::{Cnxn, ConnectionInfoValue, IoContext, WorkRequest};
pub use config::Tunables;
pub use error::{ConfigError, ConfigResult};
pub use factory::{Factory, FactoryState};
pub use selector::CnxnFactory;
