//! Error types surfaced by the connection factory.
//!
//! Configuration errors are fatal and returned to the caller of
//! [`crate::factory::Factory::configure`]. Everything else happening after `start()` is a
//! runtime condition that gets logged and swallowed per the error handling policy: selector
//! threads, the accept thread, and workers must never die from a single bad peer.

use std::net::SocketAddr;

/// Errors that can occur while turning tunables and a bind address into a runnable factory.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// `configure(.., secure = true)` was requested; this listener never terminates TLS.
    #[error("secure listening sockets are not supported by this connection factory")]
    TlsUnsupported,

    /// `numSelectorThreads` resolved to zero.
    #[error("numSelectorThreads must be at least 1")]
    NoSelectorThreads,

    /// A tunable couldn't be parsed from the key/value source.
    #[error("invalid value for tunable `{key}`: `{value}`")]
    InvalidTunable {
        /// The tunable's key, as listed in the tunables table.
        key: &'static str,
        /// The offending raw value.
        value: String,
    },

    /// Binding the listen socket failed (address in use, permission denied, etc).
    #[error("failed to bind listen socket on {addr}: {source}")]
    Bind {
        /// The address that could not be bound.
        addr: SocketAddr,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Result alias for configuration-time fallibility.
pub type ConfigResult<T> = Result<T, ConfigError>;
