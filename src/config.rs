//! Tunables read at configure time from a process-wide key/value source.
//!
//! The real lookup (a config file, system properties, whatever the companion configuration
//! loader parses) is represented here as `impl Fn(&str) -> Option<String>` so this crate never
//! depends on that loader's format.

use crate::error::{ConfigError, ConfigResult};

/// `sessionlessCnxnTimeout` default, in milliseconds.
pub const DEFAULT_SESSIONLESS_CNXN_TIMEOUT_MS: u64 = 10_000;
/// `directBufferBytes` default.
pub const DEFAULT_DIRECT_BUFFER_BYTES: usize = 65_536;
/// `shutdownTimeout` default, in milliseconds.
pub const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 5_000;
/// `maxClientCnxns` default.
pub const DEFAULT_MAX_CLIENT_CNXNS: usize = 60;

/// Resolved tunables for a single [`crate::factory::Factory::configure`] call.
#[derive(Debug, Clone, Copy)]
pub struct Tunables {
    /// Expiry-wheel tick length and sessionless reap bound, in milliseconds.
    pub sessionless_cnxn_timeout_ms: u64,
    /// Number of selector threads, `S`. Always `>= 1`.
    pub num_selector_threads: usize,
    /// Number of worker threads, `W`. `0` means inline (synchronous) I/O.
    pub num_worker_threads: usize,
    /// Per-worker direct buffer size in bytes. `0` disables direct buffers.
    pub direct_buffer_bytes: usize,
    /// Worker pool join deadline on shutdown, in milliseconds.
    pub shutdown_timeout_ms: u64,
    /// Per-peer connection cap. `0` means unlimited.
    pub max_client_cnxns: usize,
}

impl Default for Tunables {
    fn default() -> Self {
        let cores = num_cpus::get();
        Self {
            sessionless_cnxn_timeout_ms: DEFAULT_SESSIONLESS_CNXN_TIMEOUT_MS,
            num_selector_threads: default_num_selector_threads(cores),
            num_worker_threads: 2 * cores,
            direct_buffer_bytes: DEFAULT_DIRECT_BUFFER_BYTES,
            shutdown_timeout_ms: DEFAULT_SHUTDOWN_TIMEOUT_MS,
            max_client_cnxns: DEFAULT_MAX_CLIENT_CNXNS,
        }
    }
}

/// `max(ceil(sqrt(cores / 2)), 1)`, the default selector thread count.
fn default_num_selector_threads(cores: usize) -> usize {
    let half = (cores as f64) / 2.0;
    (half.sqrt().ceil() as usize).max(1)
}

impl Tunables {
    /// Resolves all six tunables from `lookup`, falling back to the documented defaults for any
    /// key the lookup doesn't recognize. Returns a [`ConfigError::InvalidTunable`] if a present
    /// value fails to parse, and [`ConfigError::NoSelectorThreads`] if the resolved selector
    /// count is zero.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> ConfigResult<Self> {
        let defaults = Self::default();

        let sessionless_cnxn_timeout_ms = parse_or(
            &lookup,
            "sessionlessCnxnTimeout",
            defaults.sessionless_cnxn_timeout_ms,
        )?;
        let num_selector_threads = parse_or(
            &lookup,
            "numSelectorThreads",
            defaults.num_selector_threads,
        )?;
        let num_worker_threads =
            parse_or(&lookup, "numWorkerThreads", defaults.num_worker_threads)?;
        let direct_buffer_bytes =
            parse_or(&lookup, "directBufferBytes", defaults.direct_buffer_bytes)?;
        let shutdown_timeout_ms =
            parse_or(&lookup, "shutdownTimeout", defaults.shutdown_timeout_ms)?;
        let max_client_cnxns = parse_or(&lookup, "maxClientCnxns", defaults.max_client_cnxns)?;

        if num_selector_threads == 0 {
            return Err(ConfigError::NoSelectorThreads);
        }

        Ok(Self {
            sessionless_cnxn_timeout_ms,
            num_selector_threads,
            num_worker_threads,
            direct_buffer_bytes,
            shutdown_timeout_ms,
            max_client_cnxns,
        })
    }
}

fn parse_or<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> ConfigResult<T>
where
    T: std::str::FromStr,
{
    match lookup(key) {
        Some(raw) => raw.parse().map_err(|_| ConfigError::InvalidTunable {
            key,
            value: raw,
        }),
        None => Ok(default),
    }
}
