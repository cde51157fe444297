//! Relay configuration.

use std::net::SocketAddr;
use std::time::Duration;

/// Default listen address.
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:3536";

/// Default per-endpoint outbound queue length.
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 64;

/// Default wait before a message that must not be dropped counts as undeliverable.
pub const DEFAULT_PUSH_TIMEOUT: Duration = Duration::from_millis(500);

/// Default number of candidates tried per `pair` request.
pub const DEFAULT_PAIR_ATTEMPTS: usize = 3;

/// Default bound on the WebSocket upgrade.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Relay settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Address the WebSocket listener binds to.
    pub bind_address: SocketAddr,

    /// Bounded length of each endpoint's outbound queue.
    pub outbound_capacity: usize,

    /// How long delivering a reply, notice or negotiation payload may wait
    /// on a full queue.
    pub push_timeout: Duration,

    /// Candidates sampled per `pair` before giving up on a contended pool.
    pub pair_attempts: usize,

    /// How long a new connection may take to complete the WebSocket upgrade.
    pub handshake_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from(([0, 0, 0, 0], 3536)),
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
            push_timeout: DEFAULT_PUSH_TIMEOUT,
            pair_attempts: DEFAULT_PAIR_ATTEMPTS,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }
}
