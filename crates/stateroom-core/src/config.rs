//! Service-wide tunables.
//!
//! Centralized constants so limits and timeouts are easy to audit.

use std::time::Duration;

/// Limits and timeouts for the coordination service.
pub struct ServiceConfig;

impl ServiceConfig {
    /// Maximum size of one wire frame (request, response, or watch payload).
    pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

    /// Maximum concurrent client connections accepted by one server.
    pub const MAX_CONNECTIONS: usize = 256;

    /// Timeout for a client connecting to the server or to a private
    /// watch channel. Reads have no timeout: a registered watch blocks
    /// until its condition holds.
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

    /// How long a launching parent waits for the server child to report
    /// its bound address.
    pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

    /// Grace period between SIGTERM and SIGKILL when stopping a worker
    /// or the server process.
    pub const STOP_GRACE_MS: u64 = 2_000;
}
