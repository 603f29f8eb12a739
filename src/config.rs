//! Protocol constants and per-node tunables.

use std::time::Duration;

/// Maximum number of vault peers held in the routing table.
pub const MAX_ROUTING_TABLE_SIZE: usize = 64;

/// Size of a close group: the row width of the group matrix.
pub const CLOSEST_NODES_SIZE: usize = 8;

/// Number of replicants a group-addressed message converges on.
pub const NODE_GROUP_SIZE: usize = 4;

/// Maximum number of entries kept in a message's route history.
pub const MAX_ROUTE_HISTORY: usize = 5;

/// Initial hops-to-live stamped on every originated message.
pub const HOPS_TO_LIVE: u16 = 50;

/// Fraction of the routing table a single bucket may occupy before
/// admissions into it require evicting from an over-full bucket.
pub const GREEDY_FRACTION: f64 = 0.25;

/// Maximum clients accepted per client id in the client table.
pub const MAX_CLIENTS_PER_ID: usize = NODE_GROUP_SIZE;

/// Attempts per next-hop before the connection is torn down.
pub const MAX_SEND_ATTEMPTS: usize = 3;

/// Backoff slept on the outbound pool between send retries.
pub const SEND_RETRY_BACKOFF: Duration = Duration::from_millis(50);

/// Default deadline for a pending response before the timer fails it.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Entries kept by the read-through content cache.
pub const MAX_CACHED_VALUES: usize = 1000;

/// Per-bucket occupancy ceiling derived from [GREEDY_FRACTION].
pub fn bucket_ceiling() -> usize {
    ((MAX_ROUTING_TABLE_SIZE as f64) * GREEDY_FRACTION).ceil() as usize
}

/// Per-node tunables. Protocol constants above are fixed; these only
/// shape local behaviour.
#[derive(Debug, Clone)]
pub struct Config {
    /// Deadline for responses awaited by the timer.
    pub response_timeout: Duration,
    /// Number of outbound worker threads.
    pub outbound_workers: usize,
    /// Whether this node joins as a client (does not route).
    pub client_mode: bool,
    /// Whether cacheable traffic goes through the content cache.
    pub caching: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            outbound_workers: 2,
            client_mode: false,
            caching: true,
        }
    }
}
