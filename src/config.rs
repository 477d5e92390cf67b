//! Tuning parameters for the DHT node.
//!
//! Defaults follow the values commonly used by mainline DHT deployments.

use std::time::Duration;

/// Number of entries per routing table bucket, and the size of the
/// closest-node set returned from lookups.
pub const DEFAULT_K: usize = 8;

/// Number of concurrently outstanding queries per traversal.
pub const DEFAULT_ALPHA: usize = 3;

/// Capacity of the observer pool. This bounds outstanding RPCs globally.
pub const DEFAULT_OBSERVER_POOL: usize = 256;

/// How long an outstanding RPC may go unanswered before it is failed.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(15);

/// Failures before a routing table entry is evicted.
pub const DEFAULT_FAIL_LIMIT: u8 = 3;

/// A bucket untouched for this long gets a refresh traversal.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// How often peers re-announce themselves.
pub const DEFAULT_ANNOUNCE_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// Feed items unseen for this long are expired.
pub const DEFAULT_FEED_TTL: Duration = Duration::from_secs(60 * 60);

/// Cadence of the storage sweep and token secret rotation.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(2 * 60);

/// Upper bound on stored torrent entries.
pub const DEFAULT_MAX_TORRENTS: usize = 5000;

/// Upper bound on stored feed items.
pub const DEFAULT_MAX_FEED_ITEMS: usize = 5000;

/// Peers returned per `get_peers` reply.
pub const DEFAULT_MAX_PEERS_REPLY: usize = 100;

/// Longest accepted torrent name; longer names are truncated.
pub const MAX_NAME_LEN: usize = 50;

/// Largest accepted feed payload in encoded form.
pub const MAX_FEED_PAYLOAD: usize = 1024;

#[derive(Debug, Clone)]
pub struct DhtConfig {
    pub k: usize,
    pub alpha: usize,
    pub observer_pool: usize,
    pub rpc_timeout: Duration,
    pub fail_limit: u8,
    pub refresh_interval: Duration,
    pub announce_interval: Duration,
    pub feed_ttl: Duration,
    pub tick_interval: Duration,
    pub max_torrents: usize,
    pub max_feed_items: usize,
    pub max_peers_reply: usize,
}

impl DhtConfig {
    /// Peer entries older than this are purged on the storage sweep.
    pub fn peer_ttl(&self) -> Duration {
        self.announce_interval + self.announce_interval / 2
    }

    /// Largest candidate set a traversal will track.
    pub fn max_candidates(&self) -> usize {
        self.k * self.k
    }
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            k: DEFAULT_K,
            alpha: DEFAULT_ALPHA,
            observer_pool: DEFAULT_OBSERVER_POOL,
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
            fail_limit: DEFAULT_FAIL_LIMIT,
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            announce_interval: DEFAULT_ANNOUNCE_INTERVAL,
            feed_ttl: DEFAULT_FEED_TTL,
            tick_interval: DEFAULT_TICK_INTERVAL,
            max_torrents: DEFAULT_MAX_TORRENTS,
            max_feed_items: DEFAULT_MAX_FEED_ITEMS,
            max_peers_reply: DEFAULT_MAX_PEERS_REPLY,
        }
    }
}
