//! Tunnel sizing and operational configuration.
//!
//! Hardcoded values that are not wire-protocol constants. Wire constants
//! (envelope magic, layout) live in `frame`.

/// Submission/completion queue depth per connection.
pub const RING_ENTRIES: u32 = 256;

/// Peer-side pool: receives of the framed byte stream.
pub const PEER_POOL_COUNT: u16 = 1024;
pub const PEER_POOL_BUF_SIZE: u32 = 4096;

/// TUN-side pool: single-packet reads, so slots only need to cover the MTU.
pub const TUN_POOL_COUNT: u16 = 1024;
pub const TUN_POOL_BUF_SIZE: u32 = 2048;

/// Buffer returns queued before one batched tail advance.
pub const RETURN_BATCH: u16 = 10;

/// Hops accepted on the proxy chain; each adds a blocking handshake.
pub const MAX_PROXY_HOPS: usize = 8;

// Compile-time sanity checks
const _: () = assert!(
    PEER_POOL_COUNT.is_power_of_two() && PEER_POOL_COUNT >= 2,
    "peer pool count must be a power of two >= 2"
);
const _: () = assert!(
    TUN_POOL_COUNT.is_power_of_two() && TUN_POOL_COUNT >= 2,
    "TUN pool count must be a power of two >= 2"
);
const _: () = assert!(
    TUN_POOL_BUF_SIZE >= 1500,
    "TUN pool slots must hold a default-MTU packet"
);
