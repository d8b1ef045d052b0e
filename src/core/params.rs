/// Indexer tuning parameters.
/// Anything a deployment may want to change lives in the config file; these are the fixed defaults.

use std::time::Duration;

/// Satoshi-equivalent base units per coin
pub const COIN: i64 = 100_000_000;

/// Heights fetched per backfill batch
pub const DEFAULT_BATCH_SIZE: u64 = 100;

/// Fetch attempts for a single mempool transaction before it is dropped
pub const MAX_MEMPOOL_FAILS: u32 = 10;

/// Capacity of the live mempool work queue (scanner, notifications and requeues share it)
pub const MEMPOOL_QUEUE_CAPACITY: usize = 10_000;

/// Periodic mempool rescan while following the tip
pub const MEMPOOL_RESCAN_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Number of mempool snapshots the transaction validator unions together
pub const MEMPOOL_SAMPLES: usize = 15;

/// Pending transactions older than this window stop being re-scanned
pub const PENDING_WINDOW_DAYS: i64 = 7;

/// Transaction ids per delete request
pub const DELETE_BATCH_SIZE: usize = 1;

/// Deepest reorg the store will resolve by walking recorded ancestors.
///
/// The deepest observed reorgs on the supported chains are a few dozen blocks;
/// a walk longer than this means the store and the node disagree about history
/// and is reported as `StoreError::ReorgTooDeep` instead of being followed.
pub const MAX_REORG_DEPTH: u64 = 1_000;

/// Cadence of "syncing block N" / "validated X of Y" progress lines
pub const PROGRESS_INTERVAL: Duration = Duration::from_secs(120);

/// Cadence of the monitor's height comparison and orphan cleanup
pub const MONITOR_INTERVAL: Duration = Duration::from_secs(30);

/// Delay between reconnect attempts to the notification socket
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Buffer size of the block and transaction channels between pipeline stages
pub const STAGE_CHANNEL_CAPACITY: usize = 256;

/// Fallback for coins without an entry in `revalidate_offset`
pub const DEFAULT_REVALIDATE_OFFSET: u64 = 100;

/// Blocks near the tip the block validator leaves re-checkable on its next run.
/// Sized to each chain's typical reorg depth.
pub fn revalidate_offset(coin: &str) -> u64 {
    match coin {
        "bch" | "btc" => 10,
        "dash" | "ltc" => 50,
        "doge" => 100,
        "dgb" => 250,
        _ => DEFAULT_REVALIDATE_OFFSET,
    }
}

/// Convert a node-reported coin amount to base units.
/// Node values carry at most 8 decimals, well within f64's exact integer range after scaling.
pub fn to_base_units(value: f64) -> i64 {
    (value * COIN as f64).round() as i64
}
