//! Batch auditors run outside live ingestion: the block validator repairs the
//! store against the node, the transaction validator prunes dead pending transactions.

pub mod blocks;
pub mod txs;

use std::time::Duration;

use crate::core::params::{DEFAULT_BATCH_SIZE, DEFAULT_REVALIDATE_OFFSET, RECONNECT_DELAY};

pub use blocks::{BlockReport, BlockValidator};
pub use txs::{TxReport, TxValidator};

#[derive(Debug, Clone)]
pub struct ValidateOptions {
    pub batch: u64,
    pub rpc_threads: usize,
    pub db_threads: usize,
    /// Blocks below the tip left re-checkable on the next run
    pub revalidate_offset: u64,
    /// Pause before a failed repair is tried again
    pub repair_delay: Duration,
    /// Upper bound of the random delay before each mempool sample, so samples
    /// catch transactions still propagating to the node
    pub sample_jitter: Duration,
}

impl Default for ValidateOptions {
    fn default() -> Self {
        ValidateOptions {
            batch: DEFAULT_BATCH_SIZE,
            rpc_threads: num_cpus::get(),
            db_threads: num_cpus::get(),
            revalidate_offset: DEFAULT_REVALIDATE_OFFSET,
            repair_delay: RECONNECT_DELAY,
            sample_jitter: Duration::from_secs(2),
        }
    }
}
