//! Block store: the only owner of block, transaction and cursor persistence.
//!
//! All writers (backfill, tip following, validator repairs) go through the same
//! [`BlockStore`] and are serialised by the ledger's write lock, so the
//! canonical-chain invariant holds no matter how many pipelines share a coin.

pub mod ledger;
pub mod reorg;
pub mod table;

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

use crate::config::{DbConfig, RetryConfig};
use crate::core::params::MAX_REORG_DEPTH;
use crate::core::types::*;
use crate::retry;

pub use ledger::Ledger;
pub use table::{MemTable, SledTable, Table};

/// Cursor keys
pub const CURSOR_VALIDATED_BLOCK: &str = "validatedBlock";
pub const CURSOR_VALIDATED_TX: &str = "validatedTransaction";
pub const CURSOR_ORPHAN_COUNT: &str = "orphanCount";

#[async_trait]
pub trait BlockStore: Send + Sync {
    /// Insert or refresh a block and reconcile the canonical chain around it
    async fn insert_block(&self, block: &Block, recover: bool) -> Result<InsertedBlock, StoreError>;
    /// Upsert a transaction; `block_id = None` records it as pending
    async fn insert_tx(&self, tx: &Tx, index: Option<u32>, block_id: Option<u64>) -> Result<(), StoreError>;
    async fn get_block(&self, at: BlockRef) -> Result<Option<StoredBlock>, StoreError>;
    /// Highest canonical block, `None` for an empty store
    async fn last_block(&self) -> Result<Option<StoredBlock>, StoreError>;
    /// Lowest canonical block, where the chain was bootstrapped
    async fn first_block(&self) -> Result<Option<StoredBlock>, StoreError>;
    /// Txids currently recorded in block `block_id`
    async fn block_txids(&self, block_id: u64) -> Result<Vec<String>, StoreError>;
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
    async fn orphan_count(&self) -> Result<u64, StoreError>;
    /// Physically remove orphaned blocks and the transactions only they held
    async fn delete_orphans(&self) -> Result<u64, StoreError>;
    /// Delete pending transactions by id; rows that gained a block in the meantime are kept
    async fn delete_invalid_txs(&self, ids: &[u64]) -> Result<u64, StoreError>;
    /// Pending transactions with id >= `from_id`, ascending
    async fn pending_txs(&self, from_id: u64) -> Result<Vec<PendingTx>, StoreError>;
    /// Id of the earliest transaction in the first canonical block at or after `timestamp`
    async fn tx_at_block_time(&self, timestamp: i64) -> Result<Option<u64>, StoreError>;
}

/// Async front for a [`Ledger`]: every call takes a connection permit, runs on the
/// blocking pool and carries a deadline. Writes retry transient failures.
pub struct Store<T: Table> {
    ledger: Arc<Ledger<T>>,
    permits: Arc<Semaphore>,
    timeout: Duration,
    retry: RetryConfig,
}

pub type SledStore = Store<SledTable>;
pub type MemoryStore = Store<MemTable>;

impl SledStore {
    pub fn open<P: AsRef<Path>>(path: P, config: &DbConfig) -> Result<Self, StoreError> {
        let table = SledTable::open(path)?;
        Ok(Store::with_table(table, config))
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Store::with_table(MemTable::new(), &DbConfig::default())
    }
}

impl Default for MemoryStore {
    fn default() -> Self { Self::new() }
}

impl<T: Table> Store<T> {
    pub fn with_table(table: T, config: &DbConfig) -> Self {
        Store {
            ledger: Arc::new(Ledger::new(table, MAX_REORG_DEPTH)),
            permits: Arc::new(Semaphore::new(config.max_conns.max(1))),
            timeout: config.timeout(),
            retry: config.retry,
        }
    }

    pub fn ledger(&self) -> &Ledger<T> { &self.ledger }

    pub async fn flush(&self) -> Result<(), StoreError> {
        self.run("flush", |ledger| ledger.flush()).await
    }

    async fn run<R, F>(&self, op: &'static str, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&Ledger<T>) -> Result<R, StoreError> + Send + 'static,
        R: Send + 'static,
    {
        let permit = self.permits.clone().acquire_owned().await.map_err(|_| StoreError::Closed)?;
        let ledger = self.ledger.clone();
        // the permit lives as long as the work, even past a timeout
        let task = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            f(&ledger)
        });
        match tokio::time::timeout(self.timeout, task).await {
            Err(_) => Err(StoreError::Timeout { op }),
            Ok(Err(e)) => Err(StoreError::Db(format!("{} task failed: {}", op, e))),
            Ok(Ok(result)) => result,
        }
    }

    async fn run_retry<R, F>(&self, op: &'static str, f: F) -> Result<R, StoreError>
    where
        F: Fn(&Ledger<T>) -> Result<R, StoreError> + Clone + Send + 'static,
        R: Send + 'static,
    {
        retry::simple(self.retry, StoreError::is_transient, || self.run(op, f.clone())).await
    }
}

#[async_trait]
impl<T: Table> BlockStore for Store<T> {
    async fn insert_block(&self, block: &Block, recover: bool) -> Result<InsertedBlock, StoreError> {
        let mut header = block.header.clone();
        if header.tx_count == 0 {
            header.tx_count = block.txs.len() as u64;
        }
        self.run_retry("insert_block", move |ledger| ledger.insert_block(&header, recover)).await
    }

    async fn insert_tx(&self, tx: &Tx, index: Option<u32>, block_id: Option<u64>) -> Result<(), StoreError> {
        let tx = tx.clone();
        self.run_retry("insert_tx", move |ledger| ledger.insert_tx(&tx, index, block_id)).await
    }

    async fn get_block(&self, at: BlockRef) -> Result<Option<StoredBlock>, StoreError> {
        self.run("get_block", move |ledger| ledger.get_block(&at)).await
    }

    async fn last_block(&self) -> Result<Option<StoredBlock>, StoreError> {
        self.run("last_block", |ledger| ledger.last_block()).await
    }

    async fn first_block(&self) -> Result<Option<StoredBlock>, StoreError> {
        self.run("first_block", |ledger| ledger.first_block()).await
    }

    async fn block_txids(&self, block_id: u64) -> Result<Vec<String>, StoreError> {
        self.run("block_txids", move |ledger| ledger.block_txids(block_id)).await
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let key = key.to_string();
        self.run("get", move |ledger| ledger.get_meta(&key)).await
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let (key, value) = (key.to_string(), value.to_string());
        self.run_retry("set", move |ledger| ledger.set_meta(&key, &value)).await
    }

    async fn orphan_count(&self) -> Result<u64, StoreError> {
        self.run("orphan_count", |ledger| ledger.orphan_count()).await
    }

    async fn delete_orphans(&self) -> Result<u64, StoreError> {
        self.run_retry("delete_orphans", |ledger| ledger.delete_orphans()).await
    }

    async fn delete_invalid_txs(&self, ids: &[u64]) -> Result<u64, StoreError> {
        let ids = ids.to_vec();
        self.run_retry("delete_invalid_txs", move |ledger| ledger.delete_invalid_txs(&ids)).await
    }

    async fn pending_txs(&self, from_id: u64) -> Result<Vec<PendingTx>, StoreError> {
        self.run("pending_txs", move |ledger| ledger.pending_txs(from_id)).await
    }

    async fn tx_at_block_time(&self, timestamp: i64) -> Result<Option<u64>, StoreError> {
        self.run("tx_at_block_time", move |ledger| ledger.tx_at_block_time(timestamp)).await
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(String),
    #[error("serialization error: {0}")]
    Serialize(String),
    #[error("store {op} timed out")]
    Timeout { op: &'static str },
    #[error("store is shutting down")]
    Closed,
    #[error("corrupt store: {0}")]
    Corrupt(String),
    #[error("block {hash} at height {height} is below canonical tip {tip} and does not extend it")]
    BelowCanonicalTip { height: u64, hash: String, tip: u64 },
    #[error("reorg at height {height} deeper than {depth} blocks")]
    ReorgTooDeep { height: u64, depth: u64 },
    #[error("block {hash} already stored at height {stored}, refusing height {got}")]
    HashHeightConflict { hash: String, stored: u64, got: u64 },
}

impl StoreError {
    /// I/O failures worth another attempt; invariant violations are not
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Db(_) | StoreError::Timeout { .. })
    }

    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            StoreError::BelowCanonicalTip { .. }
                | StoreError::ReorgTooDeep { .. }
                | StoreError::HashHeightConflict { .. }
        )
    }
}
