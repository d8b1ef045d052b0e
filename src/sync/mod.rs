//! Block ingestion: bulk backfill over a height range and live tip following.
//!
//! Both modes end in the same two stages: a single block writer, which is the only
//! place blocks enter the store, and a pool of transaction writers fed by it.

pub mod backfill;
pub mod live;
pub mod order;
pub mod pipeline;

use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::core::params::{DEFAULT_BATCH_SIZE, PROGRESS_INTERVAL};
use crate::core::types::{short_hash, Block, Tx};
use crate::error::Error;
use crate::monitor::MonitorNotifier;
use crate::rpc::ChainSource;
use crate::store::BlockStore;
use pipeline::{recv_or_cancel, send_or_cancel, Fatal, WorkQueue};

pub use backfill::BackfillReport;

#[derive(Debug, Clone)]
pub struct IndexOptions {
    pub start: Option<u64>,
    pub end: Option<u64>,
    /// Start from the store's tip, run to the node's tip, then keep following it
    pub sync: bool,
    pub batch: u64,
    /// Allow rewriting heights below the canonical tip
    pub recover: bool,
    pub rpc_threads: usize,
    pub db_threads: usize,
}

impl Default for IndexOptions {
    fn default() -> Self {
        IndexOptions {
            start: None,
            end: None,
            sync: false,
            batch: DEFAULT_BATCH_SIZE,
            recover: false,
            rpc_threads: num_cpus::get(),
            db_threads: num_cpus::get(),
        }
    }
}

pub struct Indexer {
    store: Arc<dyn BlockStore>,
    source: Arc<dyn ChainSource>,
    options: IndexOptions,
    monitor: Option<MonitorNotifier>,
}

impl Indexer {
    pub fn new(store: Arc<dyn BlockStore>, source: Arc<dyn ChainSource>, options: IndexOptions) -> Self {
        Indexer { store, source, options, monitor: None }
    }

    /// Ping the monitor service for every block written while following the tip
    pub fn with_monitor(mut self, monitor: MonitorNotifier) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// Live mode runs after the backfill only for `--sync` without `--recover`
    pub fn follows_tip(&self) -> bool {
        self.options.sync && !self.options.recover
    }

    fn batch(&self) -> u64 { self.options.batch.max(1) }
}

/// One transaction write; no block means pending
#[derive(Debug)]
pub(crate) struct TxJob {
    pub tx: Tx,
    pub index: Option<u32>,
    pub block_id: Option<u64>,
}

pub(crate) enum WriteMode {
    Backfill,
    Live {
        tip: mpsc::Sender<()>,
        monitor: Option<MonitorNotifier>,
    },
}

/// Insert blocks in arrival order and fan their transactions out to the tx writers.
/// Returns the number of blocks written.
pub(crate) async fn write_blocks(
    store: Arc<dyn BlockStore>,
    recover: bool,
    mode: WriteMode,
    mut blocks: mpsc::Receiver<Block>,
    jobs: mpsc::Sender<TxJob>,
    fatal: Fatal,
) -> u64 {
    let cancel = fatal.cancel().clone();
    let mut written = 0u64;
    let mut last_progress = Instant::now();
    let mut last_recheck: Option<String> = None;

    while let Some(block) = recv_or_cancel(&mut blocks, &cancel).await {
        let height = block.height();
        let inserted = match store.insert_block(&block, recover).await {
            Ok(inserted) => inserted,
            Err(e) if e.is_rejection() && matches!(mode, WriteMode::Live { .. }) => {
                tracing::warn!("⚠️ Skipping block #{} [{}]: {}", height, short_hash(block.hash()), e);
                continue;
            }
            Err(e) => {
                fatal.report(Error::stage(format!("block writer at #{}", height), e));
                return written;
            }
        };
        written += 1;
        tracing::debug!(height, hash = short_hash(block.hash()), orphan = inserted.is_orphan, "📦 Stored block");

        if let WriteMode::Live { tip, monitor } = &mode {
            if let Some(monitor) = monitor {
                monitor.new_block(height);
            }
            // a block that lands off the canonical chain means we are missing part of a new branch;
            // ask for one more pass over the tip, once per block
            if inserted.is_orphan && last_recheck.as_deref() != Some(block.hash()) {
                tracing::info!("🔄 Block #{} [{}] is not canonical yet, rechecking tip", height, short_hash(block.hash()));
                last_recheck = Some(block.hash().to_string());
                let _ = tip.try_send(());
            }
        }

        if last_progress.elapsed() >= PROGRESS_INTERVAL {
            tracing::info!("📦 Syncing block #{}", height);
            last_progress = Instant::now();
        }

        let block_id = inserted.id;
        for (i, tx) in block.txs.into_iter().enumerate() {
            let job = TxJob { tx, index: Some(i as u32), block_id: Some(block_id) };
            if !send_or_cancel(&jobs, job, &cancel).await {
                return written;
            }
        }
    }
    written
}

/// `workers` tasks persisting transactions; any failed write is fatal
pub(crate) fn spawn_tx_writers(
    tasks: &mut JoinSet<()>,
    store: Arc<dyn BlockStore>,
    queue: WorkQueue<TxJob>,
    workers: usize,
    fatal: Fatal,
) {
    for _ in 0..workers.max(1) {
        let (store, queue, fatal) = (store.clone(), queue.clone(), fatal.clone());
        tasks.spawn(async move {
            let cancel = fatal.cancel().clone();
            while let Some(job) = queue.next(&cancel).await {
                if let Err(e) = store.insert_tx(&job.tx, job.index, job.block_id).await {
                    fatal.report(Error::stage(format!("tx writer for {}", short_hash(&job.tx.txid)), e));
                    return;
                }
            }
        });
    }
}

/// Wait for every task; a panicked task counts as a fatal error
pub(crate) async fn join_all(tasks: &mut JoinSet<()>, fatal: &Fatal) {
    while let Some(result) = tasks.join_next().await {
        if let Err(e) = result {
            fatal.report(Error::Pipeline(format!("pipeline task failed: {}", e)));
        }
    }
}
