use std::collections::{BTreeSet, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::ValidateOptions;
use crate::core::params::{PROGRESS_INTERVAL, STAGE_CHANNEL_CAPACITY};
use crate::core::types::*;
use crate::error::{Error, Result};
use crate::rpc::ChainSource;
use crate::store::{BlockStore, CURSOR_VALIDATED_BLOCK};
use crate::sync::backfill::{fetch_blocks, produce_heights};
use crate::sync::join_all;
use crate::sync::order::{HasHeight, Orderer};
use crate::sync::pipeline::{recv_or_cancel, send_or_cancel, Fatal, WorkQueue};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockReport {
    pub start: u64,
    pub end: u64,
    pub checked: u64,
    pub repaired: u64,
    /// `validatedBlock` after the run
    pub cursor: Option<u64>,
}

/// The node's block next to what the store holds at that height
struct Comparison {
    node: Block,
    stored: Option<StoredBlock>,
    txids: Vec<String>,
}

impl HasHeight for Comparison {
    fn height(&self) -> u64 { self.node.height() }
}

enum Repair {
    /// Rewrite the block and all of its transactions
    Block(Block),
    /// Add the transactions the stored block lacks, at their positions in the node's block
    Missing { height: u64, block_id: u64, txs: Vec<(u32, Tx)> },
}

impl Repair {
    fn height(&self) -> u64 {
        match self {
            Repair::Block(block) => block.height(),
            Repair::Missing { height, .. } => *height,
        }
    }
}

/// Next height whose predecessors have all been checked
struct Watermark {
    next: u64,
    done: BTreeSet<u64>,
}

impl Watermark {
    fn new(start: u64) -> Self {
        Watermark { next: start, done: BTreeSet::new() }
    }

    fn mark(&mut self, height: u64) {
        if height >= self.next {
            self.done.insert(height);
        }
        while self.done.remove(&self.next) {
            self.next += 1;
        }
    }
}

/// Compares every stored block from the `validatedBlock` cursor to the store's tip
/// against the node and repairs what differs.
pub struct BlockValidator {
    store: Arc<dyn BlockStore>,
    source: Arc<dyn ChainSource>,
    options: ValidateOptions,
}

impl BlockValidator {
    pub fn new(store: Arc<dyn BlockStore>, source: Arc<dyn ChainSource>, options: ValidateOptions) -> Self {
        BlockValidator { store, source, options }
    }

    /// `(start, end, saved cursor)`, or `None` for an empty store
    async fn resolve_range(&self) -> Result<Option<(u64, u64, Option<u64>)>> {
        let Some(tip) = self.store.last_block().await? else { return Ok(None) };
        let saved = self.store.get(CURSOR_VALIDATED_BLOCK).await?.and_then(|v| v.parse::<u64>().ok());
        let start = match saved {
            Some(cursor) => cursor,
            None => {
                let base = self.store.first_block().await?.map(|b| b.height()).unwrap_or(0);
                tracing::warn!("⚠️ No {} cursor, starting at the first stored block #{}", CURSOR_VALIDATED_BLOCK, base);
                base
            }
        };
        Ok(Some((start, tip.height(), saved)))
    }

    pub async fn run(&self, parent: &CancellationToken) -> Result<BlockReport> {
        let Some((start, end, saved)) = self.resolve_range().await? else {
            tracing::info!("✅ Store is empty, nothing to validate");
            return Ok(BlockReport::default());
        };
        if start > end {
            tracing::info!("✅ Blocks already validated through #{}", end);
            return Ok(BlockReport { start, end, cursor: saved, ..Default::default() });
        }
        let total = end - start + 1;
        tracing::info!("🔎 Validating blocks #{}..=#{} ({} blocks)", start, end, total);

        let cancel = parent.child_token();
        let (fatal, fatal_rx) = Fatal::new(cancel.clone());
        let fetchers = self.options.rpc_threads.max(1);

        let (height_tx, height_rx) = mpsc::channel(fetchers * 2);
        let (fetched_tx, fetched_rx) = mpsc::channel(STAGE_CHANNEL_CAPACITY);
        let (compared_tx, compared_rx) = mpsc::channel(STAGE_CHANNEL_CAPACITY);
        let (repair_tx, repair_rx) = mpsc::channel(STAGE_CHANNEL_CAPACITY);
        let (done_tx, mut done_rx) = mpsc::channel(STAGE_CHANNEL_CAPACITY);

        let mut tasks = JoinSet::new();
        tasks.spawn(produce_heights(
            self.source.clone(), start, end, self.options.batch.max(1), false, height_tx, fatal.clone(),
        ));
        let heights = WorkQueue::new(height_rx);
        for _ in 0..fetchers {
            tasks.spawn(fetch_blocks(self.source.clone(), heights.clone(), fetched_tx.clone(), fatal.clone()));
        }
        drop(fetched_tx);
        let fetched = WorkQueue::new(fetched_rx);
        for _ in 0..self.options.db_threads.max(1) {
            tasks.spawn(read_stored(self.store.clone(), fetched.clone(), compared_tx.clone(), fatal.clone()));
        }
        drop(compared_tx);
        tasks.spawn(check_blocks(start, compared_rx, repair_tx, done_tx.clone(), cancel.clone()));
        let repairer = tokio::spawn(repair_blocks(
            self.store.clone(), repair_rx, done_tx, self.options.repair_delay, cancel.clone(),
        ));

        let mut watermark = Watermark::new(start);
        let mut checked = 0u64;
        let mut cursor = saved;
        let mut last_progress = Instant::now();
        while checked < total {
            let Some(height) = recv_or_cancel(&mut done_rx, &cancel).await else { break };
            watermark.mark(height);
            checked += 1;
            if last_progress.elapsed() >= PROGRESS_INTERVAL {
                tracing::info!("🔎 Validated {} of {} blocks", checked, total);
                match self.advance_cursor(cursor, start, watermark.next, end).await {
                    Ok(moved) => cursor = moved,
                    Err(e) => {
                        fatal.report(Error::stage("block validator cursor", e));
                        break;
                    }
                }
                last_progress = Instant::now();
            }
        }

        join_all(&mut tasks, &fatal).await;
        let repaired = match repairer.await {
            Ok(n) => n,
            Err(e) => {
                fatal.report(Error::Pipeline(format!("repairer failed: {}", e)));
                0
            }
        };
        if let Some(err) = fatal_rx.take() {
            return Err(err);
        }

        let cursor = self.advance_cursor(cursor, start, watermark.next, end).await?;
        if checked == total {
            tracing::info!("✅ Validated {} of {} blocks, {} repaired", checked, total, repaired);
        } else {
            tracing::info!("Block validation interrupted after {} of {} blocks", checked, total);
        }
        Ok(BlockReport { start, end, checked, repaired, cursor })
    }

    /// Move the cursor to the watermark if that is forward, never past `tip - revalidate_offset`
    async fn advance_cursor(&self, current: Option<u64>, start: u64, watermark: u64, tip: u64) -> Result<Option<u64>> {
        let candidate = watermark.min(tip.saturating_sub(self.options.revalidate_offset));
        let floor = current.unwrap_or(start);
        if watermark == start || candidate < floor || current == Some(candidate) {
            return Ok(current);
        }
        self.store.set(CURSOR_VALIDATED_BLOCK, &candidate.to_string()).await?;
        tracing::debug!("{} cursor now #{}", CURSOR_VALIDATED_BLOCK, candidate);
        Ok(Some(candidate))
    }
}

/// Load the stored block and its txids at each fetched block's height
async fn read_stored(
    store: Arc<dyn BlockStore>,
    fetched: WorkQueue<Vec<Block>>,
    out: mpsc::Sender<Comparison>,
    fatal: Fatal,
) {
    let cancel = fatal.cancel().clone();
    while let Some(blocks) = fetched.next(&cancel).await {
        for node in blocks {
            let height = node.height();
            let stored = match store.get_block(BlockRef::ByHeight(height)).await {
                Ok(stored) => stored,
                Err(e) => {
                    fatal.report(Error::stage(format!("store read at #{}", height), e));
                    return;
                }
            };
            let txids = match &stored {
                Some(block) => match store.block_txids(block.id).await {
                    Ok(txids) => txids,
                    Err(e) => {
                        fatal.report(Error::stage(format!("store read at #{}", height), e));
                        return;
                    }
                },
                None => Vec::new(),
            };
            if !send_or_cancel(&out, Comparison { node, stored, txids }, &cancel).await {
                return;
            }
        }
    }
}

/// Put comparisons back in height order and decide per block
async fn check_blocks(
    start: u64,
    mut compared: mpsc::Receiver<Comparison>,
    repairs: mpsc::Sender<Repair>,
    done: mpsc::Sender<u64>,
    cancel: CancellationToken,
) {
    let mut orderer = Orderer::new(start);
    while let Some(comparison) = recv_or_cancel(&mut compared, &cancel).await {
        for comparison in orderer.push(comparison) {
            let height = comparison.height();
            let sent = match verdict(comparison) {
                None => send_or_cancel(&done, height, &cancel).await,
                Some(repair) => send_or_cancel(&repairs, repair, &cancel).await,
            };
            if !sent {
                return;
            }
        }
    }
}

fn verdict(comparison: Comparison) -> Option<Repair> {
    let Comparison { node, stored, txids } = comparison;
    let height = node.height();
    let Some(stored) = stored else {
        tracing::warn!("⚠️ Block #{} missing from the store", height);
        return Some(Repair::Block(node));
    };
    if stored.hash() != node.hash() {
        tracing::warn!("⚠️ Block #{} differs: store has {}, node has {}",
            height, short_hash(stored.hash()), short_hash(node.hash()));
        return Some(Repair::Block(node));
    }
    if txids.len() == node.txs.len() {
        return None;
    }

    let have: HashSet<&str> = txids.iter().map(String::as_str).collect();
    let missing: Vec<(u32, Tx)> = node.txs.iter()
        .enumerate()
        .filter(|(_, tx)| !have.contains(tx.txid.as_str()))
        .map(|(i, tx)| (i as u32, tx.clone()))
        .collect();
    if missing.is_empty() {
        return None;
    }
    tracing::warn!("⚠️ Block #{} has {} of {} transactions", height, txids.len(), node.txs.len());
    Some(Repair::Missing { height, block_id: stored.id, txs: missing })
}

/// Apply repairs one at a time, in the order the checker found them.
/// A failed repair is retried after `delay` until it succeeds or the run is cancelled.
async fn repair_blocks(
    store: Arc<dyn BlockStore>,
    mut repairs: mpsc::Receiver<Repair>,
    done: mpsc::Sender<u64>,
    delay: Duration,
    cancel: CancellationToken,
) -> u64 {
    let mut retry: VecDeque<Repair> = VecDeque::new();
    let mut repaired = 0u64;
    loop {
        let job = match retry.pop_front() {
            Some(job) => {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
                job
            }
            None => match recv_or_cancel(&mut repairs, &cancel).await {
                Some(job) => job,
                None => break,
            },
        };

        let height = job.height();
        match apply_repair(&store, &job).await {
            Ok(()) => {
                repaired += 1;
                tracing::info!("🔧 Repaired block #{}", height);
                if !send_or_cancel(&done, height, &cancel).await {
                    break;
                }
            }
            Err(e) => {
                tracing::warn!("⚠️ Repair of block #{} failed, retrying: {}", height, e);
                retry.push_back(job);
            }
        }
    }
    repaired
}

async fn apply_repair(store: &Arc<dyn BlockStore>, job: &Repair) -> Result<()> {
    match job {
        Repair::Block(block) => {
            let inserted = store.insert_block(block, true).await?;
            let txs = block.txs.iter().enumerate().map(|(i, tx)| (i as u32, tx.clone())).collect();
            insert_txs(store, inserted.id, txs).await
        }
        Repair::Missing { block_id, txs, .. } => insert_txs(store, *block_id, txs.clone()).await,
    }
}

async fn insert_txs(store: &Arc<dyn BlockStore>, block_id: u64, txs: Vec<(u32, Tx)>) -> Result<()> {
    let mut writes = JoinSet::new();
    for (index, tx) in txs {
        let store = store.clone();
        writes.spawn(async move { store.insert_tx(&tx, Some(index), Some(block_id)).await });
    }
    let mut first_err = None;
    while let Some(result) = writes.join_next().await {
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                first_err.get_or_insert(Error::from(e));
            }
            Err(e) => {
                first_err.get_or_insert(Error::Pipeline(format!("tx repair task failed: {}", e)));
            }
        }
    }
    first_err.map_or(Ok(()), Err)
}
