use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::order::Orderer;
use super::pipeline::{recv_or_cancel, send_or_cancel, Fatal, WorkQueue};
use super::*;
use crate::core::params::STAGE_CHANNEL_CAPACITY;
use crate::error::Result;
use crate::rpc::{BlockQuery, RpcError};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackfillReport {
    pub start: u64,
    pub end: u64,
    pub blocks: u64,
}

impl Indexer {
    /// Heights to backfill, or `None` when the store is already there
    pub async fn resolve_range(&self) -> Result<Option<(u64, u64)>> {
        let node = self.source.get_chain_info().await?.blocks;
        let (start, end) = if self.options.sync {
            let last = self.store.last_block().await?.map(|b| b.height()).unwrap_or(0);
            (self.options.start.unwrap_or(last), node)
        } else {
            (self.options.start.unwrap_or(0), self.options.end.unwrap_or(node))
        };
        Ok((start <= end).then_some((start, end)))
    }

    /// Fetch, order and write every block in the resolved range.
    /// Returns once the transaction writers have drained.
    pub async fn backfill(&self, parent: &CancellationToken) -> Result<BackfillReport> {
        let Some((start, end)) = self.resolve_range().await? else {
            tracing::info!("✅ Nothing to backfill");
            return Ok(BackfillReport::default());
        };
        tracing::info!("📥 Backfilling blocks #{}..=#{} in batches of {}", start, end, self.batch());

        let cancel = parent.child_token();
        let (fatal, fatal_rx) = Fatal::new(cancel.clone());
        let fetchers = self.options.rpc_threads.max(1);

        let (height_tx, height_rx) = mpsc::channel(fetchers * 2);
        let (fetched_tx, fetched_rx) = mpsc::channel(STAGE_CHANNEL_CAPACITY);
        let (block_tx, block_rx) = mpsc::channel(STAGE_CHANNEL_CAPACITY);
        let (job_tx, job_rx) = mpsc::channel(STAGE_CHANNEL_CAPACITY);

        let mut tasks = JoinSet::new();
        tasks.spawn(produce_heights(
            self.source.clone(), start, end, self.batch(), self.options.sync, height_tx, fatal.clone(),
        ));
        let heights = WorkQueue::new(height_rx);
        for _ in 0..fetchers {
            tasks.spawn(fetch_blocks(self.source.clone(), heights.clone(), fetched_tx.clone(), fatal.clone()));
        }
        drop(fetched_tx);
        tasks.spawn(order_blocks(start, fetched_rx, block_tx, fatal.clone()));
        let writer = tokio::spawn(write_blocks(
            self.store.clone(), self.options.recover, WriteMode::Backfill, block_rx, job_tx, fatal.clone(),
        ));
        spawn_tx_writers(&mut tasks, self.store.clone(), WorkQueue::new(job_rx), self.options.db_threads, fatal.clone());

        let blocks = match writer.await {
            Ok(n) => n,
            Err(e) => {
                fatal.report(Error::Pipeline(format!("block writer failed: {}", e)));
                0
            }
        };
        join_all(&mut tasks, &fatal).await;

        if let Some(err) = fatal_rx.take() {
            return Err(err);
        }
        if parent.is_cancelled() {
            tracing::info!("Backfill interrupted after {} block(s)", blocks);
        } else {
            tracing::info!("✅ Backfilled {} block(s), #{}..=#{}", blocks, start, end);
        }
        Ok(BackfillReport { start, end, blocks })
    }
}

/// Emit ascending height batches. With `follow_tip`, the node height is re-read
/// once the range is exhausted so a long backfill does not stop short of a moving tip.
pub(crate) async fn produce_heights(
    source: Arc<dyn ChainSource>,
    start: u64,
    mut end: u64,
    batch: u64,
    follow_tip: bool,
    out: mpsc::Sender<Vec<u64>>,
    fatal: Fatal,
) {
    let cancel = fatal.cancel().clone();
    let mut next = start;
    loop {
        if next > end {
            if !follow_tip {
                return;
            }
            match source.get_chain_info().await {
                Ok(info) if info.blocks > end => {
                    tracing::info!("📥 Node moved to #{}, extending backfill", info.blocks);
                    end = info.blocks;
                }
                Ok(_) => return,
                Err(e) => {
                    fatal.report(Error::stage("height producer", e));
                    return;
                }
            }
        }
        let last = next.saturating_add(batch - 1).min(end);
        if !send_or_cancel(&out, (next..=last).collect(), &cancel).await {
            return;
        }
        next = last + 1;
    }
}

pub(crate) async fn fetch_blocks(
    source: Arc<dyn ChainSource>,
    heights: WorkQueue<Vec<u64>>,
    out: mpsc::Sender<Vec<Block>>,
    fatal: Fatal,
) {
    let cancel = fatal.cancel().clone();
    while let Some(batch) = heights.next(&cancel).await {
        let (first, last, expected) = match (batch.first(), batch.last()) {
            (Some(&first), Some(&last)) => (first, last, batch.len()),
            _ => continue,
        };
        let stage = format!("block fetch #{}..=#{}", first, last);
        match source.get_blocks(BlockQuery::Heights(batch)).await {
            Ok(blocks) if blocks.len() == expected => {
                if !send_or_cancel(&out, blocks, &cancel).await {
                    return;
                }
            }
            Ok(blocks) => {
                let err = RpcError::Mismatch { method: "getblock".into(), expected, got: blocks.len() };
                fatal.report(Error::stage(stage, err));
                return;
            }
            Err(e) => {
                fatal.report(Error::stage(stage, e));
                return;
            }
        }
    }
}

async fn order_blocks(
    start: u64,
    mut fetched: mpsc::Receiver<Vec<Block>>,
    out: mpsc::Sender<Block>,
    fatal: Fatal,
) {
    let cancel = fatal.cancel().clone();
    let mut orderer = Orderer::new(start);
    while let Some(batch) = recv_or_cancel(&mut fetched, &cancel).await {
        for block in batch {
            for ready in orderer.push(block) {
                if !send_or_cancel(&out, ready, &cancel).await {
                    return;
                }
            }
        }
    }
    if !cancel.is_cancelled() && orderer.buffered() > 0 {
        fatal.report(Error::Pipeline(format!(
            "{} fetched block(s) never became contiguous, still waiting for #{}",
            orderer.buffered(),
            orderer.next_height()
        )));
    }
}
