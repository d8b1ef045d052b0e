use rand::Rng;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::ValidateOptions;
use crate::core::params::{DELETE_BATCH_SIZE, MEMPOOL_SAMPLES, PENDING_WINDOW_DAYS};
use crate::core::types::PendingTx;
use crate::error::{Error, Result};
use crate::rpc::ChainSource;
use crate::store::{BlockStore, CURSOR_VALIDATED_TX};
use crate::sync::pipeline::WorkQueue;

const SECS_PER_DAY: i64 = 86_400;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxReport {
    /// Pending transactions checked
    pub pending: usize,
    /// Distinct txids seen across all mempool samples
    pub mempool: usize,
    pub deleted: u64,
    pub failed_batches: u64,
    /// `validatedTransaction` after the run
    pub cursor: Option<u64>,
}

/// Deletes pending transactions that dropped out of the node's mempool without being mined.
pub struct TxValidator {
    store: Arc<dyn BlockStore>,
    source: Arc<dyn ChainSource>,
    options: ValidateOptions,
}

impl TxValidator {
    pub fn new(store: Arc<dyn BlockStore>, source: Arc<dyn ChainSource>, options: ValidateOptions) -> Self {
        TxValidator { store, source, options }
    }

    pub async fn run(&self, parent: &CancellationToken) -> Result<TxReport> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or_default();
        self.run_at(parent, now).await
    }

    /// One validation pass with `now` (unix seconds) as the end of the trailing window
    pub async fn run_at(&self, parent: &CancellationToken, now: i64) -> Result<TxReport> {
        let saved = self.store.get(CURSOR_VALIDATED_TX).await?.and_then(|v| v.parse::<u64>().ok());
        let from = saved.unwrap_or_else(|| {
            tracing::warn!("⚠️ No {} cursor, checking every pending transaction", CURSOR_VALIDATED_TX);
            0
        });

        // pending rows are read before the mempool so a tx that arrives in between is never judged
        let pending = self.store.pending_txs(from).await?;
        let mut report = TxReport { pending: pending.len(), cursor: saved, ..Default::default() };
        if pending.is_empty() {
            tracing::info!("✅ No pending transactions from id {}", from);
        } else {
            tracing::info!("🔎 Checking {} pending transaction(s) from id {}", pending.len(), from);
            let mempool = self.sample_mempool(parent).await?;
            if parent.is_cancelled() {
                return Ok(report);
            }
            report.mempool = mempool.len();

            let invalid: Vec<u64> = pending.iter()
                .filter(|tx| !mempool.contains(&tx.txid))
                .map(|tx: &PendingTx| tx.id)
                .collect();
            tracing::info!("🧹 {} of {} pending transaction(s) left the mempool unmined", invalid.len(), pending.len());
            let (deleted, failed) = self.delete(invalid, parent).await;
            report.deleted = deleted;
            report.failed_batches = failed;
        }

        report.cursor = self.advance_cursor(saved, now - PENDING_WINDOW_DAYS * SECS_PER_DAY).await?;
        tracing::info!("✅ Transaction validation done: {} deleted, {} failed batch(es)", report.deleted, report.failed_batches);
        Ok(report)
    }

    /// Union of `MEMPOOL_SAMPLES` concurrent mempool snapshots. Any failed sample fails the run,
    /// since a partial view would delete live transactions.
    async fn sample_mempool(&self, cancel: &CancellationToken) -> Result<HashSet<String>> {
        let seen = Arc::new(Mutex::new(HashSet::new()));
        let jitter_ms = self.options.sample_jitter.as_millis() as u64;
        let mut samples = JoinSet::new();
        for sample in 0..MEMPOOL_SAMPLES {
            let (source, seen, cancel) = (self.source.clone(), seen.clone(), cancel.clone());
            let delay = rand::thread_rng().gen_range(0..=jitter_ms);
            samples.spawn(async move {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(std::time::Duration::from_millis(delay)) => {}
                }
                let txids = source.get_mempool().await
                    .map_err(|e| Error::stage(format!("mempool sample {}", sample), e))?;
                let mut seen = seen.lock().map_err(|_| Error::Pipeline("mempool set poisoned".into()))?;
                seen.extend(txids);
                Ok::<(), Error>(())
            });
        }

        let mut first_err = None;
        while let Some(result) = samples.join_next().await {
            let result = result.map_err(|e| Error::Pipeline(format!("mempool sample task failed: {}", e)));
            if let Err(e) = result.and_then(|r| r) {
                if first_err.is_none() {
                    samples.abort_all();
                    first_err = Some(e);
                }
            }
        }
        if let Some(err) = first_err {
            return Err(err);
        }
        let seen = seen.lock().map_err(|_| Error::Pipeline("mempool set poisoned".into()))?;
        tracing::debug!("Mempool union holds {} txid(s)", seen.len());
        Ok(seen.clone())
    }

    /// Delete `ids` in small batches across the db worker pool. A failed batch is logged and skipped.
    async fn delete(&self, ids: Vec<u64>, cancel: &CancellationToken) -> (u64, u64) {
        if ids.is_empty() {
            return (0, 0);
        }
        let (batch_tx, batch_rx) = mpsc::channel(ids.len().div_ceil(DELETE_BATCH_SIZE));
        for chunk in ids.chunks(DELETE_BATCH_SIZE) {
            // capacity covers every chunk
            let _ = batch_tx.try_send(chunk.to_vec());
        }
        drop(batch_tx);

        let batches = WorkQueue::new(batch_rx);
        let mut workers = JoinSet::new();
        for _ in 0..self.options.db_threads.max(1) {
            let (store, batches, cancel) = (self.store.clone(), batches.clone(), cancel.clone());
            workers.spawn(async move {
                let (mut deleted, mut failed) = (0u64, 0u64);
                while let Some(batch) = batches.next(&cancel).await {
                    match store.delete_invalid_txs(&batch).await {
                        Ok(n) => deleted += n,
                        Err(e) => {
                            failed += 1;
                            tracing::warn!("⚠️ Deleting transaction(s) {:?} failed: {}", batch, e);
                        }
                    }
                }
                (deleted, failed)
            });
        }

        let (mut deleted, mut failed) = (0u64, 0u64);
        while let Some(result) = workers.join_next().await {
            match result {
                Ok((d, f)) => {
                    deleted += d;
                    failed += f;
                }
                Err(e) => tracing::error!("❌ Delete worker failed: {}", e),
            }
        }
        (deleted, failed)
    }

    /// Move the cursor to the first transaction mined at or after `cutoff`, never backwards
    async fn advance_cursor(&self, current: Option<u64>, cutoff: i64) -> Result<Option<u64>> {
        let Some(candidate) = self.store.tx_at_block_time(cutoff).await? else {
            tracing::debug!("No block mined since {}, {} unchanged", cutoff, CURSOR_VALIDATED_TX);
            return Ok(current);
        };
        if current.is_some_and(|c| candidate <= c) {
            return Ok(current);
        }
        self.store.set(CURSOR_VALIDATED_TX, &candidate.to_string()).await?;
        tracing::info!("{} cursor now {}", CURSOR_VALIDATED_TX, candidate);
        Ok(Some(candidate))
    }
}
