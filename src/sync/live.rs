use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::pipeline::{recv_or_cancel, send_or_cancel, Fatal, WorkQueue};
use super::*;
use crate::core::params::{MAX_MEMPOOL_FAILS, MEMPOOL_QUEUE_CAPACITY, MEMPOOL_RESCAN_INTERVAL, STAGE_CHANNEL_CAPACITY};
use crate::core::types::MempoolTx;
use crate::error::Result;
use crate::notify::{NotificationListener, NotificationSinks, Subscriber};
use crate::rpc::BlockQuery;

impl Indexer {
    /// Follow the node until cancelled: new blocks through the tip follower, mempool
    /// transactions through the scanner and resolver pool. Returns the first fatal error.
    pub async fn follow<S: Subscriber + 'static>(&self, subscriber: S, parent: &CancellationToken) -> Result<()> {
        let cancel = parent.child_token();
        let (fatal, fatal_rx) = Fatal::new(cancel.clone());
        let resolvers = self.options.rpc_threads.max(1);

        let (tip_tx, tip_rx) = mpsc::channel(1);
        let (rescan_tx, rescan_rx) = mpsc::channel(1);
        let (mempool_tx, mempool_rx) = mpsc::channel(MEMPOOL_QUEUE_CAPACITY);
        let (block_tx, block_rx) = mpsc::channel(STAGE_CHANNEL_CAPACITY);
        let (job_tx, job_rx) = mpsc::channel(STAGE_CHANNEL_CAPACITY);

        let mut tasks = JoinSet::new();

        let sinks = NotificationSinks { tip: tip_tx.clone(), mempool: mempool_tx.clone(), rescan: rescan_tx };
        let listener = NotificationListener::new(subscriber, sinks);
        {
            let (fatal, cancel) = (fatal.clone(), cancel.clone());
            tasks.spawn(async move {
                if let Err(e) = listener.run(cancel).await {
                    fatal.report(Error::stage("notification listener", e));
                }
            });
        }

        tasks.spawn(scan_mempool(self.source.clone(), rescan_rx, mempool_tx.clone(), fatal.clone()));
        let queue = WorkQueue::new(mempool_rx);
        for _ in 0..resolvers {
            tasks.spawn(resolve_mempool(
                self.source.clone(), queue.clone(), mempool_tx.clone(), job_tx.clone(), fatal.clone(),
            ));
        }
        drop(mempool_tx);

        tasks.spawn(follow_tip(self.store.clone(), self.source.clone(), self.batch(), tip_rx, block_tx, fatal.clone()));
        let _ = tip_tx.try_send(());

        let mode = WriteMode::Live { tip: tip_tx, monitor: self.monitor.clone() };
        {
            let (store, fatal) = (self.store.clone(), fatal.clone());
            tasks.spawn(async move {
                write_blocks(store, false, mode, block_rx, job_tx, fatal).await;
            });
        }
        spawn_tx_writers(&mut tasks, self.store.clone(), WorkQueue::new(job_rx), self.options.db_threads, fatal.clone());

        tracing::info!("👀 Following the chain tip");
        join_all(&mut tasks, &fatal).await;

        match fatal_rx.take() {
            Some(err) => Err(err),
            None => {
                tracing::info!("Tip following stopped");
                Ok(())
            }
        }
    }
}

/// Full mempool listing at startup, every `MEMPOOL_RESCAN_INTERVAL` and on request
async fn scan_mempool(
    source: Arc<dyn ChainSource>,
    mut rescan: mpsc::Receiver<()>,
    queue: mpsc::Sender<MempoolTx>,
    fatal: Fatal,
) {
    let cancel = fatal.cancel().clone();
    let mut ticker = tokio::time::interval(MEMPOOL_RESCAN_INTERVAL);
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
            Some(()) = rescan.recv() => {}
        }
        let txids = match source.get_mempool().await {
            Ok(txids) => txids,
            Err(e) => {
                fatal.report(Error::stage("mempool scan", e));
                return;
            }
        };
        tracing::info!("🔍 Mempool scan found {} transaction(s)", txids.len());
        for txid in txids {
            if !send_or_cancel(&queue, MempoolTx::new(txid), &cancel).await {
                return;
            }
        }
    }
}

/// Resolve mempool hashes to transactions. A failed fetch goes back on the queue
/// until it has failed `MAX_MEMPOOL_FAILS` times.
async fn resolve_mempool(
    source: Arc<dyn ChainSource>,
    queue: WorkQueue<MempoolTx>,
    requeue: mpsc::Sender<MempoolTx>,
    jobs: mpsc::Sender<TxJob>,
    fatal: Fatal,
) {
    let cancel = fatal.cancel().clone();
    while let Some(item) = queue.next(&cancel).await {
        let reason = match source.get_raw_transactions(std::slice::from_ref(&item.hash)).await {
            Ok(txs) => match txs.into_iter().next() {
                Some(tx) => {
                    let job = TxJob { tx, index: None, block_id: None };
                    if !send_or_cancel(&jobs, job, &cancel).await {
                        return;
                    }
                    continue;
                }
                None => "empty result".to_string(),
            },
            Err(e) => e.to_string(),
        };

        let retry = MempoolTx { hash: item.hash, fails: item.fails + 1 };
        if retry.fails >= MAX_MEMPOOL_FAILS {
            tracing::warn!("⚠️ Dropping mempool tx {} after {} failed fetches: {}", short_hash(&retry.hash), retry.fails, reason);
            continue;
        }
        tracing::debug!("Mempool tx {} fetch failed ({}), requeued", short_hash(&retry.hash), reason);
        if let Err(e) = requeue.try_send(retry) {
            tracing::warn!("⚠️ Mempool queue full, dropping {}", short_hash(&e.into_inner().hash));
        }
    }
}

/// On every signal, walk from the store's canonical tip to the node's height and
/// hand each block to the writer in ascending order.
async fn follow_tip(
    store: Arc<dyn BlockStore>,
    source: Arc<dyn ChainSource>,
    batch: u64,
    mut signals: mpsc::Receiver<()>,
    out: mpsc::Sender<Block>,
    fatal: Fatal,
) {
    let cancel = fatal.cancel().clone();
    while recv_or_cancel(&mut signals, &cancel).await.is_some() {
        if let Err(e) = check_tip(store.as_ref(), source.as_ref(), batch, &out, &cancel).await {
            fatal.report(Error::stage("tip follower", e));
            return;
        }
    }
}

async fn check_tip(
    store: &dyn BlockStore,
    source: &dyn ChainSource,
    batch: u64,
    out: &mpsc::Sender<Block>,
    cancel: &CancellationToken,
) -> Result<()> {
    let node = source.get_chain_info().await?.blocks;
    let from = store.last_block().await?.map(|b| b.height()).unwrap_or(node);
    if from > node {
        return Ok(());
    }
    tracing::debug!("Checking tip: store #{}, node #{}", from, node);

    let mut next = from;
    while next <= node {
        let last = next.saturating_add(batch - 1).min(node);
        for block in source.get_blocks(BlockQuery::Heights((next..=last).collect())).await? {
            if !send_or_cancel(out, block, cancel).await {
                return Ok(());
            }
        }
        next = last + 1;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::BlockRef;
    use crate::notify::{Notification, Topic};
    use crate::store::MemoryStore;
    use crate::testutil::{chain, ChannelSubscriber, FakeChain};
    use std::time::Duration;

    fn options() -> IndexOptions {
        IndexOptions { sync: true, batch: 4, rpc_threads: 2, db_threads: 2, ..Default::default() }
    }

    async fn wait_for<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..500 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_live_converges_on_reorg() {
        let store = Arc::new(MemoryStore::new());
        let main = chain(0, 13, "a");
        for b in &main {
            store.insert_block(b, false).await.unwrap();
        }
        // the node switched to a branch forking after a10
        let mut fork = chain(11, 3, "b");
        fork[0].header.prev_hash = Some("a10".into());
        let source = Arc::new(FakeChain::with_blocks(&main));
        source.set_best(&fork);

        let (subscriber, _notes) = ChannelSubscriber::new();
        let indexer = Arc::new(Indexer::new(store.clone(), source, options()));
        let cancel = CancellationToken::new();
        let handle = {
            let (indexer, cancel) = (indexer.clone(), cancel.clone());
            tokio::spawn(async move { indexer.follow(subscriber, &cancel).await })
        };

        wait_for(|| {
            let store = store.clone();
            async move {
                store.last_block().await.unwrap().map(|b| b.hash().to_string()) == Some("b13".to_string())
            }
        }).await;

        for (h, hash) in [(10, "a10"), (11, "b11"), (12, "b12"), (13, "b13")] {
            let b = store.get_block(BlockRef::ByHeight(h)).await.unwrap().unwrap();
            assert_eq!(b.hash(), hash);
        }
        assert!(store.get_block(BlockRef::ByHash("a12".into())).await.unwrap().unwrap().is_orphan);

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_block_notification_triggers_tip_check() {
        let store = Arc::new(MemoryStore::new());
        let blocks = chain(0, 8, "a");
        for b in &blocks[..5] {
            store.insert_block(b, false).await.unwrap();
        }
        let source = Arc::new(FakeChain::with_blocks(&blocks[..5]));
        let (subscriber, notes) = ChannelSubscriber::new();
        let indexer = Arc::new(Indexer::new(store.clone(), source.clone(), options()));
        let cancel = CancellationToken::new();
        let handle = {
            let (indexer, cancel) = (indexer.clone(), cancel.clone());
            tokio::spawn(async move { indexer.follow(subscriber, &cancel).await })
        };

        source.set_best(&blocks[5..]);
        notes.send(Notification { topic: Topic::HashBlock, hash: "a7".into(), sequence: Some(1) }).await.unwrap();
        wait_for(|| {
            let store = store.clone();
            async move { store.last_block().await.unwrap().map(|b| b.height()) == Some(7) }
        }).await;

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_mempool_failures_dropped_after_limit() {
        let store = Arc::new(MemoryStore::new());
        let blocks = chain(0, 2, "a");
        for b in &blocks {
            store.insert_block(b, false).await.unwrap();
        }
        let source = Arc::new(FakeChain::with_blocks(&blocks));
        source.set_mempool(&["m1", "m2", "bad"]);
        source.break_tx("bad");

        let (subscriber, _notes) = ChannelSubscriber::new();
        let indexer = Arc::new(Indexer::new(store.clone(), source.clone(), options()));
        let cancel = CancellationToken::new();
        let handle = {
            let (indexer, cancel) = (indexer.clone(), cancel.clone());
            tokio::spawn(async move { indexer.follow(subscriber, &cancel).await })
        };

        wait_for(|| {
            let source = source.clone();
            async move { source.tx_calls() >= 2 + MAX_MEMPOOL_FAILS }
        }).await;
        wait_for(|| {
            let store = store.clone();
            async move { store.pending_txs(0).await.unwrap().len() == 2 }
        }).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(source.tx_calls(), 2 + MAX_MEMPOOL_FAILS);
        assert!(store.ledger().tx_by_txid("bad").unwrap().is_none());

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_fatal_error_stops_live_mode() {
        let store = Arc::new(MemoryStore::new());
        let source = Arc::new(FakeChain::with_blocks(&chain(0, 3, "a")));
        source.fail_mempool(u32::MAX);
        let (subscriber, _notes) = ChannelSubscriber::new();
        let indexer = Indexer::new(store, source, options());

        let parent = CancellationToken::new();
        let result = tokio::time::timeout(Duration::from_secs(5), indexer.follow(subscriber, &parent))
            .await
            .expect("live mode did not stop after a fatal error");
        assert!(result.unwrap_err().to_string().contains("mempool scan"));
        assert!(!parent.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_follow_does_no_work() {
        let store = Arc::new(MemoryStore::new());
        let blocks = chain(0, 8, "a");
        for b in &blocks[..5] {
            store.insert_block(b, false).await.unwrap();
        }
        let source = Arc::new(FakeChain::with_blocks(&blocks));
        source.set_mempool(&["m1"]);
        let (subscriber, _notes) = ChannelSubscriber::new();
        let indexer = Indexer::new(store.clone(), source.clone(), options());

        let cancel = CancellationToken::new();
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), indexer.follow(subscriber, &cancel))
            .await
            .expect("cancelled live mode did not return")
            .unwrap();
        assert_eq!(store.last_block().await.unwrap().map(|b| b.height()), Some(4));
        assert_eq!(source.mempool_calls(), 0);
        assert_eq!(source.tx_calls(), 0);
    }

    #[tokio::test]
    async fn test_cancel_stops_follow_writes() {
        let store = Arc::new(MemoryStore::new());
        let blocks = chain(0, 20, "a");
        let source = Arc::new(FakeChain::with_blocks(&blocks[..5]));
        for b in &blocks[..5] {
            store.insert_block(b, false).await.unwrap();
        }
        let (subscriber, notes) = ChannelSubscriber::new();
        let indexer = Arc::new(Indexer::new(store.clone(), source.clone(), options()));
        let cancel = CancellationToken::new();
        let handle = {
            let (indexer, cancel) = (indexer.clone(), cancel.clone());
            tokio::spawn(async move { indexer.follow(subscriber, &cancel).await })
        };
        wait_for(|| {
            let source = source.clone();
            async move { source.mempool_calls() >= 1 }
        }).await;

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("live mode did not stop after cancel")
            .unwrap()
            .unwrap();

        // a new tip after shutdown is not picked up
        source.set_best(&blocks[5..]);
        let _ = notes.send(Notification { topic: Topic::HashBlock, hash: "a19".into(), sequence: Some(2) }).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.last_block().await.unwrap().map(|b| b.height()), Some(4));
    }
}
