//! Builders and a scripted chain source shared by the unit tests.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::core::types::*;
use crate::notify::{Notification, NotifyError, Subscriber};
use crate::rpc::{BlockQuery, ChainSource, RpcError};
use crate::store::{BlockStore, MemoryStore, StoreError};

/// Block at `height` with `ntx` transactions; an empty `prev` means no parent
pub fn block(height: u64, hash: &str, prev: &str, ntx: usize) -> Block {
    let txs: Vec<Tx> = (0..ntx).map(|i| tx(&format!("{}-{}", hash, i))).collect();
    Block {
        header: BlockHeader {
            hash: hash.to_string(),
            height,
            time: 1_000 + height as i64 * 600,
            median_time: 1_000 + height as i64 * 600,
            prev_hash: if prev.is_empty() { None } else { Some(prev.to_string()) },
            tx_count: ntx as u64,
            ..Default::default()
        },
        txs,
    }
}

pub fn tx(txid: &str) -> Tx {
    Tx {
        txid: txid.to_string(),
        hash: txid.to_string(),
        version: 1,
        vin: vec![Vin { coinbase: Some("00".into()), sequence: u32::MAX as u64, ..Default::default() }],
        vout: vec![Vout { value: 1.0, n: 0, ..Default::default() }],
        ..Default::default()
    }
}

/// `count` linked blocks from `start`, hashed `{tag}{height}`, two transactions each
pub fn chain(start: u64, count: u64, tag: &str) -> Vec<Block> {
    (start..start + count)
        .map(|h| {
            let prev = if h == 0 { String::new() } else { format!("{}{}", tag, h - 1) };
            block(h, &format!("{}{}", tag, h), &prev, 2)
        })
        .collect()
}

fn not_found(method: &str, arg: impl ToString) -> RpcError {
    RpcError::Node { method: method.into(), arg: arg.to_string(), code: -5, message: "not found".into() }
}

fn unavailable(method: &str) -> RpcError {
    RpcError::Status { method: method.into(), status: 503, body: "scripted failure".into() }
}

/// In-memory node. Tests script its best chain, mempool and failures.
#[derive(Default)]
pub struct FakeChain {
    by_hash: Mutex<HashMap<String, Block>>,
    best: Mutex<BTreeMap<u64, String>>,
    txs: Mutex<HashMap<String, Tx>>,
    mempool: Mutex<Vec<String>>,
    broken_txs: Mutex<HashSet<String>>,
    block_failures: AtomicU32,
    mempool_failures: AtomicU32,
    mempool_calls: AtomicU32,
    tx_calls: AtomicU32,
}

impl FakeChain {
    pub fn new() -> Self { Self::default() }

    pub fn with_blocks(blocks: &[Block]) -> Self {
        let fake = Self::new();
        fake.set_best(blocks);
        fake
    }

    /// Make `blocks` the node's best chain at their heights, replacing whatever was there
    pub fn set_best(&self, blocks: &[Block]) {
        let mut by_hash = self.by_hash.lock().unwrap();
        let mut best = self.best.lock().unwrap();
        let mut txs = self.txs.lock().unwrap();
        for b in blocks {
            best.insert(b.height(), b.hash().to_string());
            by_hash.insert(b.hash().to_string(), b.clone());
            for t in &b.txs {
                txs.insert(t.txid.clone(), t.clone());
            }
        }
    }

    pub fn set_mempool(&self, txids: &[&str]) {
        let mut txs = self.txs.lock().unwrap();
        for txid in txids {
            txs.entry(txid.to_string()).or_insert_with(|| tx(txid));
        }
        *self.mempool.lock().unwrap() = txids.iter().map(|t| t.to_string()).collect();
    }

    /// `getrawtransaction` for this txid always fails
    pub fn break_tx(&self, txid: &str) {
        self.broken_txs.lock().unwrap().insert(txid.to_string());
    }

    pub fn fail_blocks(&self, times: u32) {
        self.block_failures.store(times, Ordering::SeqCst);
    }

    pub fn fail_mempool(&self, times: u32) {
        self.mempool_failures.store(times, Ordering::SeqCst);
    }

    pub fn mempool_calls(&self) -> u32 { self.mempool_calls.load(Ordering::SeqCst) }
    pub fn tx_calls(&self) -> u32 { self.tx_calls.load(Ordering::SeqCst) }

    pub fn height(&self) -> u64 {
        self.best.lock().unwrap().keys().next_back().copied().unwrap_or(0)
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)).is_ok()
    }
}

#[async_trait]
impl ChainSource for FakeChain {
    async fn get_blocks(&self, query: BlockQuery) -> Result<Vec<Block>, RpcError> {
        if Self::take_failure(&self.block_failures) {
            return Err(unavailable("getblock"));
        }
        let by_hash = self.by_hash.lock().unwrap();
        let hashes: Vec<String> = match query {
            BlockQuery::Hashes(hashes) => hashes,
            BlockQuery::Heights(heights) => {
                let best = self.best.lock().unwrap();
                heights.iter()
                    .map(|h| best.get(h).cloned().ok_or_else(|| not_found("getblockhash", h)))
                    .collect::<Result<_, _>>()?
            }
        };
        hashes.iter()
            .map(|h| by_hash.get(h).cloned().ok_or_else(|| not_found("getblock", h)))
            .collect()
    }

    async fn get_chain_info(&self) -> Result<ChainInfo, RpcError> {
        let best = self.best.lock().unwrap();
        let (blocks, hash) = best.iter().next_back()
            .map(|(h, hash)| (*h, hash.clone()))
            .unwrap_or_default();
        Ok(ChainInfo { chain: "test".into(), blocks, headers: blocks, best_block_hash: hash, ..Default::default() })
    }

    async fn get_mempool(&self) -> Result<Vec<String>, RpcError> {
        self.mempool_calls.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.mempool_failures) {
            return Err(unavailable("getrawmempool"));
        }
        Ok(self.mempool.lock().unwrap().clone())
    }

    async fn get_raw_transactions(&self, txids: &[String]) -> Result<Vec<Tx>, RpcError> {
        self.tx_calls.fetch_add(1, Ordering::SeqCst);
        let broken = self.broken_txs.lock().unwrap();
        let txs = self.txs.lock().unwrap();
        txids.iter()
            .map(|id| {
                if broken.contains(id) {
                    return Err(not_found("getrawtransaction", id));
                }
                txs.get(id).cloned().ok_or_else(|| not_found("getrawtransaction", id))
            })
            .collect()
    }

    async fn send_raw_transaction(&self, hex: &str) -> Result<String, RpcError> {
        let txid = format!("sent-{}", hex);
        self.txs.lock().unwrap().insert(txid.clone(), tx(&txid));
        self.mempool.lock().unwrap().push(txid.clone());
        Ok(txid)
    }
}

/// Notification socket fed by the test through the returned sender
pub struct ChannelSubscriber {
    rx: mpsc::Receiver<Notification>,
}

impl ChannelSubscriber {
    pub fn new() -> (Self, mpsc::Sender<Notification>) {
        let (tx, rx) = mpsc::channel(16);
        (ChannelSubscriber { rx }, tx)
    }
}

#[async_trait]
impl Subscriber for ChannelSubscriber {
    async fn connect(&mut self) -> Result<(), NotifyError> {
        Ok(())
    }

    async fn recv(&mut self) -> Result<Notification, NotifyError> {
        match self.rx.recv().await {
            Some(notification) => Ok(notification),
            None => std::future::pending().await,
        }
    }
}

/// Memory store whose next few transaction writes or deletes fail
pub struct FlakyStore {
    inner: Arc<MemoryStore>,
    tx_failures: AtomicU32,
    delete_failures: AtomicU32,
}

impl FlakyStore {
    pub fn new(inner: Arc<MemoryStore>) -> Self {
        FlakyStore { inner, tx_failures: AtomicU32::new(0), delete_failures: AtomicU32::new(0) }
    }

    pub fn fail_deletes(&self, times: u32) {
        self.delete_failures.store(times, Ordering::SeqCst);
    }

    pub fn fail_tx_writes(&self, times: u32) {
        self.tx_failures.store(times, Ordering::SeqCst);
    }
}

#[async_trait]
impl BlockStore for FlakyStore {
    async fn insert_block(&self, block: &Block, recover: bool) -> Result<InsertedBlock, StoreError> {
        self.inner.insert_block(block, recover).await
    }

    async fn insert_tx(&self, tx: &Tx, index: Option<u32>, block_id: Option<u64>) -> Result<(), StoreError> {
        if FakeChain::take_failure(&self.tx_failures) {
            return Err(StoreError::Db("scripted failure".into()));
        }
        self.inner.insert_tx(tx, index, block_id).await
    }

    async fn get_block(&self, at: BlockRef) -> Result<Option<StoredBlock>, StoreError> {
        self.inner.get_block(at).await
    }

    async fn last_block(&self) -> Result<Option<StoredBlock>, StoreError> {
        self.inner.last_block().await
    }

    async fn first_block(&self) -> Result<Option<StoredBlock>, StoreError> {
        self.inner.first_block().await
    }

    async fn block_txids(&self, block_id: u64) -> Result<Vec<String>, StoreError> {
        self.inner.block_txids(block_id).await
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.inner.set(key, value).await
    }

    async fn orphan_count(&self) -> Result<u64, StoreError> {
        self.inner.orphan_count().await
    }

    async fn delete_orphans(&self) -> Result<u64, StoreError> {
        self.inner.delete_orphans().await
    }

    async fn delete_invalid_txs(&self, ids: &[u64]) -> Result<u64, StoreError> {
        if FakeChain::take_failure(&self.delete_failures) {
            return Err(StoreError::Db("scripted failure".into()));
        }
        self.inner.delete_invalid_txs(ids).await
    }

    async fn pending_txs(&self, from_id: u64) -> Result<Vec<PendingTx>, StoreError> {
        self.inner.pending_txs(from_id).await
    }

    async fn tx_at_block_time(&self, timestamp: i64) -> Result<Option<u64>, StoreError> {
        self.inner.tx_at_block_time(timestamp).await
    }
}
