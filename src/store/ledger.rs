use serde::{de::DeserializeOwned, Serialize};
use std::sync::Mutex;

use super::reorg::{self, ChainRows};
use super::table::{Table, WriteBatch};
use super::StoreError;
use crate::core::types::*;

/// Key prefixes. Numbers are big-endian so prefix scans come back in numeric order.
const PREFIX_BLOCK: &[u8] = b"blk:"; // blk:<id> -> StoredBlock
const PREFIX_BLOCK_HASH: &[u8] = b"bhs:"; // bhs:<hash> -> id
const PREFIX_BLOCK_HEIGHT: &[u8] = b"bht:"; // bht:<height><id> -> ()
const PREFIX_CANONICAL: &[u8] = b"can:"; // can:<height> -> id
const PREFIX_ORPHAN: &[u8] = b"orp:"; // orp:<id> -> ()
const PREFIX_TX: &[u8] = b"tx:"; // tx:<id> -> StoredTx
const PREFIX_TXID: &[u8] = b"txi:"; // txi:<txid> -> id
const PREFIX_BLOCK_TX: &[u8] = b"btx:"; // btx:<block id><tx id> -> ()
const PREFIX_PENDING: &[u8] = b"pnd:"; // pnd:<tx id> -> ()
const PREFIX_META: &[u8] = b"meta:";
const SEQ_BLOCK: &[u8] = b"seq:block";
const SEQ_TX: &[u8] = b"seq:tx";

/// Synchronous store logic over an ordered key-value table.
///
/// Mutations hold `write_lock` from the first read to the batch apply, which is
/// what keeps two inserts at the same height from both seeing a stale tip.
pub struct Ledger<T: Table> {
    table: T,
    write_lock: Mutex<()>,
    max_reorg_depth: u64,
}

impl<T: Table> Ledger<T> {
    pub fn new(table: T, max_reorg_depth: u64) -> Self {
        Ledger { table, write_lock: Mutex::new(()), max_reorg_depth }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ()>, StoreError> {
        self.write_lock.lock().map_err(|_| StoreError::Corrupt("write lock poisoned".into()))
    }

    // ─── Blocks ──────────────────────────────────────────────────────

    pub fn insert_block(&self, header: &BlockHeader, recover: bool) -> Result<InsertedBlock, StoreError> {
        let _guard = self.lock()?;
        let plan = reorg::plan_insert(self, header, recover, self.max_reorg_depth)?;

        let mut batch = WriteBatch::default();
        for row in &plan.rows {
            batch.put(prefixed_key(PREFIX_BLOCK, &row.id.to_be_bytes()), encode(row)?);
            let orphan_key = prefixed_key(PREFIX_ORPHAN, &row.id.to_be_bytes());
            if row.is_orphan {
                batch.put(orphan_key, Vec::new());
            } else {
                batch.remove(orphan_key);
            }
        }
        if plan.is_new {
            batch.put(prefixed_key(PREFIX_BLOCK_HASH, header.hash.as_bytes()), plan.id.to_be_bytes().to_vec());
            batch.put(height_key(header.height, plan.id), Vec::new());
            batch.put(SEQ_BLOCK.to_vec(), (plan.id + 1).to_be_bytes().to_vec());
        }
        for (height, entry) in &plan.canonical {
            let key = prefixed_key(PREFIX_CANONICAL, &height.to_be_bytes());
            match entry {
                Some(id) => batch.put(key, id.to_be_bytes().to_vec()),
                None => batch.remove(key),
            }
        }
        self.table.apply(batch)?;

        if plan.orphaned > 0 {
            tracing::info!("🔄 Reorg at height {}: {} blocks orphaned, {} adopted, tip now {}",
                header.height, plan.orphaned, plan.adopted, short_hash(&header.hash));
        } else if plan.adopted > 1 {
            tracing::info!("🔗 Block {} filled a gap, {} blocks joined the canonical chain",
                header.height, plan.adopted);
        } else if plan.is_orphan {
            tracing::debug!(height = header.height, hash = %header.hash, "recorded non-canonical block");
        }

        Ok(InsertedBlock { id: plan.id, is_orphan: plan.is_orphan })
    }

    fn block_by_id(&self, id: u64) -> Result<Option<StoredBlock>, StoreError> {
        self.load(&prefixed_key(PREFIX_BLOCK, &id.to_be_bytes()))
    }

    pub fn get_block(&self, at: &BlockRef) -> Result<Option<StoredBlock>, StoreError> {
        match at {
            BlockRef::ByHeight(height) => self.canonical_at(*height),
            BlockRef::ByHash(hash) => self.block_by_hash(hash),
        }
    }

    pub fn last_block(&self) -> Result<Option<StoredBlock>, StoreError> {
        match self.table.last_with_prefix(PREFIX_CANONICAL)? {
            Some((_, id)) => self.block_by_id(decode_u64(&id)?),
            None => Ok(None),
        }
    }

    /// Lowest canonical block
    pub fn first_block(&self) -> Result<Option<StoredBlock>, StoreError> {
        match self.table.first_with_prefix(PREFIX_CANONICAL)? {
            Some((_, id)) => self.block_by_id(decode_u64(&id)?),
            None => Ok(None),
        }
    }

    pub fn blocks_at_height(&self, height: u64) -> Result<Vec<StoredBlock>, StoreError> {
        self.blocks_at(height)
    }

    pub fn orphan_count(&self) -> Result<u64, StoreError> {
        Ok(self.table.scan_prefix(PREFIX_ORPHAN)?.len() as u64)
    }

    /// Remove every orphaned block together with the transactions still attached to it
    pub fn delete_orphans(&self) -> Result<u64, StoreError> {
        let _guard = self.lock()?;
        let mut batch = WriteBatch::default();
        let mut deleted = 0u64;
        for (key, _) in self.table.scan_prefix(PREFIX_ORPHAN)? {
            let id = decode_u64(&key[PREFIX_ORPHAN.len()..])?;
            batch.remove(key);
            let Some(block) = self.block_by_id(id)? else { continue };
            batch.remove(prefixed_key(PREFIX_BLOCK, &id.to_be_bytes()));
            batch.remove(prefixed_key(PREFIX_BLOCK_HASH, block.hash().as_bytes()));
            batch.remove(height_key(block.height(), id));
            for (link, _) in self.table.scan_prefix(&prefixed_key(PREFIX_BLOCK_TX, &id.to_be_bytes()))? {
                let tx_id = decode_u64(&link[PREFIX_BLOCK_TX.len() + 8..])?;
                batch.remove(link);
                if let Some(tx) = self.tx_by_id(tx_id)? {
                    if tx.block_id == Some(id) {
                        remove_tx(&mut batch, &tx);
                    }
                }
            }
            deleted += 1;
        }
        self.table.apply(batch)?;
        Ok(deleted)
    }

    /// First canonical block whose median time is at or after `timestamp`, then the
    /// smallest transaction id recorded in it (or in the next block that has any).
    pub fn tx_at_block_time(&self, timestamp: i64) -> Result<Option<u64>, StoreError> {
        let Some((base, tip)) = self.canonical_range()? else { return Ok(None) };
        // median time never decreases along the canonical chain
        let (mut lo, mut hi) = (base, tip + 1);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.require_canonical(mid)?.header.median_time >= timestamp {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }
        for height in lo..=tip {
            let block = self.require_canonical(height)?;
            let first = self.table.first_with_prefix(&prefixed_key(PREFIX_BLOCK_TX, &block.id.to_be_bytes()))?;
            if let Some((link, _)) = first {
                return Ok(Some(decode_u64(&link[PREFIX_BLOCK_TX.len() + 8..])?));
            }
        }
        Ok(None)
    }

    fn require_canonical(&self, height: u64) -> Result<StoredBlock, StoreError> {
        self.canonical_at(height)?
            .ok_or_else(|| StoreError::Corrupt(format!("canonical chain has a hole at {}", height)))
    }

    // ─── Transactions ────────────────────────────────────────────────

    pub fn insert_tx(&self, tx: &Tx, index: Option<u32>, block_id: Option<u64>) -> Result<(), StoreError> {
        let _guard = self.lock()?;
        let mut batch = WriteBatch::default();

        let existing = match self.table.get(&prefixed_key(PREFIX_TXID, tx.txid.as_bytes()))? {
            Some(id) => self.tx_by_id(decode_u64(&id)?)?,
            None => None,
        };
        let id = match &existing {
            Some(row) => row.id,
            None => {
                let id = self.next_id(SEQ_TX)?;
                batch.put(SEQ_TX.to_vec(), (id + 1).to_be_bytes().to_vec());
                batch.put(prefixed_key(PREFIX_TXID, tx.txid.as_bytes()), id.to_be_bytes().to_vec());
                id
            }
        };

        // A mined row is never turned back into a pending one by a late mempool sighting
        let (block_id, index) = match (&existing, block_id) {
            (Some(row), None) if row.block_id.is_some() => (row.block_id, row.index),
            _ => (block_id, index),
        };
        if let Some(prev_block) = existing.as_ref().and_then(|row| row.block_id) {
            if Some(prev_block) != block_id {
                batch.remove(block_tx_key(prev_block, id));
            }
        }

        let row = StoredTx::from_tx(id, tx, index, block_id);
        batch.put(prefixed_key(PREFIX_TX, &id.to_be_bytes()), encode(&row)?);
        let pending_key = prefixed_key(PREFIX_PENDING, &id.to_be_bytes());
        match block_id {
            Some(block_id) => {
                batch.put(block_tx_key(block_id, id), Vec::new());
                batch.remove(pending_key);
            }
            None => batch.put(pending_key, Vec::new()),
        }
        self.table.apply(batch)
    }

    pub fn tx_by_id(&self, id: u64) -> Result<Option<StoredTx>, StoreError> {
        self.load(&prefixed_key(PREFIX_TX, &id.to_be_bytes()))
    }

    pub fn tx_by_txid(&self, txid: &str) -> Result<Option<StoredTx>, StoreError> {
        match self.table.get(&prefixed_key(PREFIX_TXID, txid.as_bytes()))? {
            Some(id) => self.tx_by_id(decode_u64(&id)?),
            None => Ok(None),
        }
    }

    pub fn block_txids(&self, block_id: u64) -> Result<Vec<String>, StoreError> {
        let mut txids = Vec::new();
        for (link, _) in self.table.scan_prefix(&prefixed_key(PREFIX_BLOCK_TX, &block_id.to_be_bytes()))? {
            let tx_id = decode_u64(&link[PREFIX_BLOCK_TX.len() + 8..])?;
            if let Some(tx) = self.tx_by_id(tx_id)? {
                if tx.block_id == Some(block_id) {
                    txids.push(tx.txid);
                }
            }
        }
        Ok(txids)
    }

    pub fn pending_txs(&self, from_id: u64) -> Result<Vec<PendingTx>, StoreError> {
        let mut pending = Vec::new();
        for (key, _) in self.table.scan_prefix(PREFIX_PENDING)? {
            let id = decode_u64(&key[PREFIX_PENDING.len()..])?;
            if id < from_id {
                continue;
            }
            if let Some(tx) = self.tx_by_id(id)? {
                pending.push(PendingTx { id, txid: tx.txid });
            }
        }
        Ok(pending)
    }

    pub fn delete_invalid_txs(&self, ids: &[u64]) -> Result<u64, StoreError> {
        let _guard = self.lock()?;
        let mut batch = WriteBatch::default();
        let mut deleted = 0u64;
        for id in ids {
            match self.tx_by_id(*id)? {
                Some(tx) if tx.is_pending() => {
                    remove_tx(&mut batch, &tx);
                    deleted += 1;
                }
                Some(_) => tracing::debug!("tx {} was mined since it was judged invalid, keeping it", id),
                None => {}
            }
        }
        self.table.apply(batch)?;
        Ok(deleted)
    }

    // ─── Metadata ────────────────────────────────────────────────────

    pub fn get_meta(&self, key: &str) -> Result<Option<String>, StoreError> {
        match self.table.get(&prefixed_key(PREFIX_META, key.as_bytes()))? {
            Some(bytes) => String::from_utf8(bytes)
                .map(Some)
                .map_err(|e| StoreError::Serialize(format!("meta {}: {}", key, e))),
            None => Ok(None),
        }
    }

    pub fn set_meta(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut batch = WriteBatch::default();
        batch.put(prefixed_key(PREFIX_META, key.as_bytes()), value.as_bytes().to_vec());
        self.table.apply(batch)
    }

    pub fn flush(&self) -> Result<(), StoreError> {
        self.table.flush()
    }

    fn next_id(&self, seq: &[u8]) -> Result<u64, StoreError> {
        match self.table.get(seq)? {
            Some(bytes) => decode_u64(&bytes),
            None => Ok(1),
        }
    }

    fn load<V: DeserializeOwned>(&self, key: &[u8]) -> Result<Option<V>, StoreError> {
        match self.table.get(key)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }
}

impl<T: Table> ChainRows for Ledger<T> {
    fn block_by_hash(&self, hash: &str) -> Result<Option<StoredBlock>, StoreError> {
        match self.table.get(&prefixed_key(PREFIX_BLOCK_HASH, hash.as_bytes()))? {
            Some(id) => self.block_by_id(decode_u64(&id)?),
            None => Ok(None),
        }
    }

    fn canonical_at(&self, height: u64) -> Result<Option<StoredBlock>, StoreError> {
        match self.table.get(&prefixed_key(PREFIX_CANONICAL, &height.to_be_bytes()))? {
            Some(id) => self.block_by_id(decode_u64(&id)?),
            None => Ok(None),
        }
    }

    fn blocks_at(&self, height: u64) -> Result<Vec<StoredBlock>, StoreError> {
        let prefix = prefixed_key(PREFIX_BLOCK_HEIGHT, &height.to_be_bytes());
        let mut blocks = Vec::new();
        for (key, _) in self.table.scan_prefix(&prefix)? {
            let id = decode_u64(&key[prefix.len()..])?;
            if let Some(block) = self.block_by_id(id)? {
                blocks.push(block);
            }
        }
        Ok(blocks)
    }

    fn canonical_range(&self) -> Result<Option<(u64, u64)>, StoreError> {
        let first = self.table.first_with_prefix(PREFIX_CANONICAL)?;
        let last = self.table.last_with_prefix(PREFIX_CANONICAL)?;
        match (first, last) {
            (Some((lo, _)), Some((hi, _))) => Ok(Some((
                decode_u64(&lo[PREFIX_CANONICAL.len()..])?,
                decode_u64(&hi[PREFIX_CANONICAL.len()..])?,
            ))),
            _ => Ok(None),
        }
    }

    fn next_block_id(&self) -> Result<u64, StoreError> {
        self.next_id(SEQ_BLOCK)
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────

fn prefixed_key(prefix: &[u8], data: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(prefix.len() + data.len());
    key.extend_from_slice(prefix);
    key.extend_from_slice(data);
    key
}

fn height_key(height: u64, id: u64) -> Vec<u8> {
    // bht:<height(8)><id(8)>
    let mut key = prefixed_key(PREFIX_BLOCK_HEIGHT, &height.to_be_bytes());
    key.extend_from_slice(&id.to_be_bytes());
    key
}

fn block_tx_key(block_id: u64, tx_id: u64) -> Vec<u8> {
    let mut key = prefixed_key(PREFIX_BLOCK_TX, &block_id.to_be_bytes());
    key.extend_from_slice(&tx_id.to_be_bytes());
    key
}

fn remove_tx(batch: &mut WriteBatch, tx: &StoredTx) {
    batch.remove(prefixed_key(PREFIX_TX, &tx.id.to_be_bytes()));
    batch.remove(prefixed_key(PREFIX_TXID, tx.txid.as_bytes()));
    batch.remove(prefixed_key(PREFIX_PENDING, &tx.id.to_be_bytes()));
    if let Some(block_id) = tx.block_id {
        batch.remove(block_tx_key(block_id, tx.id));
    }
}

fn decode_u64(bytes: &[u8]) -> Result<u64, StoreError> {
    let buf: [u8; 8] = bytes.try_into()
        .map_err(|_| StoreError::Corrupt(format!("expected 8-byte id, got {} bytes", bytes.len())))?;
    Ok(u64::from_be_bytes(buf))
}

fn encode<V: Serialize>(value: &V) -> Result<Vec<u8>, StoreError> {
    bincode::serialize(value).map_err(|e| StoreError::Serialize(e.to_string()))
}

fn decode<V: DeserializeOwned>(bytes: &[u8]) -> Result<V, StoreError> {
    bincode::deserialize(bytes).map_err(|e| StoreError::Serialize(e.to_string()))
}
