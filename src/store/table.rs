//! Ordered key-value tables the ledger is written against: sled on disk, a BTreeMap in memory.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::path::Path;
use std::sync::RwLock;

use super::StoreError;

pub type Entry = (Vec<u8>, Vec<u8>);

/// Writes applied together or not at all
#[derive(Debug, Default)]
pub struct WriteBatch {
    ops: Vec<(Vec<u8>, Option<Vec<u8>>)>,
}

impl WriteBatch {
    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.ops.push((key, Some(value)));
    }

    pub fn remove(&mut self, key: Vec<u8>) {
        self.ops.push((key, None));
    }
}

pub trait Table: Send + Sync + 'static {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;
    /// All entries under `prefix`, in key order
    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<Entry>, StoreError>;
    fn first_with_prefix(&self, prefix: &[u8]) -> Result<Option<Entry>, StoreError>;
    fn last_with_prefix(&self, prefix: &[u8]) -> Result<Option<Entry>, StoreError>;
    /// Apply every op in order, atomically. A later op on the same key wins.
    fn apply(&self, batch: WriteBatch) -> Result<(), StoreError>;
    fn flush(&self) -> Result<(), StoreError>;
}

// ─── sled ────────────────────────────────────────────────────────────

pub struct SledTable {
    db: sled::Db,
}

impl SledTable {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let db = sled::open(path).map_err(db_err)?;
        Ok(SledTable { db })
    }
}

fn db_err(e: sled::Error) -> StoreError {
    StoreError::Db(e.to_string())
}

fn entry(item: sled::Result<(sled::IVec, sled::IVec)>) -> Result<Entry, StoreError> {
    let (k, v) = item.map_err(db_err)?;
    Ok((k.to_vec(), v.to_vec()))
}

impl Table for SledTable {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.db.get(key).map_err(db_err)?.map(|v| v.to_vec()))
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<Entry>, StoreError> {
        self.db.scan_prefix(prefix).map(entry).collect()
    }

    fn first_with_prefix(&self, prefix: &[u8]) -> Result<Option<Entry>, StoreError> {
        self.db.scan_prefix(prefix).next().map(entry).transpose()
    }

    fn last_with_prefix(&self, prefix: &[u8]) -> Result<Option<Entry>, StoreError> {
        self.db.scan_prefix(prefix).next_back().map(entry).transpose()
    }

    fn apply(&self, batch: WriteBatch) -> Result<(), StoreError> {
        // sled::Batch keeps the last write per key, which matches in-order application
        let mut sled_batch = sled::Batch::default();
        for (key, value) in batch.ops {
            match value {
                Some(value) => sled_batch.insert(key, value),
                None => sled_batch.remove(key),
            }
        }
        self.db.apply_batch(sled_batch).map_err(db_err)
    }

    fn flush(&self) -> Result<(), StoreError> {
        self.db.flush().map_err(db_err)?;
        Ok(())
    }
}

// ─── In-memory ───────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemTable {
    map: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemTable {
    pub fn new() -> Self { Self::default() }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, BTreeMap<Vec<u8>, Vec<u8>>>, StoreError> {
        self.map.read().map_err(|_| StoreError::Corrupt("memory table lock poisoned".into()))
    }

    fn range<'a>(map: &'a BTreeMap<Vec<u8>, Vec<u8>>, prefix: &[u8])
        -> impl DoubleEndedIterator<Item = (&'a Vec<u8>, &'a Vec<u8>)> {
        let upper = match prefix_upper_bound(prefix) {
            Some(end) => Bound::Excluded(end),
            None => Bound::Unbounded,
        };
        map.range((Bound::Included(prefix.to_vec()), upper))
    }
}

/// Smallest key greater than every key starting with `prefix`
fn prefix_upper_bound(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < u8::MAX {
            end.push(last + 1);
            return Some(end);
        }
    }
    None
}

impl Table for MemTable {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.read()?.get(key).cloned())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<Entry>, StoreError> {
        let map = self.read()?;
        Ok(Self::range(&map, prefix).map(|(k, v)| (k.clone(), v.clone())).collect())
    }

    fn first_with_prefix(&self, prefix: &[u8]) -> Result<Option<Entry>, StoreError> {
        let map = self.read()?;
        let first = Self::range(&map, prefix).next().map(|(k, v)| (k.clone(), v.clone()));
        Ok(first)
    }

    fn last_with_prefix(&self, prefix: &[u8]) -> Result<Option<Entry>, StoreError> {
        let map = self.read()?;
        let last = Self::range(&map, prefix).next_back().map(|(k, v)| (k.clone(), v.clone()));
        Ok(last)
    }

    fn apply(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut map = self.map.write()
            .map_err(|_| StoreError::Corrupt("memory table lock poisoned".into()))?;
        for (key, value) in batch.ops {
            match value {
                Some(value) => { map.insert(key, value); }
                None => { map.remove(&key); }
            }
        }
        Ok(())
    }

    fn flush(&self) -> Result<(), StoreError> { Ok(()) }
}
