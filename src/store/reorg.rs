//! Canonical chain reconciliation.
//!
//! Every block insert is turned into an [`InsertPlan`]: the final state of each
//! row the insert touches plus the canonical height index entries that change.
//! The planner only reads through [`ChainRows`], so the same rules run against
//! sled and against the in-memory table, and the caller applies the plan in one
//! atomic batch while holding the store's write lock.

use std::collections::{BTreeMap, HashMap};

use super::StoreError;
use crate::core::types::*;

/// Read-only view of the stored block rows
pub trait ChainRows {
    fn block_by_hash(&self, hash: &str) -> Result<Option<StoredBlock>, StoreError>;
    /// The non-orphan block at `height`
    fn canonical_at(&self, height: u64) -> Result<Option<StoredBlock>, StoreError>;
    /// Every recorded block at `height`, orphaned or not
    fn blocks_at(&self, height: u64) -> Result<Vec<StoredBlock>, StoreError>;
    /// Lowest and highest canonical heights, `None` when nothing is canonical
    fn canonical_range(&self) -> Result<Option<(u64, u64)>, StoreError>;
    fn next_block_id(&self) -> Result<u64, StoreError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct InsertPlan {
    pub id: u64,
    pub is_new: bool,
    pub is_orphan: bool,
    /// Final state of every touched row, the inserted block included
    pub rows: Vec<StoredBlock>,
    /// Canonical index entries that change; `None` clears the height
    pub canonical: BTreeMap<u64, Option<u64>>,
    /// Previously canonical blocks this insert orphaned
    pub orphaned: usize,
    /// Blocks this insert made canonical, the inserted one included
    pub adopted: usize,
}

enum Ancestor {
    Canonical(StoredBlock),
    Missing,
}

/// Work-in-progress overlay on top of the stored rows
struct Planner<'a, R: ChainRows> {
    rows: &'a R,
    touched: HashMap<u64, StoredBlock>,
    new_row: Option<u64>,
    canonical: BTreeMap<u64, Option<u64>>,
    orphaned: usize,
    adopted: usize,
}

impl<'a, R: ChainRows> Planner<'a, R> {
    fn new(rows: &'a R) -> Self {
        Planner {
            rows,
            touched: HashMap::new(),
            new_row: None,
            canonical: BTreeMap::new(),
            orphaned: 0,
            adopted: 0,
        }
    }

    fn overlay(&self, stored: StoredBlock) -> StoredBlock {
        self.touched.get(&stored.id).cloned().unwrap_or(stored)
    }

    fn row(&self, id: u64) -> Result<StoredBlock, StoreError> {
        self.touched.get(&id).cloned()
            .ok_or_else(|| StoreError::Corrupt(format!("block row {} missing from plan", id)))
    }

    fn by_hash(&self, hash: &str) -> Result<Option<StoredBlock>, StoreError> {
        if let Some(id) = self.new_row {
            let row = self.row(id)?;
            if row.hash() == hash {
                return Ok(Some(row));
            }
        }
        Ok(self.rows.block_by_hash(hash)?.map(|b| self.overlay(b)))
    }

    fn canonical_at(&self, height: u64) -> Result<Option<StoredBlock>, StoreError> {
        match self.canonical.get(&height) {
            Some(Some(id)) => Ok(Some(self.row(*id)?)),
            Some(None) => Ok(None),
            None => Ok(self.rows.canonical_at(height)?.map(|b| self.overlay(b))),
        }
    }

    fn blocks_at(&self, height: u64) -> Result<Vec<StoredBlock>, StoreError> {
        let mut blocks: Vec<StoredBlock> = self.rows.blocks_at(height)?
            .into_iter()
            .map(|b| self.overlay(b))
            .collect();
        if let Some(id) = self.new_row {
            let row = self.row(id)?;
            if row.height() == height {
                blocks.push(row);
            }
        }
        Ok(blocks)
    }

    fn touch(&mut self, row: StoredBlock) {
        self.touched.insert(row.id, row);
    }

    fn set_next(&mut self, id: u64, next: Option<String>) -> Result<(), StoreError> {
        let mut row = self.row(id)?;
        row.header.next_hash = next;
        self.touch(row);
        Ok(())
    }

    fn canonize(&mut self, mut row: StoredBlock) {
        if row.is_orphan {
            self.adopted += 1;
        }
        row.is_orphan = false;
        self.canonical.insert(row.height(), Some(row.id));
        self.touch(row);
    }

    /// Orphan the canonical blocks at `from..=to`; the block below becomes the tip
    fn orphan_range(&mut self, from: u64, to: u64) -> Result<(), StoreError> {
        let before = self.orphaned;
        for height in from..=to {
            if let Some(mut block) = self.canonical_at(height)? {
                block.is_orphan = true;
                self.canonical.insert(height, None);
                self.touch(block);
                self.orphaned += 1;
            }
        }
        if self.orphaned > before && from > 0 {
            if let Some(mut below) = self.canonical_at(from - 1)? {
                below.header.next_hash = None;
                self.touch(below);
            }
        }
        Ok(())
    }

    /// Adopt recorded descendants of the canonical tip `top_id` for as long as they chain on
    fn forward_link(&mut self, mut top_id: u64) -> Result<(), StoreError> {
        loop {
            let top = self.row(top_id)?;
            let next_height = top.height() + 1;
            if self.canonical_at(next_height)?.is_some() {
                return Ok(());
            }
            let child = self.blocks_at(next_height)?
                .into_iter()
                .filter(|b| b.is_orphan && b.prev_hash() == Some(top.hash()))
                .max_by_key(|b| b.id);
            match child {
                Some(child) => {
                    let child_id = child.id;
                    self.set_next(top_id, Some(child.hash().to_string()))?;
                    self.canonize(child);
                    top_id = child_id;
                }
                None => {
                    self.set_next(top_id, None)?;
                    return Ok(());
                }
            }
        }
    }

    /// Make `branch` (ordered top first) canonical and link it above `parent`
    fn adopt_branch(&mut self, branch: &[u64], parent: Option<u64>) -> Result<(), StoreError> {
        let mut below = parent;
        for id in branch.iter().rev() {
            let hash = self.row(*id)?.header.hash;
            if let Some(below_id) = below {
                self.set_next(below_id, Some(hash))?;
            }
            let row = self.row(*id)?;
            self.canonize(row);
            below = Some(*id);
        }
        Ok(())
    }

    fn finish(self, id: u64, is_new: bool) -> Result<InsertPlan, StoreError> {
        let is_orphan = self.row(id)?.is_orphan;
        let mut rows: Vec<StoredBlock> = self.touched.into_values().collect();
        rows.sort_by_key(|r| r.id);
        Ok(InsertPlan {
            id,
            is_new,
            is_orphan,
            rows,
            canonical: self.canonical,
            orphaned: self.orphaned,
            adopted: self.adopted,
        })
    }
}

/// Decide where `header` lands in the chain.
///
/// `recover` allows a block that does not attach to the canonical parent to be
/// inserted below the canonical tip; without it such an insert is rejected and
/// nothing changes.
pub fn plan_insert<R: ChainRows>(
    rows: &R,
    header: &BlockHeader,
    recover: bool,
    max_depth: u64,
) -> Result<InsertPlan, StoreError> {
    let height = header.height;
    let existing = rows.block_by_hash(&header.hash)?;
    if let Some(stored) = &existing {
        if stored.height() != height {
            return Err(StoreError::HashHeightConflict {
                hash: header.hash.clone(),
                stored: stored.height(),
                got: height,
            });
        }
    }

    let mut planner = Planner::new(rows);
    let (id, is_new) = match &existing {
        Some(stored) => (stored.id, false),
        None => (rows.next_block_id()?, true),
    };
    let mut row = StoredBlock { id, header: header.clone(), is_orphan: true };
    if let Some(stored) = existing {
        row.is_orphan = stored.is_orphan;
        row.header.next_hash = stored.header.next_hash;
    } else {
        row.header.next_hash = None;
        planner.new_row = Some(id);
    }
    planner.touch(row.clone());

    let Some((base, tip)) = rows.canonical_range()? else {
        planner.canonize(row);
        planner.forward_link(id)?;
        return planner.finish(id, is_new);
    };

    if let Some(current) = planner.canonical_at(height)? {
        if current.id == id {
            return planner.finish(id, is_new);
        }
    }

    let parent = match height {
        0 => None,
        h => planner.canonical_at(h - 1)?,
    };
    if let (Some(parent), Some(prev)) = (&parent, header.prev_hash.as_deref()) {
        if parent.hash() == prev {
            planner.touch(parent.clone());
            planner.orphan_range(height, tip)?;
            planner.adopt_branch(&[id], Some(parent.id))?;
            planner.forward_link(id)?;
            return planner.finish(id, is_new);
        }
    }

    if height < tip && !recover {
        return Err(StoreError::BelowCanonicalTip { height, hash: header.hash.clone(), tip });
    }

    let mut branch = vec![id];
    let mut cursor = header.prev_hash.clone();
    let ancestor = loop {
        let Some(parent_hash) = cursor else { break Ancestor::Missing };
        match planner.by_hash(&parent_hash)? {
            None => break Ancestor::Missing,
            Some(p) if !p.is_orphan => break Ancestor::Canonical(p),
            Some(p) => {
                if branch.len() as u64 >= max_depth {
                    return Err(StoreError::ReorgTooDeep { height, depth: max_depth });
                }
                cursor = p.header.prev_hash.clone();
                branch.push(p.id);
                planner.touch(p);
            }
        }
    };

    match ancestor {
        Ancestor::Canonical(fork) => {
            planner.touch(fork.clone());
            planner.orphan_range(fork.height() + 1, tip)?;
            planner.adopt_branch(&branch, Some(fork.id))?;
            planner.forward_link(id)?;
        }
        Ancestor::Missing => {
            let lowest = planner.row(*branch.last().unwrap_or(&id))?;
            // The node's chain at `lowest - 1` is not ours, so our blocks from there up are stale.
            // The canonical base stays as the anchor for the walk back.
            if lowest.height() > base + 1 && lowest.height() - 1 <= tip {
                planner.orphan_range(lowest.height() - 1, tip)?;
            }
            if height + 1 == base {
                if let Some(first) = planner.canonical_at(base)? {
                    if first.prev_hash() == Some(header.hash.as_str()) {
                        planner.adopt_branch(&branch, None)?;
                        planner.set_next(id, Some(first.hash().to_string()))?;
                    }
                }
            }
        }
    }

    planner.finish(id, is_new)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::BTreeMap;

    /// Minimal row set: canonical index derived from the rows themselves
    #[derive(Default)]
    pub(crate) struct RowSet {
        rows: BTreeMap<u64, StoredBlock>,
    }

    impl ChainRows for RowSet {
        fn block_by_hash(&self, hash: &str) -> Result<Option<StoredBlock>, StoreError> {
            Ok(self.rows.values().find(|b| b.hash() == hash).cloned())
        }
        fn canonical_at(&self, height: u64) -> Result<Option<StoredBlock>, StoreError> {
            Ok(self.rows.values().find(|b| b.height() == height && !b.is_orphan).cloned())
        }
        fn blocks_at(&self, height: u64) -> Result<Vec<StoredBlock>, StoreError> {
            Ok(self.rows.values().filter(|b| b.height() == height).cloned().collect())
        }
        fn canonical_range(&self) -> Result<Option<(u64, u64)>, StoreError> {
            let heights: Vec<u64> = self.rows.values().filter(|b| !b.is_orphan).map(|b| b.height()).collect();
            Ok(heights.iter().min().map(|min| (*min, *heights.iter().max().unwrap_or(min))))
        }
        fn next_block_id(&self) -> Result<u64, StoreError> {
            Ok(self.rows.keys().next_back().map(|id| id + 1).unwrap_or(1))
        }
    }

    impl RowSet {
        fn insert(&mut self, height: u64, hash: &str, prev: &str, recover: bool) -> Result<InsertPlan, StoreError> {
            let header = BlockHeader {
                hash: hash.into(),
                height,
                prev_hash: Some(prev.into()),
                ..Default::default()
            };
            let plan = plan_insert(self, &header, recover, 1000)?;
            for row in &plan.rows {
                self.rows.insert(row.id, row.clone());
            }
            for (h, entry) in &plan.canonical {
                let derived = self.canonical_at(*h).unwrap().map(|b| b.id);
                assert_eq!(derived, *entry, "canonical index disagrees with rows at {}", h);
            }
            self.assert_invariants();
            Ok(plan)
        }

        fn add(&mut self, height: u64, hash: &str, prev: &str) {
            self.insert(height, hash, prev, false).unwrap();
        }

        fn is_canonical(&self, hash: &str) -> bool {
            !self.block_by_hash(hash).unwrap().unwrap().is_orphan
        }

        fn assert_canonical(&self, hashes: &[&str]) {
            for hash in hashes {
                assert!(self.is_canonical(hash), "{} should be canonical", hash);
            }
        }

        fn assert_orphaned(&self, hashes: &[&str]) {
            for hash in hashes {
                assert!(!self.is_canonical(hash), "{} should be orphaned", hash);
            }
        }

        fn tip(&self) -> Option<u64> {
            self.canonical_range().unwrap().map(|(_, tip)| tip)
        }

        /// One canonical block per height, contiguous, linked both ways
        fn assert_invariants(&self) {
            let Some((base, tip)) = self.canonical_range().unwrap() else { return };
            for h in base..=tip {
                let at: Vec<_> = self.rows.values().filter(|b| b.height() == h && !b.is_orphan).collect();
                assert_eq!(at.len(), 1, "height {} has {} canonical blocks", h, at.len());
                if h < tip {
                    let next = self.canonical_at(h + 1).unwrap().unwrap();
                    assert_eq!(at[0].header.next_hash.as_deref(), Some(next.hash()), "next link at {}", h);
                    assert_eq!(next.prev_hash(), Some(at[0].hash()), "prev link at {}", h + 1);
                } else {
                    assert_eq!(at[0].header.next_hash, None, "tip must not point forward");
                }
            }
        }
    }

    fn base_chain() -> RowSet {
        let mut set = RowSet::default();
        set.add(10, "10", "9");
        set
    }

    #[test]
    fn test_bootstrap_and_extend() {
        let mut set = base_chain();
        set.add(11, "11", "10");
        set.add(12, "12", "11");
        set.assert_canonical(&["10", "11", "12"]);
        assert_eq!(set.tip(), Some(12));
    }

    #[test]
    fn test_fork_same_height() {
        let mut set = base_chain();
        set.add(11, "11", "10");
        let plan = set.insert(11, "11a", "10", false).unwrap();
        assert_eq!(plan.orphaned, 1);
        set.assert_canonical(&["10", "11a"]);
        set.assert_orphaned(&["11"]);
    }

    #[test]
    fn test_competing_block_at_tip() {
        let mut set = RowSet::default();
        set.add(9, "9", "8");
        set.add(10, "A", "9");
        set.add(10, "B", "9");
        set.assert_canonical(&["9", "B"]);
        set.assert_orphaned(&["A"]);
    }

    #[test]
    fn test_multi_block_reorg() {
        let mut set = base_chain();
        set.add(11, "11", "10");
        set.add(12, "12", "11");

        set.add(11, "11a", "10");
        set.add(12, "12a", "11a");
        set.assert_canonical(&["10", "11a", "12a"]);
        set.assert_orphaned(&["11", "12"]);

        set.add(13, "13a", "12a");
        set.assert_canonical(&["10", "11a", "12a", "13a"]);
        set.assert_orphaned(&["11", "12"]);
    }

    #[test]
    fn test_fork_new_tip_with_unknown_parent() {
        let mut set = base_chain();
        set.add(11, "11", "10");

        // parent 11a never seen: our 11 is no longer the node's
        set.add(12, "12a", "11a");
        set.assert_canonical(&["10"]);
        set.assert_orphaned(&["11", "12a"]);

        // 11a arrives and the recorded 12a chains onto it
        set.add(11, "11a", "10");
        set.assert_canonical(&["10", "11a", "12a"]);
        set.assert_orphaned(&["11"]);

        set.add(13, "13a", "12a");
        set.assert_canonical(&["10", "11a", "12a", "13a"]);
    }

    #[test]
    fn test_reject_stale_block_below_tip() {
        let mut set = base_chain();
        set.add(11, "11", "10");
        set.add(12, "12a", "11a");
        set.add(11, "11a", "10");
        set.add(13, "13a", "12a");

        let before: Vec<StoredBlock> = set.rows.values().cloned().collect();
        let err = set.insert(12, "12", "11", false).unwrap_err();
        assert!(matches!(err, StoreError::BelowCanonicalTip { height: 12, tip: 13, .. }));
        let after: Vec<StoredBlock> = set.rows.values().cloned().collect();
        assert_eq!(before, after);
    }

    #[test]
    fn test_recover_allows_walk_below_tip() {
        let mut set = base_chain();
        set.add(11, "11", "10");
        set.add(12, "12", "11");
        set.add(12, "12a", "11a");
        set.add(11, "11a", "10");
        set.add(13, "13a", "12a");
        set.assert_canonical(&["11a", "12a", "13a"]);

        // the old branch comes back through a recorded walk from below the tip
        set.insert(12, "12", "11", true).unwrap();
        set.assert_canonical(&["10", "11", "12"]);
        set.assert_orphaned(&["11a", "12a", "13a"]);
        assert_eq!(set.tip(), Some(12));
    }

    #[test]
    fn test_triple_fork() {
        let mut set = base_chain();
        set.add(11, "11", "10");
        set.add(12, "12", "11");

        set.add(12, "12a", "11a");
        set.add(11, "11a", "10");
        set.assert_canonical(&["10", "11a"]);
        set.assert_orphaned(&["11", "12"]);

        set.add(12, "12b", "11b");
        set.add(11, "11b", "10");
        set.assert_canonical(&["10", "11b", "12b"]);
        set.assert_orphaned(&["11", "12", "11a", "12a"]);

        set.add(13, "13a", "12a");
        set.assert_canonical(&["10", "11a", "12a", "13a"]);
        set.assert_orphaned(&["11", "12", "11b", "12b"]);

        set.add(13, "13", "12");
        set.assert_canonical(&["10", "11", "12", "13"]);
        set.assert_orphaned(&["11a", "12a", "13a", "11b", "12b"]);
    }

    #[test]
    fn test_gap_filled_in_one_pass() {
        let mut set = base_chain();
        let plan = set.insert(14, "14", "13", false).unwrap();
        assert!(plan.is_orphan);
        set.assert_orphaned(&["14"]);

        set.add(11, "11", "10");
        set.add(12, "12", "11");
        set.assert_orphaned(&["14"]);

        let plan = set.insert(13, "13", "12", false).unwrap();
        assert_eq!(plan.adopted, 2);
        set.assert_canonical(&["10", "11", "12", "13", "14"]);
        assert_eq!(set.tip(), Some(14));
    }

    #[test]
    fn test_skipped_block_joins_on_walk() {
        let mut set = base_chain();
        set.add(12, "12", "11");
        set.add(13, "13", "12");
        set.assert_orphaned(&["12", "13"]);

        set.add(11, "11", "10");
        set.assert_canonical(&["10", "11", "12", "13"]);

        set.add(14, "14", "13");
        set.assert_canonical(&["10", "11", "12", "13", "14"]);
    }

    #[test]
    fn test_idempotent_insert() {
        let mut set = base_chain();
        let first = set.insert(11, "11", "10", false).unwrap();
        let snapshot: Vec<StoredBlock> = set.rows.values().cloned().collect();

        let second = set.insert(11, "11", "10", false).unwrap();
        assert_eq!(first.id, second.id);
        assert!(!second.is_new);
        assert_eq!(second.orphaned, 0);
        let again: Vec<StoredBlock> = set.rows.values().cloned().collect();
        assert_eq!(snapshot, again);
    }

    #[test]
    fn test_reinsert_orphan_keeps_state() {
        let mut set = base_chain();
        set.add(14, "14", "13");
        let snapshot: Vec<StoredBlock> = set.rows.values().cloned().collect();
        set.add(14, "14", "13");
        let again: Vec<StoredBlock> = set.rows.values().cloned().collect();
        assert_eq!(snapshot, again);
    }

    #[test]
    fn test_hash_at_two_heights_rejected() {
        let mut set = base_chain();
        let err = set.insert(11, "10", "10", false).unwrap_err();
        assert!(matches!(err, StoreError::HashHeightConflict { stored: 10, got: 11, .. }));
    }

    #[test]
    fn test_reorg_too_deep() {
        let mut set = base_chain();
        set.add(11, "11", "10");
        // a long side branch whose root never arrives, learned top-down
        for h in (12..=20).rev() {
            let prev = if h == 12 { "11x".to_string() } else { format!("{}x", h - 1) };
            set.insert(h, &format!("{}x", h), &prev, true).unwrap();
        }
        let header = BlockHeader {
            hash: "21x".into(),
            height: 21,
            prev_hash: Some("20x".into()),
            ..Default::default()
        };
        let err = plan_insert(&set, &header, false, 3).unwrap_err();
        assert!(matches!(err, StoreError::ReorgTooDeep { height: 21, depth: 3 }));
    }

    #[test]
    fn test_backfill_below_base_links_up() {
        let mut set = base_chain();
        set.add(11, "11", "10");

        set.insert(8, "8", "7", true).unwrap();
        set.assert_orphaned(&["8"]);
        set.insert(9, "9", "8", true).unwrap();
        set.assert_canonical(&["8", "9", "10", "11"]);
        assert_eq!(set.canonical_range().unwrap(), Some((8, 11)));
    }
}
