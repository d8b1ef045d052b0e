use std::collections::BTreeMap;

use crate::core::types::Block;

/// Anything the orderer can sequence
pub trait HasHeight {
    fn height(&self) -> u64;
}

impl HasHeight for Block {
    fn height(&self) -> u64 { self.header.height }
}

/// Re-sequences items that arrive out of order: releases strictly ascending,
/// gap-free runs starting at `start` and holds everything past a gap.
pub struct Orderer<T> {
    next: u64,
    pending: BTreeMap<u64, T>,
}

impl<T: HasHeight> Orderer<T> {
    pub fn new(start: u64) -> Self {
        Orderer { next: start, pending: BTreeMap::new() }
    }

    /// Buffer `item` and return whatever is now contiguous. Heights already released are dropped.
    pub fn push(&mut self, item: T) -> Vec<T> {
        let height = item.height();
        if height < self.next {
            tracing::debug!("Orderer dropping duplicate height #{}", height);
            return Vec::new();
        }
        self.pending.insert(height, item);

        let mut ready = Vec::new();
        while let Some(item) = self.pending.remove(&self.next) {
            ready.push(item);
            self.next += 1;
        }
        ready
    }

    /// Next height the orderer is waiting for
    pub fn next_height(&self) -> u64 { self.next }

    pub fn buffered(&self) -> usize { self.pending.len() }
}

#[cfg(test)]
mod tests {
    use super::*;

    impl HasHeight for u64 {
        fn height(&self) -> u64 { *self }
    }

    #[test]
    fn test_releases_contiguous_runs() {
        let mut orderer = Orderer::new(10);
        assert!(orderer.push(12u64).is_empty());
        assert!(orderer.push(11u64).is_empty());
        assert_eq!(orderer.push(10u64), vec![10, 11, 12]);
        assert_eq!(orderer.next_height(), 13);
        assert_eq!(orderer.buffered(), 0);
    }

    #[test]
    fn test_holds_past_gap() {
        let mut orderer = Orderer::new(0);
        assert_eq!(orderer.push(0u64), vec![0]);
        assert!(orderer.push(2u64).is_empty());
        assert!(orderer.push(3u64).is_empty());
        assert_eq!(orderer.buffered(), 2);
        assert_eq!(orderer.push(1u64), vec![1, 2, 3]);
    }

    #[test]
    fn test_drops_already_released() {
        let mut orderer = Orderer::new(5);
        assert_eq!(orderer.push(5u64), vec![5]);
        assert!(orderer.push(5u64).is_empty());
        assert!(orderer.push(3u64).is_empty());
        assert_eq!(orderer.buffered(), 0);
    }
}
