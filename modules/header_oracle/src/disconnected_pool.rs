//! Headers waiting for an unknown parent.

use std::collections::{BTreeSet, HashMap};

use opentxs_common::BlockHash;

/// Multimap from a missing parent hash to the children waiting on it.
/// Only hashes are held; the records themselves live in the header store.
#[derive(Debug, Default)]
pub struct DisconnectedPool {
    waiting: HashMap<BlockHash, BTreeSet<BlockHash>>,
    count: usize,
}

impl DisconnectedPool {
    /// Rebuild from persisted (parent, child) pairs.
    pub fn restore(entries: impl IntoIterator<Item = (BlockHash, BlockHash)>) -> Self {
        let mut pool = Self::default();
        for (parent, child) in entries {
            pool.hold(parent, child);
        }
        pool
    }

    /// Park `child` until `parent` connects. Returns false if it was
    /// already held.
    pub fn hold(&mut self, parent: BlockHash, child: BlockHash) -> bool {
        let inserted = self.waiting.entry(parent).or_default().insert(child);
        if inserted {
            self.count += 1;
        }
        inserted
    }

    /// Remove and return every child waiting on `parent`.
    pub fn reconnect(&mut self, parent: &BlockHash) -> Vec<BlockHash> {
        let children: Vec<BlockHash> =
            self.waiting.remove(parent).map(|set| set.into_iter().collect()).unwrap_or_default();
        self.count -= children.len();
        children
    }

    pub fn contains(&self, parent: &BlockHash, child: &BlockHash) -> bool {
        self.waiting.get(parent).is_some_and(|set| set.contains(child))
    }

    /// Parent hashes that are still missing.
    pub fn missing_parents(&self) -> impl Iterator<Item = &BlockHash> {
        self.waiting.keys()
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(n: u8) -> BlockHash {
        let mut bytes = [0u8; 32];
        bytes[0] = n;
        BlockHash::from(bytes)
    }

    #[test]
    fn reconnect_drains_children_of_parent() {
        let mut pool = DisconnectedPool::default();
        assert!(pool.hold(hash(1), hash(2)));
        assert!(pool.hold(hash(1), hash(3)));
        assert!(pool.hold(hash(5), hash(6)));
        assert!(!pool.hold(hash(1), hash(2)));
        assert_eq!(pool.len(), 3);

        assert_eq!(pool.reconnect(&hash(1)), vec![hash(2), hash(3)]);
        assert_eq!(pool.len(), 1);
        assert!(pool.reconnect(&hash(1)).is_empty());
        assert!(pool.contains(&hash(5), &hash(6)));
        assert!(!pool.contains(&hash(1), &hash(2)));
    }

    #[test]
    fn restore_rebuilds_from_pairs() {
        let pool = DisconnectedPool::restore([(hash(1), hash(2)), (hash(3), hash(4))]);
        assert_eq!(pool.len(), 2);
        let mut missing: Vec<_> = pool.missing_parents().copied().collect();
        missing.sort();
        assert_eq!(missing, vec![hash(1), hash(3)]);
    }
}
