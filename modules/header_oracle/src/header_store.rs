//! Arena of every known header, keyed by hash.
//!
//! Records never reference each other directly: parent and child links
//! are hashes resolved through the arena. The store also owns the
//! height-indexed best chain and accumulates the persistence batch for
//! the mutation in progress.

use std::collections::{BTreeSet, HashMap};

use opentxs_common::{BlockHash, Header, HeaderStatus, Height, Position, Reorg, Work};

use crate::{header_record::HeaderRecord, oracle_error::OracleError, stores::StoreBatch};

pub struct HeaderStore {
    /// All records, connected or not
    records: HashMap<BlockHash, HeaderRecord>,

    /// Parent to children links between connected records
    children: HashMap<BlockHash, BTreeSet<BlockHash>>,

    /// Best chain, indexed by height
    best: Vec<BlockHash>,

    genesis: BlockHash,

    next_sequence: u64,

    /// Writes not yet handed to the backend
    pending: StoreBatch,
}

impl HeaderStore {
    /// Fresh store holding only the genesis header.
    pub fn new(genesis: Header, genesis_work: Work) -> Self {
        let hash = genesis.hash;
        let record = HeaderRecord {
            header: genesis,
            work: Some(genesis_work),
            local_status: HeaderStatus::Normal,
            status: HeaderStatus::Normal,
            sequence: 0,
        };

        let mut pending = StoreBatch::default();
        pending.put_header(&record);
        pending.put_best(0, hash);

        Self {
            records: HashMap::from([(hash, record)]),
            children: HashMap::new(),
            best: vec![hash],
            genesis: hash,
            next_sequence: 1,
            pending,
        }
    }

    /// Rebuild from persisted records.
    ///
    /// The best chain is taken from `best_chain` when it is a contiguous,
    /// linked chain of connected records starting at genesis. Otherwise it
    /// is reset to genesis and every persisted height is scheduled for
    /// removal, leaving the caller to recompute the tip.
    pub fn restore(
        genesis: BlockHash,
        records: Vec<HeaderRecord>,
        best_chain: Vec<(Height, BlockHash)>,
    ) -> Result<Self, OracleError> {
        let mut store = Self {
            records: HashMap::with_capacity(records.len()),
            children: HashMap::new(),
            best: Vec::new(),
            genesis,
            next_sequence: 1,
            pending: StoreBatch::default(),
        };

        for record in records {
            store.next_sequence = store.next_sequence.max(record.sequence + 1);
            if record.is_connected() && record.header.hash != genesis {
                store
                    .children
                    .entry(record.header.parent_hash)
                    .or_default()
                    .insert(record.header.hash);
            }
            store.records.insert(record.header.hash, record);
        }

        if !store.records.contains_key(&genesis) {
            return Err(OracleError::UnknownHeader { hash: genesis });
        }

        if store.chain_is_linked(&best_chain) {
            store.best = best_chain.into_iter().map(|(_, hash)| hash).collect();
        } else {
            for (height, _) in best_chain {
                store.pending.remove_best(height);
            }
            store.best = vec![genesis];
            store.pending.put_best(0, genesis);
        }

        Ok(store)
    }

    fn chain_is_linked(&self, chain: &[(Height, BlockHash)]) -> bool {
        if chain.first().map(|(_, hash)| *hash) != Some(self.genesis) {
            return false;
        }
        chain.iter().enumerate().all(|(index, (height, hash))| {
            let Some(record) = self.records.get(hash) else {
                return false;
            };
            *height == index as Height
                && record.header.height == *height
                && record.is_connected()
                && (index == 0 || record.header.parent_hash == chain[index - 1].1)
        })
    }

    pub fn genesis(&self) -> BlockHash {
        self.genesis
    }

    pub fn get(&self, hash: &BlockHash) -> Option<&HeaderRecord> {
        self.records.get(hash)
    }

    pub fn contains(&self, hash: &BlockHash) -> bool {
        self.records.contains_key(hash)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> impl Iterator<Item = &HeaderRecord> {
        self.records.values()
    }

    /// Insert a previously unknown header.
    pub fn put(&mut self, record: HeaderRecord) -> Result<(), OracleError> {
        let hash = record.header.hash;
        if self.records.contains_key(&hash) {
            return Err(OracleError::DuplicateHeader { hash });
        }
        if record.header.parent_hash == hash {
            return Err(OracleError::invalid(hash, "header is its own parent"));
        }
        if record.header.height == 0 {
            return Err(OracleError::invalid(hash, "only genesis may have height 0"));
        }

        if record.is_connected() {
            self.children.entry(record.header.parent_hash).or_default().insert(hash);
        }
        self.pending.put_header(&record);
        self.records.insert(hash, record);
        Ok(())
    }

    /// Attach a disconnected record to its now connected parent.
    pub fn connect(
        &mut self,
        hash: &BlockHash,
        work: Work,
        local_status: HeaderStatus,
        status: HeaderStatus,
    ) -> Result<(), OracleError> {
        let sequence = self.take_sequence();
        let record = self.records.get_mut(hash).ok_or(OracleError::UnknownHeader { hash: *hash })?;
        record.work = Some(work);
        record.local_status = local_status;
        record.status = status;
        record.sequence = sequence;

        self.children.entry(record.header.parent_hash).or_default().insert(*hash);
        self.pending.put_header(record);
        Ok(())
    }

    /// Update local and effective status. Returns whether anything changed.
    pub fn set_status(
        &mut self,
        hash: &BlockHash,
        local_status: HeaderStatus,
        status: HeaderStatus,
    ) -> Result<bool, OracleError> {
        let record = self.records.get_mut(hash).ok_or(OracleError::UnknownHeader { hash: *hash })?;
        if record.local_status == local_status && record.status == status {
            return Ok(false);
        }
        record.local_status = local_status;
        record.status = status;
        self.pending.put_header(record);
        Ok(true)
    }

    /// Delete a record that was never connected.
    pub fn remove(&mut self, hash: &BlockHash) -> Option<HeaderRecord> {
        let record = self.records.get(hash)?;
        if record.is_connected() {
            return None;
        }
        self.pending.remove_header(*hash);
        self.records.remove(hash)
    }

    /// Next acceptance sequence number.
    pub fn take_sequence(&mut self) -> u64 {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        sequence
    }

    pub fn children(&self, hash: &BlockHash) -> impl Iterator<Item = &BlockHash> {
        self.children.get(hash).into_iter().flatten()
    }

    pub fn best_tip(&self) -> Position {
        let height = self.best.len().saturating_sub(1) as Height;
        let hash = self.best.last().copied().unwrap_or(self.genesis);
        Position::new(height, hash)
    }

    /// Record of the best tip. Genesis is always present, so this only
    /// fails on a corrupted store.
    pub fn best_record(&self) -> Result<&HeaderRecord, OracleError> {
        let tip = self.best_tip();
        self.records.get(&tip.hash).ok_or(OracleError::UnknownHeader { hash: tip.hash })
    }

    pub fn height_index(&self, height: Height) -> Option<BlockHash> {
        self.best.get(usize::try_from(height).ok()?).copied()
    }

    pub fn best_len(&self) -> usize {
        self.best.len()
    }

    pub fn is_in_best_chain(&self, position: &Position) -> bool {
        self.height_index(position.height) == Some(position.hash)
    }

    /// Ancestor of `hash` at `height`, by walking parent links.
    pub fn ancestor_at(&self, hash: &BlockHash, height: Height) -> Option<BlockHash> {
        let mut record = self.records.get(hash)?;
        if record.header.height < height {
            return None;
        }
        while record.header.height > height {
            record = self.records.get(&record.header.parent_hash)?;
        }
        Some(record.header.hash)
    }

    /// Most recent ancestor of `hash` (possibly itself) on the best chain.
    pub fn fork_point(&self, hash: &BlockHash) -> Result<Position, OracleError> {
        let mut record = self.records.get(hash).ok_or(OracleError::UnknownHeader { hash: *hash })?;
        while !self.is_in_best_chain(&record.position()) {
            let parent = record.header.parent_hash;
            record = self.records.get(&parent).ok_or(OracleError::UnknownHeader { hash: parent })?;
        }
        Ok(record.position())
    }

    /// Deepest header that is an ancestor of (or equal to) both `a` and `b`.
    pub fn common_ancestor(&self, a: &BlockHash, b: &BlockHash) -> Result<Position, OracleError> {
        let lookup = |hash: &BlockHash| {
            self.records.get(hash).ok_or(OracleError::UnknownHeader { hash: *hash })
        };
        let mut ra = lookup(a)?;
        let mut rb = lookup(b)?;

        // Walk the higher header down to the same height
        while ra.header.height > rb.header.height {
            ra = lookup(&ra.header.parent_hash)?;
        }
        while rb.header.height > ra.header.height {
            rb = lookup(&rb.header.parent_hash)?;
        }

        while ra.header.hash != rb.header.hash {
            ra = lookup(&ra.header.parent_hash)?;
            rb = lookup(&rb.header.parent_hash)?;
        }
        Ok(ra.position())
    }

    /// Positions from `from` up to `tip`, both inclusive, in ascending
    /// order. `from` must be an ancestor of `tip`.
    pub fn chain_between(&self, from: &Position, tip: &BlockHash) -> Result<Vec<Position>, OracleError> {
        let mut chain = Vec::new();
        let mut current = *tip;
        loop {
            let record =
                self.records.get(&current).ok_or(OracleError::UnknownHeader { hash: current })?;
            chain.push(record.position());
            if current == from.hash || record.header.height <= from.height {
                break;
            }
            current = record.header.parent_hash;
        }
        chain.reverse();
        Ok(chain)
    }

    /// Update the best chain index for a tip change. Disconnected heights
    /// are dropped and connected positions appended in ascending order.
    pub fn apply_reorg(&mut self, reorg: &Reorg) -> Result<(), OracleError> {
        if let Some(lowest) = reorg.disconnect.last() {
            for position in &reorg.disconnect {
                self.pending.remove_best(position.height);
            }
            self.best.truncate(lowest.height as usize);
        }

        for position in &reorg.connect {
            if position.height != self.best.len() as Height {
                return Err(OracleError::MissingBestChainEntry {
                    height: self.best.len() as Height,
                });
            }
            self.best.push(position.hash);
            self.pending.put_best(position.height, position.hash);
        }

        Ok(())
    }

    /// Pending persistence writes; the batch for a mutation is built here
    /// and handed to the backend when the mutation completes.
    pub fn batch(&mut self) -> &mut StoreBatch {
        &mut self.pending
    }

    pub fn take_batch(&mut self) -> StoreBatch {
        std::mem::take(&mut self.pending)
    }

    /// Put back a batch the backend refused, so the next commit writes it
    /// again. Writes pending since the take land on top of it.
    pub fn return_batch(&mut self, mut batch: StoreBatch) {
        let newer = std::mem::take(&mut self.pending);
        batch.headers.extend(newer.headers);
        batch.best_chain.extend(newer.best_chain);
        batch.disconnected.extend(newer.disconnected);
        if newer.checkpoint.is_some() {
            batch.checkpoint = newer.checkpoint;
        }
        if newer.version.is_some() {
            batch.version = newer.version;
        }
        self.pending = batch;
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

    fn header(n: u8, parent: u8, height: Height) -> Header {
        Header {
            hash: hash(n),
            parent_hash: hash(parent),
            height,
            work: Work::from(1),
            timestamp: 0,
        }
    }

    fn connected(n: u8, parent: u8, height: Height) -> HeaderRecord {
        HeaderRecord {
            header: header(n, parent, height),
            work: Some(Work::from(height + 1)),
            local_status: HeaderStatus::Normal,
            status: HeaderStatus::Normal,
            sequence: height,
        }
    }

    fn make_store() -> HeaderStore {
        HeaderStore::new(header(1, 0, 0), Work::from(1))
    }

    #[test]
    fn new_store_has_genesis_tip() {
        let mut store = make_store();
        assert_eq!(store.best_tip(), Position::new(0, hash(1)));
        assert_eq!(store.height_index(0), Some(hash(1)));
        assert_eq!(store.height_index(1), None);

        let batch = store.take_batch();
        assert!(batch.headers.contains_key(&hash(1)));
        assert_eq!(batch.best_chain.get(&0), Some(&Some(hash(1))));
        assert!(store.take_batch().is_empty());
    }

    #[test]
    fn returned_batch_keeps_newer_writes() {
        let mut store = make_store();
        let refused = store.take_batch();

        store.batch().remove_best(0);
        store.batch().put_header(&connected(2, 1, 1));
        store.return_batch(refused);

        let batch = store.take_batch();
        assert!(batch.headers.contains_key(&hash(1)));
        assert!(batch.headers.contains_key(&hash(2)));
        assert_eq!(batch.best_chain.get(&0), Some(&None));
    }

    #[test]
    fn put_rejects_duplicates_and_malformed_headers() {
        let mut store = make_store();
        store.put(connected(2, 1, 1)).unwrap();

        assert!(matches!(
            store.put(connected(2, 1, 1)),
            Err(OracleError::DuplicateHeader { .. })
        ));
        assert!(matches!(
            store.put(connected(3, 3, 2)),
            Err(OracleError::InvalidHeader { .. })
        ));
        assert!(matches!(
            store.put(connected(4, 1, 0)),
            Err(OracleError::InvalidHeader { .. })
        ));
    }

    #[test]
    fn ancestor_walk_follows_parents() {
        let mut store = make_store();
        store.put(connected(2, 1, 1)).unwrap();
        store.put(connected(3, 2, 2)).unwrap();
        store.put(connected(4, 3, 3)).unwrap();

        assert_eq!(store.ancestor_at(&hash(4), 1), Some(hash(2)));
        assert_eq!(store.ancestor_at(&hash(4), 3), Some(hash(4)));
        assert_eq!(store.ancestor_at(&hash(2), 3), None);
        assert_eq!(store.children(&hash(1)).copied().collect::<Vec<_>>(), vec![hash(2)]);
    }

    #[test]
    fn common_ancestor_of_diverging_branches() {
        let mut store = make_store();
        store.put(connected(2, 1, 1)).unwrap();
        store.put(connected(3, 2, 2)).unwrap();
        store.put(connected(4, 3, 3)).unwrap();
        store.put(connected(5, 2, 2)).unwrap();

        assert_eq!(store.common_ancestor(&hash(4), &hash(5)).unwrap(), Position::new(1, hash(2)));
        assert_eq!(store.common_ancestor(&hash(3), &hash(4)).unwrap(), Position::new(2, hash(3)));
        assert_eq!(
            store.chain_between(&Position::new(1, hash(2)), &hash(4)).unwrap(),
            vec![
                Position::new(1, hash(2)),
                Position::new(2, hash(3)),
                Position::new(3, hash(4)),
            ]
        );
    }

    #[test]
    fn fork_point_stops_at_best_chain() {
        let mut store = make_store();
        store.put(connected(2, 1, 1)).unwrap();
        store.put(connected(3, 2, 2)).unwrap();
        store
            .apply_reorg(&Reorg {
                disconnect: vec![],
                connect: vec![Position::new(1, hash(2))],
            })
            .unwrap();

        assert_eq!(store.fork_point(&hash(3)).unwrap(), Position::new(1, hash(2)));
        assert_eq!(store.fork_point(&hash(2)).unwrap(), Position::new(1, hash(2)));
        assert!(store.fork_point(&hash(9)).is_err());
    }

    #[test]
    fn apply_reorg_replaces_best_chain_suffix() {
        let mut store = make_store();
        store.put(connected(2, 1, 1)).unwrap();
        store.put(connected(3, 2, 2)).unwrap();
        store.put(connected(5, 1, 1)).unwrap();
        store
            .apply_reorg(&Reorg {
                disconnect: vec![],
                connect: vec![Position::new(1, hash(2)), Position::new(2, hash(3))],
            })
            .unwrap();
        store.take_batch();

        store
            .apply_reorg(&Reorg {
                disconnect: vec![Position::new(2, hash(3)), Position::new(1, hash(2))],
                connect: vec![Position::new(1, hash(5))],
            })
            .unwrap();

        assert_eq!(store.best_tip(), Position::new(1, hash(5)));
        assert_eq!(store.height_index(2), None);
        let batch = store.take_batch();
        assert_eq!(batch.best_chain.get(&1), Some(&Some(hash(5))));
        assert_eq!(batch.best_chain.get(&2), Some(&None));
    }

    #[test]
    fn apply_reorg_rejects_gaps() {
        let mut store = make_store();
        let result = store.apply_reorg(&Reorg {
            disconnect: vec![],
            connect: vec![Position::new(2, hash(3))],
        });
        assert!(matches!(
            result,
            Err(OracleError::MissingBestChainEntry { height: 1 })
        ));
    }

    #[test]
    fn restore_keeps_linked_best_chain() {
        let records = vec![
            connected(1, 0, 0),
            connected(2, 1, 1),
            HeaderRecord::disconnected(header(9, 8, 5)),
        ];
        let store =
            HeaderStore::restore(hash(1), records, vec![(0, hash(1)), (1, hash(2))]).unwrap();
        assert_eq!(store.best_tip(), Position::new(1, hash(2)));
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn restore_resets_broken_best_chain() {
        let records = vec![connected(1, 0, 0), connected(2, 1, 1)];
        let mut store =
            HeaderStore::restore(hash(1), records, vec![(0, hash(1)), (1, hash(7))]).unwrap();
        assert_eq!(store.best_tip(), Position::new(0, hash(1)));
        let batch = store.take_batch();
        assert_eq!(batch.best_chain.get(&1), Some(&None));
        assert_eq!(batch.best_chain.get(&0), Some(&Some(hash(1))));
    }

    #[test]
    fn restore_without_genesis_fails() {
        let records = vec![connected(2, 1, 1)];
        assert!(HeaderStore::restore(hash(1), records, vec![]).is_err());
    }

    #[test]
    fn connected_records_cannot_be_removed() {
        let mut store = make_store();
        store.put(connected(2, 1, 1)).unwrap();
        store.put(HeaderRecord::disconnected(header(4, 3, 3))).unwrap();
        assert!(store.remove(&hash(2)).is_none());
        assert!(store.remove(&hash(4)).is_some());
        assert!(!store.contains(&hash(4)));
    }
}
